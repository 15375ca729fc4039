//! Client sessions, open checkpoint handles, and in-flight requests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::server::{ClientCall, ConnId};
use crate::store::{CkptHandle, ClientHandle, NodeName, OpenFlags, RequestNo};

/// One client call awaiting completion.
#[derive(Debug, Clone)]
pub struct Request {
    pub req_no: RequestNo,
    pub call: ClientCall,

    /// Checkpoint name the call resolves to, once known.
    pub name: Option<String>,

    /// Node the request was last sent to; `None` while handled locally or
    /// deferred.
    pub to_node: Option<NodeName>,
}

impl Request {
    pub fn new(req_no: RequestNo, call: ClientCall) -> Self {
        Request {
            req_no,
            call,
            name: None,
            to_node: None,
        }
    }

    /// Whether the call is carried to the active node of its checkpoint.
    pub fn is_routed(&self) -> bool {
        !matches!(
            self.call,
            ClientCall::Init { .. }
                | ClientCall::Finalize
                | ClientCall::Open { .. }
                | ClientCall::Close { .. }
                | ClientCall::Unlink { .. }
                | ClientCall::ActiveSet { .. }
        )
    }
}

/// One initialized client.
#[derive(Debug)]
pub struct Client {
    pub handle: ClientHandle,

    /// External connection the client talks through.
    pub conn: ConnId,

    /// Checkpoints opened by this client.
    pub open_ckpts: BTreeSet<CkptHandle>,

    /// Map from request number -> request in flight.
    pub requests: BTreeMap<RequestNo, Request>,

    /// Requests held back until a pause or open race ends.
    pub deferred: VecDeque<RequestNo>,
}

impl Client {
    pub fn new(handle: ClientHandle, conn: ConnId) -> Self {
        Client {
            handle,
            conn,
            open_ckpts: BTreeSet::new(),
            requests: BTreeMap::new(),
            deferred: VecDeque::new(),
        }
    }

    /// Whether finalize must be refused, ignoring the finalize request
    /// itself.
    pub fn is_busy_besides(&self, req_no: RequestNo) -> bool {
        !self.open_ckpts.is_empty()
            || self.deferred.iter().any(|&r| r != req_no)
            || self.requests.keys().any(|&r| r != req_no)
    }
}

/// Who holds an open checkpoint handle.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Opener {
    /// A client of this node.
    Local(ClientHandle),
    /// A client of another node that opened against our replica.
    Remote { host: NodeName, client: ClientHandle },
}

/// Where the replica behind an open checkpoint lives.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Target {
    /// This node's replica of the checkpoint.
    LocalReplica,
    /// Another node's replica. Calls go to `active_node`; the open
    /// reference itself lives at `handle_node` under `remote_handle`.
    Remote {
        active_node: NodeName,
        handle_node: NodeName,
        remote_handle: CkptHandle,
    },
}

/// One open checkpoint handle.
#[derive(Debug, Clone)]
pub struct OpenCheckpoint {
    pub handle: CkptHandle,
    pub name: String,
    pub flags: OpenFlags,
    pub opener: Opener,
    pub target: Target,
}

impl OpenCheckpoint {
    pub fn is_local_replica(&self) -> bool {
        self.target == Target::LocalReplica
    }
}
