//! Checkpoint service: the per-node protocol engine.
//!
//! A `Service` owns every piece of checkpoint state held by one node and
//! reacts to three kinds of input: client requests, peer messages, and
//! timer expiries. It never blocks and never touches sockets itself;
//! outgoing traffic goes through the `ClusterTransport` and `ClientChannel`
//! seams so the same engine runs under the TCP reactor and in-memory test
//! clusters alike.

mod failover;
mod messages;
mod open;
mod recovery;
mod replication;
mod request;
mod session;
mod update;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::server::{ApiReply, ApiRequest, ConnId, ReplyData};
use crate::store::{
    CkptHandle, CkptResult, ClientHandle, NodeName, OpNo, Operation, Replica,
    RequestNo,
};
use crate::utils::{CheckpointdError, TimerWheel};

use serde::Deserialize;

use tokio::time::{Duration, Instant};

pub use messages::{
    CkptMessage, FieldMsg, OpenParam, OpenVerdict, Subtype, MSG_TYPE,
    PROTOCOL_VERSION,
};
pub use session::{Client, OpenCheckpoint, Opener, Request, Target};

use failover::ActiveSwitch;
use open::OpenRace;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Upper bound on how long a client request may stay unanswered, in
    /// millisecs.
    pub request_timeout_ms: u64,

    /// How long an operation may wait in the active node's queue or for
    /// its participants, in millisecs.
    pub operation_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            request_timeout_ms: 10000,
            operation_timeout_ms: 8000,
        }
    }
}

/// Outgoing peer message seam.
pub trait ClusterTransport {
    /// Sends a message to one peer node.
    fn send_to_node(
        &mut self,
        node: &str,
        msg: FieldMsg,
    ) -> Result<(), CheckpointdError>;

    /// Sends a message to each of the given peer nodes.
    fn send_to_nodes(
        &mut self,
        nodes: &[NodeName],
        msg: FieldMsg,
    ) -> Result<(), CheckpointdError> {
        for node in nodes {
            self.send_to_node(node, msg.clone())?;
        }
        Ok(())
    }

    /// Sends a message to every connected peer node.
    fn broadcast(&mut self, msg: FieldMsg) -> Result<(), CheckpointdError>;
}

/// Outgoing client reply seam.
pub trait ClientChannel {
    fn send_reply(
        &mut self,
        conn: ConnId,
        reply: ApiReply,
    ) -> Result<(), CheckpointdError>;
}

/// Key of a timer in the service's timer wheel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Deadline of a client request.
    Request {
        client: ClientHandle,
        req_no: RequestNo,
    },
    /// Deadline of an operation owned by this node as active.
    Operation { name: String, op_no: OpNo },
    /// Retention expiry of an unreferenced checkpoint.
    Retention { name: String },
}

/// Builds a message about operation `op` of checkpoint `name`, sent by me
/// as its active node.
fn op_message(
    me: &str,
    name: &str,
    op: &Operation,
    subtype: Subtype,
) -> CkptMessage {
    CkptMessage::new(subtype, me, name)
        .with_origin(&op.origin.host, op.origin.client, op.origin.req_no)
        .with_op(op.kind(), op.op_no)
        .with_active(me)
}

/// Handler of one message subtype.
type MsgHandler = fn(&mut Service, CkptMessage) -> Result<(), CheckpointdError>;

/// Checkpoint service of one node.
pub struct Service {
    /// My node name.
    me: NodeName,

    /// Configuration parameters struct.
    config: ServiceConfig,

    transport: Box<dyn ClusterTransport + Send>,
    replies: Box<dyn ClientChannel + Send>,

    /// Messages addressed to myself, handled once the current input is.
    loopback: VecDeque<CkptMessage>,

    /// Map from peer node name -> whether it is currently up.
    node_status: BTreeMap<NodeName, bool>,

    /// Map from checkpoint name -> local replica.
    replicas: HashMap<String, Replica>,

    /// Names of checkpoints announced by the group and not unlinked since,
    /// whether or not a replica lives here.
    known_ckpts: BTreeSet<String>,

    /// Map from client handle -> client session.
    clients: HashMap<ClientHandle, Client>,

    /// Map from checkpoint handle -> open checkpoint, for both local
    /// clients and remote openers of local replicas.
    open_ckpts: HashMap<CkptHandle, OpenCheckpoint>,

    /// Map from checkpoint name -> open race in progress.
    races: HashMap<String, OpenRace>,

    /// Map from checkpoint name -> set-active handover I requested.
    switches: HashMap<String, ActiveSwitch>,

    timers: TimerWheel<TimerKey>,

    next_client: ClientHandle,
    next_ckpt: CkptHandle,
}

// Service public API implementation
impl Service {
    /// Creates a new service for node `me`.
    pub fn new(
        me: impl Into<NodeName>,
        config: ServiceConfig,
        transport: Box<dyn ClusterTransport + Send>,
        replies: Box<dyn ClientChannel + Send>,
    ) -> Self {
        Service {
            me: me.into(),
            config,
            transport,
            replies,
            loopback: VecDeque::new(),
            node_status: BTreeMap::new(),
            replicas: HashMap::new(),
            known_ckpts: BTreeSet::new(),
            clients: HashMap::new(),
            open_ckpts: HashMap::new(),
            races: HashMap::new(),
            switches: HashMap::new(),
            timers: TimerWheel::new(),
            next_client: 1,
            next_ckpt: 1,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    /// Announces this node to the group.
    pub fn start(&mut self) -> Result<(), CheckpointdError> {
        pf_info!("checkpoint service {} starting", self.me);
        self.broadcast(CkptMessage::new(Subtype::Created, &self.me, ""))
    }

    /// Records a peer as up without waiting for its traffic.
    pub fn mark_up(&mut self, node: &str) {
        if node != self.me {
            self.node_status.insert(node.into(), true);
        }
    }

    /// Handles one raw field message from a peer.
    pub fn handle_peer_fields(
        &mut self,
        fields: &FieldMsg,
    ) -> Result<(), CheckpointdError> {
        let msg = CkptMessage::from_fields(fields)?;
        self.handle_peer_msg(msg)
    }

    /// Handles one decoded peer message.
    pub fn handle_peer_msg(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let result = self.dispatch(msg);
        self.drain_loopback();
        result
    }

    /// Handles one request arriving on external connection `conn`.
    pub fn handle_client_req(
        &mut self,
        conn: ConnId,
        req: ApiRequest,
    ) -> Result<(), CheckpointdError> {
        let result = self.handle_api_req(conn, req);
        self.drain_loopback();
        result
    }

    /// Handles the group reporting a peer node as gone.
    pub fn handle_node_down(
        &mut self,
        node: &str,
    ) -> Result<(), CheckpointdError> {
        let result = self.node_down(node);
        self.drain_loopback();
        result
    }

    /// Fires every timer due at `now`.
    pub fn handle_timeouts(
        &mut self,
        now: Instant,
    ) -> Result<(), CheckpointdError> {
        for key in self.timers.expired(now) {
            let result = match key.clone() {
                TimerKey::Request { client, req_no } => {
                    self.request_timeout(client, req_no)
                }
                TimerKey::Operation { name, op_no } => {
                    self.operation_timeout(&name, op_no)
                }
                TimerKey::Retention { name } => self.retention_timeout(&name),
            };
            if let Err(e) = result {
                pf_error!("error handling timer {:?}: {}", key, e);
            }
            self.drain_loopback();
        }
        Ok(())
    }

    /// Instant the earliest pending timer fires at, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn is_up(&self, node: &str) -> bool {
        node == self.me || self.node_status.get(node).copied().unwrap_or(false)
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        self.replicas.get(name)
    }

    pub fn open_checkpoint(&self, handle: CkptHandle) -> Option<&OpenCheckpoint> {
        self.open_ckpts.get(&handle)
    }

    pub fn client(&self, handle: ClientHandle) -> Option<&Client> {
        self.clients.get(&handle)
    }

    /// Whether an open race for `name` is in progress here.
    pub fn is_racing(&self, name: &str) -> bool {
        self.races.contains_key(name)
    }

    /// Whether a retention timer is pending for `name`.
    pub fn retention_pending(&self, name: &str) -> bool {
        self.timers.is_scheduled(&TimerKey::Retention { name: name.into() })
    }
}

// Service message dispatch and sending helpers
impl Service {
    /// Maps a message subtype to its handler.
    fn msg_handler(subtype: Subtype) -> MsgHandler {
        match subtype {
            Subtype::Created => Service::handle_created,
            Subtype::CreatedReply => Service::handle_created_reply,
            Subtype::OpenBcast => Service::handle_open_bcast,
            Subtype::OpenBcastReply => Service::handle_open_bcast_reply,
            Subtype::CkptCreateBcast => Service::handle_ckpt_create_bcast,
            Subtype::CkptCreateBcastReply => {
                Service::handle_ckpt_create_bcast_reply
            }
            Subtype::OpenRemote => Service::handle_open_remote,
            Subtype::OpenRemoteReply => Service::handle_open_remote_reply,
            Subtype::CloseRemote => Service::handle_close_remote,
            Subtype::CloseRemoteReply => Service::handle_close_remote_reply,
            Subtype::UnlinkBcast => Service::handle_unlink_bcast,
            Subtype::ReplicaCreate => Service::handle_replica_create,
            Subtype::ReplicaCreateReply => Service::handle_replica_create_reply,
            Subtype::ReplicaAdd => Service::handle_replica_add,
            Subtype::ReplicaAddReply => Service::handle_replica_add_reply,
            Subtype::ReplicaAddPrepareBcast => {
                Service::handle_replica_add_prepare
            }
            Subtype::ReplicaAddCommitBcast => Service::handle_replica_add_commit,
            Subtype::ReplicaAddRollbackBcast => {
                Service::handle_replica_add_rollback
            }
            Subtype::ReplicaAddPrepareBcastReply
            | Subtype::ReplicaAddCommitBcastReply
            | Subtype::ReplicaAddRollbackBcastReply
            | Subtype::UpdatePrepareBcastReply
            | Subtype::UpdateCommitBcastReply
            | Subtype::UpdateRollbackBcastReply => Service::handle_vote_reply,
            Subtype::ReplicaDelBcast => Service::handle_replica_del_bcast,
            Subtype::Update => Service::handle_update,
            Subtype::UpdatePrepareBcast => Service::handle_update_prepare,
            Subtype::UpdateCommitBcast => Service::handle_update_commit,
            Subtype::UpdateRollbackBcast => Service::handle_update_rollback,
            Subtype::UpdateBcast => Service::handle_update_bcast,
            Subtype::Read => Service::handle_read,
            Subtype::Sync => Service::handle_sync,
            Subtype::UpdateReply | Subtype::ReadReply | Subtype::SyncReply => {
                Service::handle_routed_reply
            }
            Subtype::ActiveSetBcast => Service::handle_active_set_bcast,
            Subtype::ActiveSetBcastReply => {
                Service::handle_active_set_bcast_reply
            }
            Subtype::ActiveSet => Service::handle_active_set,
            Subtype::ActiveSetReply => Service::handle_active_set_reply,
            Subtype::ActiveSetFinishBcast => Service::handle_active_set_finish,
        }
    }

    fn dispatch(&mut self, msg: CkptMessage) -> Result<(), CheckpointdError> {
        if msg.version != PROTOCOL_VERSION {
            pf_warn!(
                "dropping {:?} from {} with protocol version {}",
                msg.subtype,
                msg.from,
                msg.version
            );
            return Ok(());
        }
        if msg.from != self.me {
            self.node_status.insert(msg.from.clone(), true);
        }
        pf_trace!("handling {:?} from {}", msg.subtype, msg.from);
        Self::msg_handler(msg.subtype)(self, msg)
    }

    /// Handles messages I addressed to myself until none are left.
    fn drain_loopback(&mut self) {
        while let Some(msg) = self.loopback.pop_front() {
            let subtype = msg.subtype;
            if let Err(e) = self.dispatch(msg) {
                pf_error!("error handling looped-back {:?}: {}", subtype, e);
            }
        }
    }

    /// Sends a message to one node, possibly myself.
    fn send_to(
        &mut self,
        node: &str,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        if node == self.me {
            self.loopback.push_back(msg);
            Ok(())
        } else if !self.is_up(node) {
            pf_debug!("dropping {:?} to down node {}", msg.subtype, node);
            Ok(())
        } else {
            self.transport.send_to_node(node, msg.to_fields()?)
        }
    }

    /// Sends a message to each listed node, possibly including myself.
    fn send_to_nodes(
        &mut self,
        nodes: &[NodeName],
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let (mine, others): (Vec<NodeName>, Vec<NodeName>) = nodes
            .iter()
            .filter(|n| self.is_up(n))
            .cloned()
            .partition(|n| *n == self.me);
        if !others.is_empty() {
            self.transport.send_to_nodes(&others, msg.to_fields()?)?;
        }
        if !mine.is_empty() {
            self.loopback.push_back(msg);
        }
        Ok(())
    }

    /// Sends a message to every peer node except myself.
    fn broadcast(&mut self, msg: CkptMessage) -> Result<(), CheckpointdError> {
        self.transport.broadcast(msg.to_fields()?)
    }

    /// Peers currently up, excluding myself.
    fn up_peers(&self) -> Vec<NodeName> {
        self.node_status
            .iter()
            .filter(|(_, up)| **up)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Sends a reply back to a client over its connection.
    fn reply_client(
        &mut self,
        conn: ConnId,
        client: ClientHandle,
        req_no: RequestNo,
        result: CkptResult<ReplyData>,
    ) -> Result<(), CheckpointdError> {
        self.replies.send_reply(
            conn,
            ApiReply::Reply {
                client,
                req_no,
                result,
            },
        )
    }

    fn schedule(&mut self, key: TimerKey, dur: Duration) {
        self.timers.schedule(key, Instant::now(), dur);
    }

    fn schedule_operation(&mut self, name: &str, op_no: OpNo) {
        let dur = Duration::from_millis(self.config.operation_timeout_ms);
        self.schedule(
            TimerKey::Operation {
                name: name.into(),
                op_no,
            },
            dur,
        );
    }

    fn cancel_operation(&mut self, name: &str, op_no: OpNo) {
        self.timers.cancel(&TimerKey::Operation {
            name: name.into(),
            op_no,
        });
    }
}
