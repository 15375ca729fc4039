//! Cluster-wide operations in flight against a replica.
//!
//! An operation walks `Pending -> Started -> Prepared -> Committed`, or ends
//! in `Rollbacked` if any participant fails to prepare or the operation times
//! out before every vote is in. Each phase change waits until every
//! participant in the vote map has acknowledged the same state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{
    ClientHandle, CkptError, CkptResult, Mutation, NodeName, RequestNo,
    SaTime, SectionsChosen,
};

/// Per-replica operation number.
pub type OpNo = u32;

/// Operation kind, also carried on the wire.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum OpKind {
    ReplicaCreate,
    ReplicaAdd,
    Update,
    Read,
    Sync,
    ActiveSet,
}

/// Operation state, also used as a per-node vote.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum OpState {
    Pending,
    Started,
    Prepared,
    Committed,
    Rollbacked,
}

/// Where the final result of an operation is delivered.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Origin {
    /// Node hosting the client.
    pub host: NodeName,
    pub client: ClientHandle,
    pub req_no: RequestNo,
}

/// What a read-class operation returns.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReadKind {
    Section { id: Vec<u8>, offset: u64, size: u64 },
    Status,
    Query { chosen: SectionsChosen, expiration: SaTime },
}

/// Kind-specific operation content.
#[derive(Debug, PartialEq, Clone)]
pub enum OpPayload {
    /// Replica image handed to `joiner`; waits for its add request.
    ReplicaCreate { joiner: NodeName },
    /// Two-phase addition of `joiner` to the node list.
    ReplicaAdd { joiner: NodeName },
    Update(Mutation),
    /// Synchronize; carries the image push once started on an
    /// active-replica checkpoint.
    Sync(Option<Mutation>),
    Read(ReadKind),
    ActiveSet { requester: NodeName },
}

/// Next step the owner of an operation must take after feeding it an event.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Advance {
    /// Keep waiting for more acknowledgements.
    Wait,
    /// Every participant prepared; send commit to all.
    Commit,
    /// Abandon; send rollback to all.
    Rollback,
    /// Every participant acknowledged the final phase.
    Finish(CkptResult<()>),
}

/// One operation against a replica.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op_no: OpNo,
    pub origin: Origin,
    pub payload: OpPayload,

    state: OpState,

    /// Map from participant -> last state it acknowledged.
    votes: BTreeMap<NodeName, OpState>,

    /// First failure reported by a participant.
    error: Option<CkptError>,
}

impl Operation {
    /// Creates a new operation in `Pending` state.
    pub fn new(op_no: OpNo, origin: Origin, payload: OpPayload) -> Self {
        Operation {
            op_no,
            origin,
            payload,
            state: OpState::Pending,
            votes: BTreeMap::new(),
            error: None,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self.payload {
            OpPayload::ReplicaCreate { .. } => OpKind::ReplicaCreate,
            OpPayload::ReplicaAdd { .. } => OpKind::ReplicaAdd,
            OpPayload::Update(_) => OpKind::Update,
            OpPayload::Sync(_) => OpKind::Sync,
            OpPayload::Read(_) => OpKind::Read,
            OpPayload::ActiveSet { .. } => OpKind::ActiveSet,
        }
    }

    /// The mutation participants apply, if this operation carries one.
    pub fn mutation(&self) -> Option<&Mutation> {
        match &self.payload {
            OpPayload::Update(m) | OpPayload::Sync(Some(m)) => Some(m),
            _ => None,
        }
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    /// Marks the operation as running without a vote round.
    pub fn mark_started(&mut self) {
        self.state = OpState::Started;
    }

    /// Starts the prepare round over the given participants.
    pub fn begin<I>(&mut self, participants: I)
    where
        I: IntoIterator<Item = NodeName>,
    {
        self.state = OpState::Started;
        self.error = None;
        self.votes = participants
            .into_iter()
            .map(|node| (node, OpState::Started))
            .collect();
    }

    /// Current participants.
    pub fn participants(&self) -> Vec<NodeName> {
        self.votes.keys().cloned().collect()
    }

    pub fn is_participant(&self, node: &str) -> bool {
        self.votes.contains_key(node)
    }

    /// The state every participant agrees on, if they all agree.
    pub fn unanimous(&self) -> Option<OpState> {
        let mut votes = self.votes.values();
        let first = *votes.next()?;
        votes.all(|&v| v == first).then_some(first)
    }

    /// Records a prepare reply.
    pub fn on_prepare_reply(
        &mut self,
        node: &str,
        ret: CkptResult<()>,
    ) -> Advance {
        if self.state != OpState::Started || !self.is_participant(node) {
            return Advance::Wait;
        }
        match ret {
            Ok(()) => {
                self.votes.insert(node.into(), OpState::Prepared);
                self.evaluate()
            }
            Err(e) => {
                self.error.get_or_insert(e);
                self.start_rollback()
            }
        }
    }

    /// Records a commit acknowledgement.
    pub fn on_commit_reply(&mut self, node: &str) -> Advance {
        if self.state != OpState::Prepared || !self.is_participant(node) {
            return Advance::Wait;
        }
        self.votes.insert(node.into(), OpState::Committed);
        self.evaluate()
    }

    /// Records a rollback acknowledgement.
    pub fn on_rollback_reply(&mut self, node: &str) -> Advance {
        if self.state != OpState::Rollbacked || !self.is_participant(node) {
            return Advance::Wait;
        }
        self.votes.insert(node.into(), OpState::Rollbacked);
        self.evaluate()
    }

    /// Removes a dead participant and re-evaluates as if it had answered.
    pub fn drop_node(&mut self, node: &str) -> Advance {
        if self.votes.remove(node).is_none() {
            return Advance::Wait;
        }
        self.evaluate()
    }

    /// Forces a rollback if the prepare round is still open.
    pub fn abort(&mut self, err: CkptError) -> Advance {
        if self.state != OpState::Started || self.votes.is_empty() {
            return Advance::Wait;
        }
        self.error.get_or_insert(err);
        self.start_rollback()
    }

    fn start_rollback(&mut self) -> Advance {
        self.state = OpState::Rollbacked;
        for vote in self.votes.values_mut() {
            *vote = OpState::Started;
        }
        Advance::Rollback
    }

    fn failure(&self) -> CkptError {
        self.error.unwrap_or(CkptError::FailedOperation)
    }

    fn evaluate(&mut self) -> Advance {
        if self.votes.is_empty() {
            return match self.state {
                OpState::Started | OpState::Prepared => {
                    self.state = OpState::Committed;
                    Advance::Finish(Ok(()))
                }
                OpState::Rollbacked => Advance::Finish(Err(self.failure())),
                _ => Advance::Wait,
            };
        }

        match (self.state, self.unanimous()) {
            (OpState::Started, Some(OpState::Prepared)) => {
                self.state = OpState::Prepared;
                Advance::Commit
            }
            (OpState::Prepared, Some(OpState::Committed)) => {
                self.state = OpState::Committed;
                Advance::Finish(Ok(()))
            }
            (OpState::Rollbacked, Some(OpState::Rollbacked)) => {
                Advance::Finish(Err(self.failure()))
            }
            _ => Advance::Wait,
        }
    }
}
