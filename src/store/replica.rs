//! One node's copy of a named checkpoint.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use crate::store::{
    CkptAttributes, CkptError, CkptResult, CkptStatus, NodeName, OpNo,
    Operation, SaTime, SectionImage, SectionStore,
};
use crate::utils::CheckpointdError;

/// Membership state of a node in a replica's node list.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum NodeState {
    /// Added by a prepared replica-add, not yet committed.
    Joining,
    Committed,
}

/// A replicated mutation of checkpoint content.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Mutation {
    SectionCreate {
        id: Vec<u8>,
        expiration: SaTime,
        data: Vec<u8>,
    },
    SectionDelete {
        id: Vec<u8>,
    },
    Write {
        id: Vec<u8>,
        offset: u64,
        data: Vec<u8>,
    },
    Overwrite {
        id: Vec<u8>,
        data: Vec<u8>,
    },
    ExpirationSet {
        id: Vec<u8>,
        expiration: SaTime,
    },
    RetentionSet {
        retention: SaTime,
    },
    /// Replace every section with the active replica's image.
    Synchronize {
        image: Vec<SectionImage>,
    },
}

/// Serialized replica state handed to a joining node.
#[derive(Debug, Serialize, Deserialize)]
struct ReplicaImage {
    name: String,
    attrs: CkptAttributes,
    nodes: Vec<(NodeName, NodeState)>,
    active_node: NodeName,
    next_op_no: OpNo,
    sections: Vec<SectionImage>,
}

/// Local replica of a checkpoint.
#[derive(Debug)]
pub struct Replica {
    /// Checkpoint name, unique cluster-wide.
    pub name: String,

    /// Creation attributes; only `retention` may change afterwards.
    pub attrs: CkptAttributes,

    pub sections: SectionStore,

    /// Map from node name -> membership state, for every holder.
    nodes: BTreeMap<NodeName, NodeState>,

    /// Name of the node currently serializing updates.
    pub active_node: NodeName,

    /// True only if this node is the active one.
    pub is_active: bool,

    /// Set while a two-phase operation holds the replica.
    pub locked: bool,

    /// Set between unpacking a pushed image and the replica-add reply.
    pub joining: bool,

    /// Set while a set-active handover is in progress.
    pub pending_pause: bool,

    /// Set once the checkpoint is unlinked; it goes away on last close.
    pub unlinked: bool,

    /// Operations waiting for the lock, in arrival order.
    pending_ops: VecDeque<Operation>,

    /// Map from operation number -> operation holding the lock or awaiting
    /// its replica-add.
    started_ops: BTreeMap<OpNo, Operation>,

    /// Number of open handles on this node referring to this replica.
    ref_count: u32,

    next_op_no: OpNo,

    /// Image staged by a prepared synchronize.
    staged_image: Option<Vec<SectionImage>>,
}

impl Replica {
    /// Creates a fresh replica that this node is active for.
    pub fn create(name: &str, attrs: CkptAttributes, me: &str) -> Self {
        Replica {
            name: name.into(),
            attrs,
            sections: SectionStore::new(),
            nodes: BTreeMap::from([(me.into(), NodeState::Committed)]),
            active_node: me.into(),
            is_active: true,
            locked: false,
            joining: false,
            pending_pause: false,
            unlinked: false,
            pending_ops: VecDeque::new(),
            started_ops: BTreeMap::new(),
            ref_count: 0,
            next_op_no: 1,
            staged_image: None,
        }
    }

    /// Validates an open against this replica.
    pub fn check_open(
        &self,
        attrs: Option<&CkptAttributes>,
    ) -> CkptResult<()> {
        if self.unlinked {
            return Err(CkptError::InvalidParam);
        }
        match attrs {
            Some(attrs) if !self.attrs.matches(attrs) => Err(CkptError::Exist),
            _ => Ok(()),
        }
    }

    pub fn open_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference, returning how many remain.
    pub fn close_ref(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn status(&self) -> CkptStatus {
        CkptStatus {
            attrs: self.attrs.clone(),
            number_of_sections: self.sections.count(),
            memory_used: self.sections.memory_used(),
        }
    }

    /// Stages a mutation without making it visible.
    pub fn prepare(&mut self, mutation: &Mutation) -> CkptResult<()> {
        match mutation {
            Mutation::SectionCreate {
                id,
                expiration,
                data,
            } => self
                .sections
                .prepare_create(&self.attrs, id, *expiration, data),
            Mutation::SectionDelete { id } => self.sections.prepare_delete(id),
            Mutation::Write { id, offset, data } => {
                self.sections.prepare_write(&self.attrs, id, *offset, data)
            }
            Mutation::Overwrite { id, data } => {
                self.sections.prepare_overwrite(&self.attrs, id, data)
            }
            Mutation::ExpirationSet { id, .. } => {
                self.sections.prepare_expiration(id)
            }
            Mutation::RetentionSet { retention } => {
                if *retention < 0 {
                    Err(CkptError::InvalidParam)
                } else {
                    Ok(())
                }
            }
            Mutation::Synchronize { image } => {
                self.staged_image = Some(image.clone());
                Ok(())
            }
        }
    }

    /// Makes a prepared mutation visible.
    pub fn commit(&mut self, mutation: &Mutation) -> CkptResult<()> {
        match mutation {
            Mutation::SectionCreate { id, .. } => self.sections.commit_create(id),
            Mutation::SectionDelete { id } => self.sections.commit_delete(id),
            Mutation::Write { id, .. } | Mutation::Overwrite { id, .. } => {
                self.sections.commit_data(id)
            }
            Mutation::ExpirationSet { id, expiration } => {
                self.sections.commit_expiration(id, *expiration)
            }
            Mutation::RetentionSet { retention } => {
                self.attrs.retention = *retention;
                Ok(())
            }
            Mutation::Synchronize { .. } => {
                if let Some(image) = self.staged_image.take() {
                    self.sections = SectionStore::from_image(image);
                }
                Ok(())
            }
        }
    }

    /// Discards a prepared mutation.
    pub fn rollback(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::SectionCreate { id, .. } => {
                self.sections.rollback_create(id)
            }
            Mutation::SectionDelete { id } => self.sections.rollback_delete(id),
            Mutation::Write { id, .. } | Mutation::Overwrite { id, .. } => {
                self.sections.rollback_data(id)
            }
            Mutation::ExpirationSet { .. } | Mutation::RetentionSet { .. } => {}
            Mutation::Synchronize { .. } => self.staged_image = None,
        }
    }

    /// Prepares and commits in one step; a failed prepare leaves the
    /// replica untouched.
    pub fn apply(&mut self, mutation: &Mutation) -> CkptResult<()> {
        if let Err(e) = self.prepare(mutation) {
            self.rollback(mutation);
            return Err(e);
        }
        self.commit(mutation)
    }

    /// Serializes the replica for a joining node.
    pub fn pack(&self) -> Result<Vec<u8>, CheckpointdError> {
        let image = ReplicaImage {
            name: self.name.clone(),
            attrs: self.attrs.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(node, state)| (node.clone(), *state))
                .collect(),
            active_node: self.active_node.clone(),
            next_op_no: self.next_op_no,
            sections: self.sections.image(),
        };
        Ok(encode_to_vec(&image)?)
    }

    /// Rebuilds a replica pushed by the active node.
    pub fn unpack(bytes: &[u8], me: &str) -> Result<Self, CheckpointdError> {
        let image: ReplicaImage = decode_from_slice(bytes)?;
        Ok(Replica {
            name: image.name,
            attrs: image.attrs,
            sections: SectionStore::from_image(image.sections),
            nodes: image.nodes.into_iter().collect(),
            is_active: image.active_node == me,
            active_node: image.active_node,
            locked: false,
            joining: false,
            pending_pause: false,
            unlinked: false,
            pending_ops: VecDeque::new(),
            started_ops: BTreeMap::new(),
            ref_count: 0,
            next_op_no: image.next_op_no,
            staged_image: None,
        })
    }

    /// Every node in the node list, in name order.
    pub fn nodes(&self) -> Vec<NodeName> {
        self.nodes.keys().cloned().collect()
    }

    /// Every node in the node list except `me`.
    pub fn other_nodes(&self, me: &str) -> Vec<NodeName> {
        self.nodes.keys().filter(|n| *n != me).cloned().collect()
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.nodes.get(node).copied()
    }

    pub fn add_node(&mut self, node: &str, state: NodeState) {
        self.nodes.insert(node.into(), state);
    }

    /// Updates a node's state if it is still listed.
    pub fn set_node_state(&mut self, node: &str, state: NodeState) {
        if let Some(s) = self.nodes.get_mut(node) {
            *s = state;
        }
    }

    pub fn remove_node(&mut self, node: &str) -> bool {
        self.nodes.remove(node).is_some()
    }

    /// The node that takes over when the active node is gone: the first
    /// committed holder in node-list order.
    pub fn successor(&self) -> Option<NodeName> {
        self.nodes
            .iter()
            .find(|(_, state)| **state == NodeState::Committed)
            .map(|(node, _)| node.clone())
    }

    /// Makes this node the active one, abandoning whatever the previous
    /// active node had staged here.
    pub fn promote(&mut self, me: &str) {
        self.is_active = true;
        self.active_node = me.into();
        self.locked = false;
        self.pending_pause = false;
        self.sections.rollback_all();
        self.staged_image = None;
        self.set_node_state(me, NodeState::Committed);
    }

    /// Hands active status over to `new_active`, returning the operations
    /// that were still queued here.
    pub fn demote(&mut self, new_active: &str) -> Vec<Operation> {
        self.is_active = false;
        self.active_node = new_active.into();
        self.locked = false;
        self.started_ops.clear();
        self.pending_ops.drain(..).collect()
    }

    /// Whether no operation is queued or in flight.
    pub fn is_idle(&self) -> bool {
        !self.locked && self.pending_ops.is_empty() && self.started_ops.is_empty()
    }

    pub fn alloc_op_no(&mut self) -> OpNo {
        let op_no = self.next_op_no;
        self.next_op_no += 1;
        op_no
    }

    pub fn next_op_no(&self) -> OpNo {
        self.next_op_no
    }

    /// Follows the active node's numbering after applying its operation.
    pub fn observe_op_no(&mut self, op_no: OpNo) {
        if op_no >= self.next_op_no {
            self.next_op_no = op_no + 1;
        }
    }

    pub fn enqueue(&mut self, op: Operation) {
        self.pending_ops.push_back(op);
    }

    pub fn pop_pending(&mut self) -> Option<Operation> {
        self.pending_ops.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_ops.is_empty()
    }

    /// Removes a queued operation by number.
    pub fn remove_pending(&mut self, op_no: OpNo) -> Option<Operation> {
        let idx = self.pending_ops.iter().position(|op| op.op_no == op_no)?;
        self.pending_ops.remove(idx)
    }

    /// Drops queued operations matching the predicate.
    pub fn retain_pending<F>(&mut self, f: F)
    where
        F: FnMut(&Operation) -> bool,
    {
        self.pending_ops.retain(f);
    }

    pub fn insert_started(&mut self, op: Operation) {
        self.started_ops.insert(op.op_no, op);
    }

    pub fn started_mut(&mut self, op_no: OpNo) -> Option<&mut Operation> {
        self.started_ops.get_mut(&op_no)
    }

    pub fn take_started(&mut self, op_no: OpNo) -> Option<Operation> {
        self.started_ops.remove(&op_no)
    }

    /// Numbers of every started operation.
    pub fn started_op_nos(&self) -> Vec<OpNo> {
        self.started_ops.keys().copied().collect()
    }
}
