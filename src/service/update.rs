//! Checkpoint service -- the active node's operation queue and the
//! update, read, and synchronize paths.

use super::*;

use crate::store::{
    Advance, CkptError, Mutation, OpKind, OpPayload, Operation, Origin,
    ReadKind,
};

// Service operation queue handling
impl Service {
    /// Queues an operation carried by `msg` on my active replica. A node
    /// without the replica answers NOT_EXIST; a standby answers TRY_AGAIN
    /// naming the node it takes as active.
    fn enqueue_routed(
        &mut self,
        msg: CkptMessage,
        payload: OpPayload,
        reply_subtype: Subtype,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        let op_no = match self.replicas.get_mut(&name) {
            None => {
                let reply = msg
                    .reply(reply_subtype, &self.me)
                    .with_ret(Err(CkptError::NotExist));
                return self.send_to(&msg.client_host, reply);
            }
            Some(replica) if !replica.is_active => {
                pf_debug!(
                    "bouncing {:?} for '{}' from {}: {} is active",
                    msg.subtype,
                    name,
                    msg.from,
                    replica.active_node
                );
                let reply = msg
                    .reply(reply_subtype, &self.me)
                    .with_active(&replica.active_node)
                    .with_ret(Err(CkptError::TryAgain));
                return self.send_to(&msg.client_host, reply);
            }
            Some(replica) => {
                let op_no = replica.alloc_op_no();
                replica.enqueue(Operation::new(
                    op_no,
                    Origin {
                        host: msg.client_host.clone(),
                        client: msg.client_handle,
                        req_no: msg.client_req_no,
                    },
                    payload,
                ));
                op_no
            }
        };
        pf_trace!("queued op {} on '{}'", op_no, name);
        self.schedule_operation(&name, op_no);
        self.try_start_next(&name)
    }

    /// Starts queued operations until one takes the replica lock or the
    /// queue runs dry.
    pub(super) fn try_start_next(
        &mut self,
        name: &str,
    ) -> Result<(), CheckpointdError> {
        loop {
            let (mut op, active_only) = match self.replicas.get_mut(name) {
                Some(replica) if replica.is_active && !replica.locked => {
                    match replica.pop_pending() {
                        Some(op) => {
                            (op, replica.attrs.creation_flags.active_only())
                        }
                        None => return Ok(()),
                    }
                }
                _ => return Ok(()),
            };
            self.cancel_operation(name, op.op_no);

            match op.payload.clone() {
                OpPayload::Read(kind) => self.execute_read(name, &op, &kind)?,
                OpPayload::Update(mutation) if active_only => {
                    self.apply_active_only(name, &op, mutation)?
                }
                OpPayload::Update(_) => return self.begin_two_phase(name, op),
                OpPayload::Sync(_) if !active_only => {
                    let reply = op_message(&self.me, name, &op, Subtype::SyncReply);
                    self.send_to(&op.origin.host, reply)?;
                }
                OpPayload::Sync(_) => {
                    let image = match self.replicas.get(name) {
                        Some(replica) => replica.sections.image(),
                        None => return Ok(()),
                    };
                    op.payload =
                        OpPayload::Sync(Some(Mutation::Synchronize { image }));
                    return self.begin_two_phase(name, op);
                }
                OpPayload::ReplicaCreate { joiner } => {
                    return self.push_replica(name, op, &joiner)
                }
                OpPayload::ActiveSet { requester } => {
                    return self.hand_over(name, op, &requester)
                }
                OpPayload::ReplicaAdd { .. } => {
                    pf_error!("replica add {} found queued on '{}'", op.op_no, name);
                }
            }
        }
    }

    fn execute_read(
        &mut self,
        name: &str,
        op: &Operation,
        kind: &ReadKind,
    ) -> Result<(), CheckpointdError> {
        let result = match self.replicas.get(name) {
            Some(replica) => match kind {
                ReadKind::Section { id, offset, size } => replica
                    .sections
                    .read(id, *offset, *size)
                    .map(ReplyData::Data),
                ReadKind::Status => Ok(ReplyData::Status(replica.status())),
                ReadKind::Query { chosen, expiration } => Ok(
                    ReplyData::Sections(replica.sections.query(*chosen, *expiration)),
                ),
            },
            None => Err(CkptError::NotExist),
        };
        let reply = op_message(&self.me, name, op, Subtype::ReadReply);
        let reply = match result {
            Ok(data) => reply.with_param(&data)?,
            Err(e) => reply.with_ret(Err(e)),
        };
        self.send_to(&op.origin.host, reply)
    }

    /// Applies an update of an active-replica checkpoint here, answers it,
    /// and pushes it to the standbys without waiting.
    fn apply_active_only(
        &mut self,
        name: &str,
        op: &Operation,
        mutation: Mutation,
    ) -> Result<(), CheckpointdError> {
        let (ret, standbys) = match self.replicas.get_mut(name) {
            Some(replica) => {
                let ret = replica.apply(&mutation);
                (ret, replica.other_nodes(&self.me))
            }
            None => return Ok(()),
        };
        let reply = op_message(&self.me, name, op, Subtype::UpdateReply).with_ret(ret);
        self.send_to(&op.origin.host, reply)?;

        if ret.is_ok() {
            if let Mutation::RetentionSet { .. } = mutation {
                self.refresh_retention(name);
            }
            if !standbys.is_empty() {
                let push = op_message(&self.me, name, op, Subtype::UpdateBcast)
                    .with_param(&mutation)?;
                self.send_to_nodes(&standbys, push)?;
            }
        }
        Ok(())
    }

    /// Locks the replica and sends the prepare round of `op` to every
    /// holder, myself included.
    fn begin_two_phase(
        &mut self,
        name: &str,
        mut op: Operation,
    ) -> Result<(), CheckpointdError> {
        let mutation = match op.mutation() {
            Some(mutation) => mutation.clone(),
            None => {
                return logged_err!("op {} on '{}' carries no mutation", op.op_no, name)
            }
        };
        let participants = match self.replicas.get_mut(name) {
            Some(replica) => {
                replica.locked = true;
                replica.nodes()
            }
            None => return Ok(()),
        };
        op.begin(participants.clone());
        let op_no = op.op_no;
        let prepare = op_message(&self.me, name, &op, Subtype::UpdatePrepareBcast)
            .with_param(&mutation)?;
        if let Some(replica) = self.replicas.get_mut(name) {
            replica.insert_started(op);
        }
        self.schedule_operation(name, op_no);
        self.send_to_nodes(&participants, prepare)
    }

    /// Locks the replica and pushes its image to a joining node.
    fn push_replica(
        &mut self,
        name: &str,
        mut op: Operation,
        joiner: &str,
    ) -> Result<(), CheckpointdError> {
        let packed = match self.replicas.get_mut(name) {
            Some(replica) => {
                replica.locked = true;
                replica.pack()
            }
            None => return Ok(()),
        };
        let reply = op_message(&self.me, name, &op, Subtype::ReplicaCreateReply);
        let data = match packed {
            Ok(data) => data,
            Err(e) => {
                pf_error!("failed to pack '{}': {}", name, e);
                if let Some(replica) = self.replicas.get_mut(name) {
                    replica.locked = false;
                }
                self.send_to(
                    joiner,
                    reply.with_ret(Err(CkptError::FailedOperation)),
                )?;
                return self.try_start_next(name);
            }
        };

        op.mark_started();
        let op_no = op.op_no;
        if let Some(replica) = self.replicas.get_mut(name) {
            replica.insert_started(op);
        }
        self.schedule_operation(name, op_no);
        self.send_to(joiner, reply.with_data(data))
    }

    /// Acts on what a vote round reported.
    pub(super) fn advance_op(
        &mut self,
        name: &str,
        op_no: OpNo,
        advance: Advance,
    ) -> Result<(), CheckpointdError> {
        let commit = match advance {
            Advance::Wait => return Ok(()),
            Advance::Finish(ret) => return self.finish_op(name, op_no, ret),
            Advance::Commit => true,
            Advance::Rollback => false,
        };

        let (participants, msg) = match self
            .replicas
            .get_mut(name)
            .and_then(|r| r.started_mut(op_no))
        {
            Some(op) => {
                let subtype = match (op.kind(), commit) {
                    (OpKind::ReplicaAdd, true) => Subtype::ReplicaAddCommitBcast,
                    (OpKind::ReplicaAdd, false) => Subtype::ReplicaAddRollbackBcast,
                    (_, true) => Subtype::UpdateCommitBcast,
                    (_, false) => Subtype::UpdateRollbackBcast,
                };
                let mut msg = op_message(&self.me, name, op, subtype);
                if let Some(mutation) = op.mutation() {
                    msg = msg.with_param(mutation)?;
                }
                (op.participants(), msg)
            }
            None => return Ok(()),
        };
        pf_trace!(
            "op {} on '{}' moving to {}",
            op_no,
            name,
            if commit { "commit" } else { "rollback" }
        );
        self.send_to_nodes(&participants, msg)
    }

    /// Completes a started operation, unlocks the replica, and moves on to
    /// the next queued one.
    pub(super) fn finish_op(
        &mut self,
        name: &str,
        op_no: OpNo,
        ret: CkptResult<()>,
    ) -> Result<(), CheckpointdError> {
        self.cancel_operation(name, op_no);
        let op = match self.replicas.get_mut(name) {
            Some(replica) => {
                replica.locked = false;
                replica.take_started(op_no)
            }
            None => None,
        };
        let op = match op {
            Some(op) => op,
            None => return Ok(()),
        };
        pf_debug!("op {} on '{}' finished: {:?}", op_no, name, ret);

        let subtype = match op.kind() {
            OpKind::ReplicaAdd => Subtype::ReplicaAddReply,
            OpKind::Sync => Subtype::SyncReply,
            _ => Subtype::UpdateReply,
        };
        let reply = op_message(&self.me, name, &op, subtype).with_ret(ret);
        self.send_to(&op.origin.host, reply)?;
        self.try_start_next(name)
    }

    /// Handler of operation timer expiry.
    pub(super) fn operation_timeout(
        &mut self,
        name: &str,
        op_no: OpNo,
    ) -> Result<(), CheckpointdError> {
        let replica = match self.replicas.get_mut(name) {
            Some(replica) => replica,
            None => return Ok(()),
        };
        if replica.remove_pending(op_no).is_some() {
            pf_warn!("dropped queued op {} on '{}' after timeout", op_no, name);
            return Ok(());
        }

        let advance = match replica.started_mut(op_no) {
            Some(op) if op.kind() == OpKind::ReplicaCreate => None,
            Some(op) => Some(op.abort(CkptError::Timeout)),
            None => return Ok(()),
        };
        match advance {
            Some(advance) => {
                pf_warn!("op {} on '{}' timed out", op_no, name);
                self.advance_op(name, op_no, advance)
            }
            None => {
                pf_warn!("joiner of '{}' never asked to be added", name);
                replica.take_started(op_no);
                replica.locked = false;
                self.try_start_next(name)
            }
        }
    }
}

// Service update, read, and synchronize handlers
impl Service {
    pub(super) fn handle_update(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let mutation: Mutation = msg.param_as()?;
        self.enqueue_routed(msg, OpPayload::Update(mutation), Subtype::UpdateReply)
    }

    pub(super) fn handle_read(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let kind: ReadKind = msg.param_as()?;
        self.enqueue_routed(msg, OpPayload::Read(kind), Subtype::ReadReply)
    }

    pub(super) fn handle_sync(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        self.enqueue_routed(msg, OpPayload::Sync(None), Subtype::SyncReply)
    }

    pub(super) fn handle_update_prepare(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let mutation: Mutation = msg.param_as()?;
        let ret = match self.replicas.get_mut(&msg.ckpt_name) {
            Some(replica) => replica.prepare(&mutation),
            None => Err(CkptError::NotExist),
        };
        self.send_to(
            &msg.from,
            msg.reply(Subtype::UpdatePrepareBcastReply, &self.me)
                .with_ret(ret),
        )
    }

    pub(super) fn handle_update_commit(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let mutation: Mutation = msg.param_as()?;
        if let Some(replica) = self.replicas.get_mut(&msg.ckpt_name) {
            if let Err(e) = replica.commit(&mutation) {
                pf_warn!("commit of op {} on '{}' failed: {}", msg.op_no, msg.ckpt_name, e);
            }
            replica.observe_op_no(msg.op_no);
            if let Mutation::RetentionSet { .. } = mutation {
                self.refresh_retention(&msg.ckpt_name);
            }
        }
        self.send_to(
            &msg.from,
            msg.reply(Subtype::UpdateCommitBcastReply, &self.me),
        )
    }

    pub(super) fn handle_update_rollback(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let mutation: Mutation = msg.param_as()?;
        if let Some(replica) = self.replicas.get_mut(&msg.ckpt_name) {
            replica.rollback(&mutation);
        }
        self.send_to(
            &msg.from,
            msg.reply(Subtype::UpdateRollbackBcastReply, &self.me),
        )
    }

    /// Handler of an update the active node already applied.
    pub(super) fn handle_update_bcast(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let mutation: Mutation = msg.param_as()?;
        if let Some(replica) = self.replicas.get_mut(&msg.ckpt_name) {
            if let Err(e) = replica.apply(&mutation) {
                pf_warn!(
                    "pushed op {} on '{}' failed here: {}",
                    msg.op_no,
                    msg.ckpt_name,
                    e
                );
            }
            replica.observe_op_no(msg.op_no);
            if let Mutation::RetentionSet { .. } = mutation {
                self.refresh_retention(&msg.ckpt_name);
            }
        }
        Ok(())
    }

    /// Handler of a vote reply to any two-phase round I drive.
    pub(super) fn handle_vote_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let advance = match self
            .replicas
            .get_mut(&msg.ckpt_name)
            .and_then(|r| r.started_mut(msg.op_no))
        {
            Some(op) => match msg.subtype {
                Subtype::ReplicaAddPrepareBcastReply
                | Subtype::UpdatePrepareBcastReply => {
                    op.on_prepare_reply(&msg.from, msg.ret)
                }
                Subtype::ReplicaAddCommitBcastReply
                | Subtype::UpdateCommitBcastReply => op.on_commit_reply(&msg.from),
                _ => op.on_rollback_reply(&msg.from),
            },
            None => {
                pf_debug!("ignoring stale {:?} from {}", msg.subtype, msg.from);
                return Ok(());
            }
        };
        self.advance_op(&msg.ckpt_name, msg.op_no, advance)
    }
}
