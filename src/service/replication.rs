//! Checkpoint service -- replica membership, unlink, and retention.

use super::*;

use crate::store::{
    CkptError, NodeState, OpPayload, Operation, Origin, TIME_END,
};

// Service replica membership handling
impl Service {
    /// Handler of a node asking for a copy of my active replica.
    pub(super) fn handle_replica_create(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let param: OpenParam = msg.param_as()?;
        let name = msg.ckpt_name.clone();
        let ret = match self.replicas.get(&name) {
            None => Err(CkptError::NotExist),
            Some(replica) if !replica.is_active => Err(CkptError::FailedOperation),
            Some(replica) => replica.check_open(param.attrs.as_ref()),
        };
        if let Err(e) = ret {
            return self.send_to(
                &msg.from,
                msg.reply(Subtype::ReplicaCreateReply, &self.me).with_ret(Err(e)),
            );
        }

        let op_no = match self.replicas.get_mut(&name) {
            Some(replica) => {
                let op_no = replica.alloc_op_no();
                replica.enqueue(Operation::new(
                    op_no,
                    Origin {
                        host: msg.from.clone(),
                        client: msg.client_handle,
                        req_no: msg.client_req_no,
                    },
                    OpPayload::ReplicaCreate {
                        joiner: msg.from.clone(),
                    },
                ));
                op_no
            }
            None => return Ok(()),
        };
        self.schedule_operation(&name, op_no);
        self.try_start_next(&name)
    }

    /// Handler of the replica image pushed to me as joiner.
    pub(super) fn handle_replica_create_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        let (client, req_no) = match self.joining_race(&msg) {
            Some(pair) => pair,
            None => {
                pf_debug!("ignoring stale replica image from {}", msg.from);
                return Ok(());
            }
        };
        if let Err(e) = msg.ret {
            self.end_race(&name)?;
            return self.respond(client, req_no, Err(e));
        }

        let mut replica = match Replica::unpack(&msg.data, &self.me) {
            Ok(replica) => replica,
            Err(e) => {
                pf_error!("bad replica image for '{}': {}", name, e);
                self.end_race(&name)?;
                return self.respond(client, req_no, Err(CkptError::FailedOperation));
            }
        };
        replica.joining = true;
        self.replicas.insert(name, replica);
        self.send_to(&msg.from, msg.reply(Subtype::ReplicaAdd, &self.me))
    }

    /// Handler of a joiner asking to be added to the node list.
    pub(super) fn handle_replica_add(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        let joiner = msg.from.clone();
        let (participants, prepare) = match self.replicas.get_mut(&name) {
            Some(replica) => {
                let mut participants = replica.nodes();
                if !participants.contains(&joiner) {
                    participants.push(joiner.clone());
                }
                match replica.started_mut(msg.op_no) {
                    Some(op)
                        if op.payload
                            == (OpPayload::ReplicaCreate {
                                joiner: joiner.clone(),
                            }) =>
                    {
                        op.payload = OpPayload::ReplicaAdd {
                            joiner: joiner.clone(),
                        };
                        op.begin(participants.clone());
                        let prepare = op_message(
                            &self.me,
                            &name,
                            op,
                            Subtype::ReplicaAddPrepareBcast,
                        );
                        (participants, prepare)
                    }
                    _ => {
                        pf_warn!(
                            "no replica create {} for {} on '{}'",
                            msg.op_no,
                            joiner,
                            name
                        );
                        return Ok(());
                    }
                }
            }
            None => return Ok(()),
        };
        self.schedule_operation(&name, msg.op_no);
        self.send_to_nodes(&participants, prepare)
    }

    pub(super) fn handle_replica_add_prepare(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let ret = match self.replicas.get_mut(&msg.ckpt_name) {
            Some(replica) => {
                replica.add_node(&msg.client_host, NodeState::Joining);
                Ok(())
            }
            None => Err(CkptError::NotExist),
        };
        self.send_to(
            &msg.from,
            msg.reply(Subtype::ReplicaAddPrepareBcastReply, &self.me)
                .with_ret(ret),
        )
    }

    pub(super) fn handle_replica_add_commit(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        if let Some(replica) = self.replicas.get_mut(&msg.ckpt_name) {
            replica.set_node_state(&msg.client_host, NodeState::Committed);
            replica.observe_op_no(msg.op_no);
        }
        self.send_to(
            &msg.from,
            msg.reply(Subtype::ReplicaAddCommitBcastReply, &self.me),
        )
    }

    pub(super) fn handle_replica_add_rollback(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        if msg.client_host == self.me {
            if self.replicas.get(&msg.ckpt_name).is_some_and(|r| r.joining) {
                pf_debug!("dropping half-joined replica of '{}'", msg.ckpt_name);
                self.replicas.remove(&msg.ckpt_name);
            }
        } else if let Some(replica) = self.replicas.get_mut(&msg.ckpt_name) {
            replica.remove_node(&msg.client_host);
        }
        self.send_to(
            &msg.from,
            msg.reply(Subtype::ReplicaAddRollbackBcastReply, &self.me),
        )
    }

    /// Handler of the final answer to my replica add.
    pub(super) fn handle_replica_add_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        if self.joining_race(&msg).is_none() {
            pf_debug!("ignoring stale replica add answer from {}", msg.from);
            return Ok(());
        }
        let race = match self.races.remove(&name) {
            Some(race) => race,
            None => return Ok(()),
        };
        let (client, req_no) = (race.client(), race.req_no());

        let joined = match self.replicas.get_mut(&name) {
            Some(replica) if msg.ret.is_ok() => {
                replica.joining = false;
                replica.set_node_state(&self.me, NodeState::Committed);
                true
            }
            _ => false,
        };
        if joined {
            pf_info!("joined checkpoint '{}' held by {}", name, msg.from);
            self.finish_open(client, req_no, &name, race.flags(), Target::LocalReplica)?;
        } else {
            if self.replicas.get(&name).is_some_and(|r| r.joining) {
                self.remove_replica(&name)?;
            }
            let err = msg.ret.err().unwrap_or(CkptError::FailedOperation);
            self.respond(client, req_no, Err(err))?;
        }
        self.resume_deferred()
    }

    /// Handler of a peer dropping its replica.
    pub(super) fn handle_replica_del_bcast(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        match self.replicas.get_mut(&name) {
            Some(replica) => {
                replica.remove_node(&msg.from);
            }
            None => return Ok(()),
        }
        pf_debug!("{} dropped its replica of '{}'", msg.from, name);
        self.active_gone(&name, &msg.from)
    }

    /// Moves active status off `gone` if it held it for `name`.
    pub(super) fn active_gone(
        &mut self,
        name: &str,
        gone: &str,
    ) -> Result<(), CheckpointdError> {
        let promoted = match self.replicas.get_mut(name) {
            Some(replica) if !replica.joining && replica.active_node == gone => {
                match replica.successor() {
                    Some(successor) if successor == self.me => {
                        replica.promote(&self.me);
                        pf_info!("took over as active node of '{}'", name);
                        true
                    }
                    Some(successor) => {
                        pf_debug!("{} is now active node of '{}'", successor, name);
                        replica.sections.rollback_all();
                        replica.active_node = successor;
                        false
                    }
                    None => {
                        pf_warn!("no successor left for '{}'", name);
                        false
                    }
                }
            }
            _ => return Ok(()),
        };

        // holders that have not yet noticed the loss learn of me here, and
        // requests they bounced get another try
        if promoted {
            self.broadcast(
                CkptMessage::new(Subtype::ActiveSetFinishBcast, &self.me, name)
                    .with_active(&self.me),
            )?;
        }

        let stuck = self.requests_where(|r| {
            r.name.as_deref() == Some(name)
                && r.to_node.as_deref() == Some(gone)
                && r.is_routed()
        });
        for (client, req_no) in stuck {
            self.restart_request(client, req_no)?;
        }
        if promoted {
            self.try_start_next(name)?;
            self.resume_deferred()?;
        }
        Ok(())
    }

    /// Drops the local replica of `name` and tells its other holders.
    pub(super) fn remove_replica(
        &mut self,
        name: &str,
    ) -> Result<(), CheckpointdError> {
        let replica = match self.replicas.remove(name) {
            Some(replica) => replica,
            None => return Ok(()),
        };
        self.timers.cancel(&TimerKey::Retention { name: name.into() });
        for op_no in replica.started_op_nos() {
            self.cancel_operation(name, op_no);
        }
        pf_info!("removed replica of '{}'", name);

        let others: Vec<NodeName> = replica
            .other_nodes(&self.me)
            .into_iter()
            .filter(|n| self.is_up(n))
            .collect();
        if others.is_empty() {
            return Ok(());
        }
        self.send_to_nodes(
            &others,
            CkptMessage::new(Subtype::ReplicaDelBcast, &self.me, name),
        )
    }

    /// Whether `msg` answers the joining stage of one of my races, giving
    /// its request if so.
    fn joining_race(&self, msg: &CkptMessage) -> Option<(ClientHandle, RequestNo)> {
        let race = self.races.get(&msg.ckpt_name)?;
        let expected = open::RaceStage::Joining {
            holder: msg.from.clone(),
        };
        (race.stage == expected
            && race.client() == msg.client_handle
            && race.req_no() == msg.client_req_no)
            .then(|| (race.client(), race.req_no()))
    }
}

// Service unlink and retention handling
impl Service {
    /// Marks the local replica unlinked, dropping it if unreferenced.
    pub(super) fn unlink_local(
        &mut self,
        name: &str,
    ) -> Result<(), CheckpointdError> {
        self.known_ckpts.remove(name);
        let unused = match self.replicas.get_mut(name) {
            Some(replica) => {
                replica.unlinked = true;
                replica.ref_count() == 0
            }
            None => false,
        };
        if unused {
            self.remove_replica(name)?;
        }
        Ok(())
    }

    pub(super) fn handle_unlink_bcast(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        pf_debug!("{} unlinked '{}'", msg.from, msg.ckpt_name);
        self.unlink_local(&msg.ckpt_name)
    }

    /// Drops one local reference; the last one starts retention or removes
    /// an unlinked replica.
    pub(super) fn release_replica_ref(
        &mut self,
        name: &str,
    ) -> Result<(), CheckpointdError> {
        let unlinked = match self.replicas.get_mut(name) {
            Some(replica) => {
                if replica.close_ref() > 0 {
                    return Ok(());
                }
                replica.unlinked
            }
            None => return Ok(()),
        };
        if unlinked {
            self.remove_replica(name)
        } else {
            self.start_retention(name);
            Ok(())
        }
    }

    /// Schedules the retention timer of an unreferenced replica.
    pub(super) fn start_retention(&mut self, name: &str) {
        let key = TimerKey::Retention { name: name.into() };
        match self.replicas.get(name).map(|r| r.attrs.retention) {
            Some(retention) if retention != TIME_END => {
                pf_debug!("retaining '{}' for {} ns", name, retention);
                let dur = Duration::from_nanos(retention.max(0) as u64);
                self.schedule(key, dur);
            }
            _ => {
                self.timers.cancel(&key);
            }
        }
    }

    /// Restarts a running retention timer after the duration changed.
    pub(super) fn refresh_retention(&mut self, name: &str) {
        if self.retention_pending(name) {
            self.start_retention(name);
        }
    }

    /// Handler of retention timer expiry.
    pub(super) fn retention_timeout(
        &mut self,
        name: &str,
    ) -> Result<(), CheckpointdError> {
        let (in_use, idle) = match self.replicas.get(name) {
            Some(replica) => (replica.ref_count() > 0, replica.is_idle()),
            None => return Ok(()),
        };
        if in_use {
            return Ok(());
        }
        if !idle {
            self.start_retention(name);
            return Ok(());
        }
        pf_info!("retention of '{}' expired", name);
        self.remove_replica(name)
    }
}
