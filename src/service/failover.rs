//! Checkpoint service -- set-active handover.
//!
//! The requesting node pauses every other holder, asks the current active
//! node to hand over, and is promoted once that node has drained its queue
//! up to the handover. The old active node announces the new one to the
//! whole group, which resumes paused requests against it.

use super::*;

use crate::server::RequestKind;
use crate::store::{CkptError, OpPayload, Operation, Origin};

/// A handover I requested.
#[derive(Debug)]
pub(super) struct ActiveSwitch {
    client: ClientHandle,
    req_no: RequestNo,
    old_active: NodeName,

    /// Map from paused holder -> whether it acknowledged the pause.
    acks: BTreeMap<NodeName, bool>,

    /// Whether the handover request went out to the old active node.
    requested: bool,
}

impl ActiveSwitch {
    fn is_request(&self, client: ClientHandle, req_no: RequestNo) -> bool {
        self.client == client && self.req_no == req_no
    }

    fn all_acked(&self) -> bool {
        self.acks.values().all(|&acked| acked)
    }
}

// Service set-active handling
impl Service {
    /// Starts handling a set-active request.
    pub(super) fn start_active_set(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        ckpt: CkptHandle,
    ) -> Result<(), CheckpointdError> {
        let ockpt = match self.resolve_ckpt(client, ckpt) {
            Ok(ockpt) if !ockpt.flags.write => Err(CkptError::Access),
            Ok(ockpt) if !ockpt.is_local_replica() => Err(CkptError::InvalidParam),
            other => other,
        };
        let name = match ockpt {
            Ok(ockpt) => ockpt.name,
            Err(e) => return self.respond(client, req_no, Err(e)),
        };
        if self.races.contains_key(&name) || self.switches.contains_key(&name) {
            return self.defer_request(client, req_no);
        }

        let (old_active, holders) = match self.replicas.get_mut(&name) {
            None => return self.respond(client, req_no, Err(CkptError::BadHandle)),
            Some(replica) if replica.is_active => {
                return self.respond(client, req_no, Ok(ReplyData::Done))
            }
            Some(replica) if replica.pending_pause || replica.joining => {
                return self.defer_request(client, req_no)
            }
            Some(replica) => {
                replica.pending_pause = true;
                (replica.active_node.clone(), replica.other_nodes(&self.me))
            }
        };
        let acks: BTreeMap<NodeName, bool> = holders
            .into_iter()
            .filter(|n| *n != old_active && self.is_up(n))
            .map(|n| (n, false))
            .collect();
        let paused: Vec<NodeName> = acks.keys().cloned().collect();
        pf_info!(
            "taking over '{}' from {}, pausing {:?}",
            name,
            old_active,
            paused
        );

        if let Some(req) = self.request_mut(client, req_no) {
            req.name = Some(name.clone());
            req.to_node = None;
        }
        self.switches.insert(
            name.clone(),
            ActiveSwitch {
                client,
                req_no,
                old_active,
                acks,
                requested: false,
            },
        );

        if paused.is_empty() {
            self.request_handover(&name)
        } else {
            let msg = CkptMessage::new(Subtype::ActiveSetBcast, &self.me, &name)
                .with_client(&self.me, client, req_no, RequestKind::ActiveSet);
            self.send_to_nodes(&paused, msg)
        }
    }

    /// Asks the old active node to hand over.
    fn request_handover(&mut self, name: &str) -> Result<(), CheckpointdError> {
        let (client, req_no, old_active) = match self.switches.get_mut(name) {
            Some(switch) => {
                switch.requested = true;
                (switch.client, switch.req_no, switch.old_active.clone())
            }
            None => return Ok(()),
        };
        if let Some(req) = self.request_mut(client, req_no) {
            req.to_node = Some(old_active.clone());
        }
        let msg = CkptMessage::new(Subtype::ActiveSet, &self.me, name)
            .with_client(&self.me, client, req_no, RequestKind::ActiveSet);
        self.send_to(&old_active, msg)
    }

    /// Handler of a pause request ahead of a handover.
    pub(super) fn handle_active_set_bcast(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        if let Some(replica) = self.replicas.get_mut(&msg.ckpt_name) {
            pf_debug!("pausing '{}' for {}", msg.ckpt_name, msg.from);
            replica.pending_pause = true;
        }
        self.send_to(
            &msg.from,
            msg.reply(Subtype::ActiveSetBcastReply, &self.me),
        )
    }

    pub(super) fn handle_active_set_bcast_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let ready = match self.switches.get_mut(&msg.ckpt_name) {
            Some(switch)
                if switch.is_request(msg.client_handle, msg.client_req_no)
                    && !switch.requested =>
            {
                if let Some(acked) = switch.acks.get_mut(&msg.from) {
                    *acked = true;
                }
                switch.all_acked()
            }
            _ => false,
        };
        if ready {
            self.request_handover(&msg.ckpt_name)?;
        }
        Ok(())
    }

    /// Handler of a handover request at the active node; it waits in the
    /// operation queue like any update.
    pub(super) fn handle_active_set(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        let op_no = match self.replicas.get_mut(&name) {
            Some(replica) if replica.is_active => {
                let op_no = replica.alloc_op_no();
                replica.enqueue(Operation::new(
                    op_no,
                    Origin {
                        host: msg.from.clone(),
                        client: msg.client_handle,
                        req_no: msg.client_req_no,
                    },
                    OpPayload::ActiveSet {
                        requester: msg.from.clone(),
                    },
                ));
                op_no
            }
            _ => {
                let reply = msg
                    .reply(Subtype::ActiveSetReply, &self.me)
                    .with_ret(Err(CkptError::FailedOperation));
                return self.send_to(&msg.from, reply);
            }
        };
        self.schedule_operation(&name, op_no);
        self.try_start_next(&name)
    }

    /// Gives up active status once the handover reached the queue head.
    pub(super) fn hand_over(
        &mut self,
        name: &str,
        op: Operation,
        requester: &str,
    ) -> Result<(), CheckpointdError> {
        let dropped = match self.replicas.get_mut(name) {
            Some(replica) => replica.demote(requester),
            None => return Ok(()),
        };
        for queued in &dropped {
            self.cancel_operation(name, queued.op_no);
        }
        pf_info!(
            "handed '{}' over to {}, dropping {} queued ops",
            name,
            requester,
            dropped.len()
        );

        let reply = op_message(&self.me, name, &op, Subtype::ActiveSetReply);
        self.send_to(requester, reply)?;
        self.broadcast(
            CkptMessage::new(Subtype::ActiveSetFinishBcast, &self.me, name)
                .with_active(requester),
        )?;
        self.apply_active_finish(name, requester)
    }

    /// Handler of the old active node's answer to my handover request.
    pub(super) fn handle_active_set_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        let (client, req_no) = (msg.client_handle, msg.client_req_no);
        let awaited = self
            .request(client, req_no)
            .is_some_and(|r| r.to_node.as_deref() == Some(msg.from.as_str()));
        let switch = self.switches.remove(&name);

        match msg.ret {
            Ok(()) => {
                if let Some(replica) = self.replicas.get_mut(&name) {
                    if !replica.is_active {
                        replica.promote(&self.me);
                        pf_info!("became active node of '{}'", name);
                    }
                }
                self.try_start_next(&name)?;
                if switch.is_none() {
                    // handover landed after I gave up on it
                    self.broadcast(
                        CkptMessage::new(Subtype::ActiveSetFinishBcast, &self.me, &name)
                            .with_active(&self.me),
                    )?;
                }
                if awaited {
                    self.respond(client, req_no, Ok(ReplyData::Done))?;
                }
            }
            Err(e) => {
                if switch.is_some() {
                    self.cancel_switch(&name)?;
                }
                if awaited {
                    self.respond(client, req_no, Err(e))?;
                }
            }
        }
        self.resume_deferred()
    }

    /// Handler of the announcement of a checkpoint's new active node.
    pub(super) fn handle_active_set_finish(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        pf_debug!(
            "{} announced {} as active node of '{}'",
            msg.from,
            msg.active_node,
            msg.ckpt_name
        );
        self.apply_active_finish(&msg.ckpt_name, &msg.active_node)
    }

    /// Unpauses `name` with `new_active` as its active node, re-routing
    /// everything that was headed elsewhere.
    fn apply_active_finish(
        &mut self,
        name: &str,
        new_active: &str,
    ) -> Result<(), CheckpointdError> {
        if let Some(replica) = self.replicas.get_mut(name) {
            replica.pending_pause = false;
            if new_active == self.me {
                if !replica.is_active {
                    replica.promote(&self.me);
                }
            } else if replica.is_active {
                replica.demote(new_active);
            } else {
                replica.active_node = new_active.into();
            }
        }
        for ockpt in self.open_ckpts.values_mut().filter(|o| o.name == name) {
            if let Target::Remote { active_node, .. } = &mut ockpt.target {
                *active_node = new_active.into();
            }
        }

        let stuck = self.requests_where(|r| {
            r.name.as_deref() == Some(name)
                && r.is_routed()
                && r.to_node.as_deref().is_some_and(|n| n != new_active)
        });
        for (client, req_no) in stuck {
            self.restart_request(client, req_no)?;
        }
        self.try_start_next(name)?;
        self.resume_deferred()
    }

    /// Abandons my handover of `name`, releasing every paused holder.
    fn cancel_switch(&mut self, name: &str) -> Result<(), CheckpointdError> {
        self.switches.remove(name);
        let active = match self.replicas.get_mut(name) {
            Some(replica) => {
                replica.pending_pause = false;
                replica.active_node.clone()
            }
            None => return Ok(()),
        };
        pf_warn!("handover of '{}' abandoned, {} stays active", name, active);
        self.broadcast(
            CkptMessage::new(Subtype::ActiveSetFinishBcast, &self.me, name)
                .with_active(&active),
        )
    }

    /// Handler of set-active request timer expiry.
    pub(super) fn active_set_timeout(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        let name = self.request(client, req_no).and_then(|r| r.name.clone());
        if let Some(name) = name {
            if self
                .switches
                .get(&name)
                .is_some_and(|s| s.is_request(client, req_no))
            {
                self.cancel_switch(&name)?;
            }
        }
        self.respond(client, req_no, Err(CkptError::Timeout))?;
        self.resume_deferred()
    }

    /// Adjusts every handover I requested to the loss of a peer.
    pub(super) fn switches_node_down(
        &mut self,
        dead: &str,
    ) -> Result<(), CheckpointdError> {
        let names: Vec<String> = self.switches.keys().cloned().collect();
        for name in names {
            let (lost_active, ready, request) = match self.switches.get_mut(&name) {
                Some(switch) => {
                    switch.acks.remove(dead);
                    (
                        switch.old_active == dead,
                        !switch.requested && switch.all_acked(),
                        (switch.client, switch.req_no),
                    )
                }
                None => continue,
            };
            if lost_active {
                self.cancel_switch(&name)?;
                self.restart_request(request.0, request.1)?;
            } else if ready {
                self.request_handover(&name)?;
            }
        }
        Ok(())
    }
}
