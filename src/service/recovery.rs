//! Checkpoint service -- group membership: node start and node loss.

use super::*;

use crate::server::ClientCall;
use crate::store::{Advance, CkptError, OpPayload};

/// What to do with one started operation after its node went away.
enum Salvage {
    /// Drop the operation and release the replica lock.
    Drop,
    /// Feed the vote outcome back into the operation.
    Advance(Advance),
}

// Service group membership handling
impl Service {
    /// Handler of a peer announcing itself.
    pub(super) fn handle_created(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        pf_info!("node {} joined the group", msg.from);
        // tell the newcomer which checkpoints exist
        let reply = msg
            .reply(Subtype::CreatedReply, &self.me)
            .with_param(&self.known_ckpts)?;
        self.send_to(&msg.from, reply)
    }

    pub(super) fn handle_created_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        pf_debug!("node {} is up", msg.from);
        let names: BTreeSet<String> = msg.param_as()?;
        self.known_ckpts.extend(names);
        Ok(())
    }

    /// Cleans up after the loss of node `dead`.
    pub(super) fn node_down(
        &mut self,
        dead: &str,
    ) -> Result<(), CheckpointdError> {
        if dead == self.me || !self.is_up(dead) {
            return Ok(());
        }
        pf_warn!("node {} left the group", dead);
        self.node_status.insert(dead.into(), false);

        self.races_node_down(dead)?;

        let held: Vec<String> = self
            .replicas
            .iter()
            .filter(|(_, r)| r.has_node(dead))
            .map(|(name, _)| name.clone())
            .collect();
        for name in held {
            if let Some(replica) = self.replicas.get_mut(&name) {
                replica.remove_node(dead);
            }
            self.active_gone(&name, dead)?;
        }

        self.switches_node_down(dead)?;
        self.ops_node_down(dead)?;

        let orphaned: Vec<CkptHandle> = self
            .open_ckpts
            .values()
            .filter(|o| {
                let remote_opener = matches!(
                    &o.opener,
                    Opener::Remote { host, .. } if host == dead
                );
                let remote_target = matches!(
                    &o.target,
                    Target::Remote { active_node, handle_node, .. }
                        if active_node == dead || handle_node == dead
                );
                remote_opener || remote_target
            })
            .map(|o| o.handle)
            .collect();
        for handle in orphaned {
            self.close_open_ckpt(handle)?;
        }

        let stuck = self.requests_where(|r| {
            r.to_node.as_deref() == Some(dead)
                && !matches!(r.call, ClientCall::Open { .. })
        });
        for (client, req_no) in stuck {
            let closing = self
                .request(client, req_no)
                .is_some_and(|r| matches!(r.call, ClientCall::Close { .. }));
            if closing {
                self.respond(client, req_no, Ok(ReplyData::Done))?;
            } else {
                self.restart_request(client, req_no)?;
            }
        }
        self.resume_deferred()
    }

    /// Adjusts the operations I drive as active node to the loss of `dead`.
    fn ops_node_down(&mut self, dead: &str) -> Result<(), CheckpointdError> {
        let driven: Vec<String> = self
            .replicas
            .iter()
            .filter(|(_, r)| r.is_active)
            .map(|(name, _)| name.clone())
            .collect();

        for name in driven {
            let op_nos = match self.replicas.get_mut(&name) {
                Some(replica) => {
                    replica.retain_pending(|op| op.origin.host != dead);
                    replica.started_op_nos()
                }
                None => continue,
            };

            for op_no in op_nos {
                let salvage = match self
                    .replicas
                    .get_mut(&name)
                    .and_then(|r| r.started_mut(op_no))
                {
                    Some(op) => match &op.payload {
                        OpPayload::ReplicaCreate { joiner } if joiner == dead => {
                            Salvage::Drop
                        }
                        OpPayload::ReplicaAdd { joiner } if joiner == dead => {
                            let aborted = op.abort(CkptError::FailedOperation);
                            let dropped = op.drop_node(dead);
                            if aborted == Advance::Rollback {
                                Salvage::Advance(aborted)
                            } else {
                                Salvage::Advance(dropped)
                            }
                        }
                        _ => Salvage::Advance(op.drop_node(dead)),
                    },
                    None => continue,
                };

                match salvage {
                    Salvage::Drop => {
                        pf_debug!("joiner of '{}' is gone, dropping op {}", name, op_no);
                        self.cancel_operation(&name, op_no);
                        if let Some(replica) = self.replicas.get_mut(&name) {
                            replica.take_started(op_no);
                            replica.locked = false;
                        }
                        self.try_start_next(&name)?;
                    }
                    Salvage::Advance(advance) => {
                        self.advance_op(&name, op_no, advance)?
                    }
                }
            }
        }
        Ok(())
    }
}
