//! Checkpoint service -- client request entrance.

use super::*;

use crate::server::{ClientCall, RequestKind};
use crate::store::{
    CkptError, Mutation, OpenFlags, ReadKind, Version, SUPPORTED_VERSION,
};

/// Checks a call against the open mode of the handle it goes through.
fn check_access(call: &ClientCall, flags: OpenFlags) -> CkptResult<()> {
    let need_write = matches!(
        call,
        ClientCall::SectionCreate { .. }
            | ClientCall::SectionDelete { .. }
            | ClientCall::Write { .. }
            | ClientCall::Overwrite { .. }
            | ClientCall::ExpirationSet { .. }
            | ClientCall::RetentionSet { .. }
            | ClientCall::Synchronize { .. }
            | ClientCall::ActiveSet { .. }
    );
    let need_read = matches!(
        call,
        ClientCall::Read { .. } | ClientCall::SectionQuery { .. }
    );
    if (need_write && !flags.write) || (need_read && !flags.read) {
        Err(CkptError::Access)
    } else {
        Ok(())
    }
}

/// Builds the message that carries a checkpoint call to the active node.
fn routed_message(
    me: &str,
    name: &str,
    client: ClientHandle,
    req_no: RequestNo,
    call: &ClientCall,
) -> Result<CkptMessage, CheckpointdError> {
    let mutation = match call.clone() {
        ClientCall::SectionCreate {
            id,
            expiration,
            data,
            ..
        } => Some(Mutation::SectionCreate {
            id,
            expiration,
            data,
        }),
        ClientCall::SectionDelete { id, .. } => {
            Some(Mutation::SectionDelete { id })
        }
        ClientCall::Write {
            id, offset, data, ..
        } => Some(Mutation::Write { id, offset, data }),
        ClientCall::Overwrite { id, data, .. } => {
            Some(Mutation::Overwrite { id, data })
        }
        ClientCall::ExpirationSet { id, expiration, .. } => {
            Some(Mutation::ExpirationSet { id, expiration })
        }
        ClientCall::RetentionSet { retention, .. } => {
            Some(Mutation::RetentionSet { retention })
        }
        _ => None,
    };
    let read = match call.clone() {
        ClientCall::Read {
            id, offset, size, ..
        } => Some(ReadKind::Section { id, offset, size }),
        ClientCall::SectionQuery {
            chosen, expiration, ..
        } => Some(ReadKind::Query { chosen, expiration }),
        ClientCall::StatusGet { .. } => Some(ReadKind::Status),
        _ => None,
    };

    let base = |subtype| {
        CkptMessage::new(subtype, me, name).with_client(
            me,
            client,
            req_no,
            call.kind(),
        )
    };
    match (mutation, read, call) {
        (Some(mutation), _, _) => base(Subtype::Update).with_param(&mutation),
        (_, Some(kind), _) => base(Subtype::Read).with_param(&kind),
        (_, _, ClientCall::Synchronize { .. }) => Ok(base(Subtype::Sync)),
        _ => logged_err!("call {:?} is not routed to the active node", call),
    }
}

// Service client requests entrance
impl Service {
    /// Handler of one external API request.
    pub(super) fn handle_api_req(
        &mut self,
        conn: ConnId,
        req: ApiRequest,
    ) -> Result<(), CheckpointdError> {
        let (client, req_no, timeout_ms, call) = match req {
            ApiRequest::Leave => return self.connection_left(conn),
            ApiRequest::Req {
                client,
                req_no,
                timeout_ms,
                call,
            } => (client, req_no, timeout_ms, call),
        };

        if let ClientCall::Init { version } = call {
            return self.client_init(conn, req_no, version);
        }

        match self.clients.get_mut(&client) {
            Some(c) if c.conn == conn => {
                if c.requests.contains_key(&req_no) {
                    pf_warn!(
                        "ignoring duplicate request {} of client {}",
                        req_no,
                        client
                    );
                    return Ok(());
                }
                c.requests.insert(req_no, Request::new(req_no, call));
            }
            _ => {
                return self.reply_client(
                    conn,
                    client,
                    req_no,
                    Err(CkptError::BadHandle),
                );
            }
        }

        let cap = self.config.request_timeout_ms;
        let timeout_ms = timeout_ms.map_or(cap, |t| t.min(cap)).max(1);
        self.schedule(
            TimerKey::Request { client, req_no },
            Duration::from_millis(timeout_ms),
        );
        self.start_request(client, req_no)
    }

    /// Starts (or restarts) handling of a recorded request.
    pub(super) fn start_request(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        let call = match self.request(client, req_no) {
            Some(req) => req.call.clone(),
            None => return Ok(()),
        };
        match call {
            ClientCall::Init { .. } => {
                self.respond(client, req_no, Err(CkptError::InvalidParam))
            }
            ClientCall::Finalize => self.client_finalize(client, req_no),
            ClientCall::Open { name, flags, attrs } => {
                self.start_open(client, req_no, name, flags, attrs)
            }
            ClientCall::Close { ckpt } => {
                self.start_close(client, req_no, ckpt)
            }
            ClientCall::Unlink { name } => {
                self.start_unlink(client, req_no, name)
            }
            ClientCall::ActiveSet { ckpt } => {
                self.start_active_set(client, req_no, ckpt)
            }
            call => self.start_routed(client, req_no, call),
        }
    }

    /// Forgets where a request went and handles it again from scratch.
    pub(super) fn restart_request(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        if let Some(req) = self.request_mut(client, req_no) {
            pf_debug!("restarting request {} of client {}", req_no, client);
            req.to_node = None;
        }
        self.start_request(client, req_no)
    }

    /// Completes a request with the given result.
    pub(super) fn respond(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        result: CkptResult<ReplyData>,
    ) -> Result<(), CheckpointdError> {
        self.timers.cancel(&TimerKey::Request { client, req_no });
        let conn = match self.clients.get_mut(&client) {
            Some(c) => {
                if c.requests.remove(&req_no).is_none() {
                    return Ok(());
                }
                c.deferred.retain(|&r| r != req_no);
                c.conn
            }
            None => return Ok(()),
        };
        if let Err(e) = &result {
            pf_debug!(
                "request {} of client {} failed: {}",
                req_no,
                client,
                e
            );
        }
        self.reply_client(conn, client, req_no, result)
    }

    /// Holds a request back until whatever blocks its checkpoint ends.
    pub(super) fn defer_request(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        if let Some(c) = self.clients.get_mut(&client) {
            if let Some(req) = c.requests.get_mut(&req_no) {
                req.to_node = None;
                if !c.deferred.contains(&req_no) {
                    pf_trace!("deferring request {} of client {}", req_no, client);
                    c.deferred.push_back(req_no);
                }
            }
        }
        Ok(())
    }

    /// Gives every deferred request another try.
    pub(super) fn resume_deferred(&mut self) -> Result<(), CheckpointdError> {
        let mut resumed = vec![];
        for c in self.clients.values_mut() {
            for req_no in c.deferred.drain(..) {
                resumed.push((c.handle, req_no));
            }
        }
        for (client, req_no) in resumed {
            self.start_request(client, req_no)?;
        }
        Ok(())
    }

    /// Whether calls on checkpoint `name` must wait for now.
    pub(super) fn is_blocked(&self, name: &str) -> bool {
        self.races.contains_key(name)
            || self.switches.contains_key(name)
            || self
                .replicas
                .get(name)
                .is_some_and(|r| r.pending_pause || r.joining)
    }

    pub(super) fn request(
        &self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Option<&Request> {
        self.clients.get(&client)?.requests.get(&req_no)
    }

    pub(super) fn request_mut(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Option<&mut Request> {
        self.clients.get_mut(&client)?.requests.get_mut(&req_no)
    }

    /// Every request matching the predicate.
    pub(super) fn requests_where<F>(
        &self,
        pred: F,
    ) -> Vec<(ClientHandle, RequestNo)>
    where
        F: Fn(&Request) -> bool,
    {
        self.clients
            .values()
            .flat_map(|c| {
                c.requests
                    .values()
                    .filter(|r| pred(r))
                    .map(move |r| (c.handle, r.req_no))
            })
            .collect()
    }

    /// Looks up a handle opened by the given local client.
    pub(super) fn resolve_ckpt(
        &self,
        client: ClientHandle,
        ckpt: CkptHandle,
    ) -> CkptResult<OpenCheckpoint> {
        match self.open_ckpts.get(&ckpt) {
            Some(ockpt) if ockpt.opener == Opener::Local(client) => {
                Ok(ockpt.clone())
            }
            _ => Err(CkptError::BadHandle),
        }
    }

    /// Handler of a reply to a call routed to the active node.
    pub(super) fn handle_routed_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let (client, req_no) = (msg.client_handle, msg.client_req_no);
        match self.request(client, req_no) {
            Some(req) if req.to_node.as_deref() == Some(msg.from.as_str()) => {}
            _ => {
                pf_debug!(
                    "ignoring stale {:?} from {} for request {}",
                    msg.subtype,
                    msg.from,
                    req_no
                );
                return Ok(());
            }
        }

        // wait for the group to settle on an active node, then retry
        if msg.ret == Err(CkptError::TryAgain) {
            pf_debug!(
                "{} is not active for '{}', holding request {}",
                msg.from,
                msg.ckpt_name,
                req_no
            );
            return self.defer_request(client, req_no);
        }

        let result = match msg.ret {
            Err(e) => Err(e),
            Ok(()) if msg.subtype == Subtype::ReadReply => {
                Ok(msg.param_as::<ReplyData>()?)
            }
            Ok(()) => Ok(ReplyData::Done),
        };
        self.respond(client, req_no, result)
    }

    /// Handler of request timer expiry.
    pub(super) fn request_timeout(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        let call = match self.request(client, req_no) {
            Some(req) => req.call.clone(),
            None => return Ok(()),
        };
        pf_debug!("request {} of client {} timed out", req_no, client);
        match call {
            ClientCall::Open { .. } => self.open_timeout(client, req_no),
            ClientCall::ActiveSet { .. } => {
                self.active_set_timeout(client, req_no)
            }
            _ => self.respond(client, req_no, Err(CkptError::Timeout)),
        }
    }
}

// Service per-call request handling
impl Service {
    fn client_init(
        &mut self,
        conn: ConnId,
        req_no: RequestNo,
        version: Version,
    ) -> Result<(), CheckpointdError> {
        if !SUPPORTED_VERSION.compatible(&version) {
            pf_warn!("client on conn {} has version {:?}", conn, version);
            return self.reply_client(conn, 0, req_no, Err(CkptError::Version));
        }
        let handle = self.next_client;
        self.next_client += 1;
        self.clients.insert(handle, Client::new(handle, conn));
        pf_debug!("client {} initialized on conn {}", handle, conn);
        self.reply_client(conn, handle, req_no, Ok(ReplyData::ClientHandle(handle)))
    }

    fn client_finalize(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        let busy = self
            .clients
            .get(&client)
            .is_some_and(|c| c.is_busy_besides(req_no));
        if busy {
            return self.respond(client, req_no, Err(CkptError::Busy));
        }
        self.respond(client, req_no, Ok(ReplyData::Done))?;
        self.clients.remove(&client);
        pf_debug!("client {} finalized", client);
        Ok(())
    }

    /// Finalizes every client of a connection that went away.
    fn connection_left(&mut self, conn: ConnId) -> Result<(), CheckpointdError> {
        let handles: Vec<ClientHandle> = self
            .clients
            .values()
            .filter(|c| c.conn == conn)
            .map(|c| c.handle)
            .collect();
        for handle in handles {
            self.drop_client(handle)?;
        }
        Ok(())
    }

    /// Removes a client without answering it, closing whatever it had open.
    fn drop_client(
        &mut self,
        client: ClientHandle,
    ) -> Result<(), CheckpointdError> {
        let c = match self.clients.remove(&client) {
            Some(c) => c,
            None => return Ok(()),
        };
        for &req_no in c.requests.keys() {
            self.timers.cancel(&TimerKey::Request { client, req_no });
        }
        for ckpt in c.open_ckpts {
            if let Some(Target::Remote {
                handle_node,
                remote_handle,
                ..
            }) = self.open_ckpts.get(&ckpt).map(|o| o.target.clone())
            {
                let name = self.open_ckpts[&ckpt].name.clone();
                let msg = CkptMessage::new(Subtype::CloseRemote, &self.me, &name)
                    .with_client(&self.me, client, 0, RequestKind::Close)
                    .with_param(&remote_handle)?;
                self.send_to(&handle_node, msg)?;
            }
            self.close_open_ckpt(ckpt)?;
        }
        pf_debug!("client {} dropped", client);
        Ok(())
    }

    fn start_close(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        ckpt: CkptHandle,
    ) -> Result<(), CheckpointdError> {
        let ockpt = match self.resolve_ckpt(client, ckpt) {
            Ok(ockpt) => ockpt,
            Err(e) => return self.respond(client, req_no, Err(e)),
        };
        match ockpt.target {
            Target::Remote {
                handle_node,
                remote_handle,
                ..
            } if self.is_up(&handle_node) => {
                if let Some(req) = self.request_mut(client, req_no) {
                    req.name = Some(ockpt.name.clone());
                    req.to_node = Some(handle_node.clone());
                }
                let msg =
                    CkptMessage::new(Subtype::CloseRemote, &self.me, &ockpt.name)
                        .with_client(&self.me, client, req_no, RequestKind::Close)
                        .with_param(&remote_handle)?;
                self.send_to(&handle_node, msg)
            }
            _ => {
                self.close_open_ckpt(ckpt)?;
                self.respond(client, req_no, Ok(ReplyData::Done))
            }
        }
    }

    /// Drops an open checkpoint handle and its reference on the local
    /// replica, if it holds one.
    pub(super) fn close_open_ckpt(
        &mut self,
        ckpt: CkptHandle,
    ) -> Result<(), CheckpointdError> {
        let ockpt = match self.open_ckpts.remove(&ckpt) {
            Some(ockpt) => ockpt,
            None => return Ok(()),
        };
        if let Opener::Local(client) = ockpt.opener {
            if let Some(c) = self.clients.get_mut(&client) {
                c.open_ckpts.remove(&ckpt);
            }
        }
        pf_debug!("closed handle {} on '{}'", ckpt, ockpt.name);
        if ockpt.is_local_replica() {
            self.release_replica_ref(&ockpt.name)?;
        }
        Ok(())
    }

    fn start_unlink(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        name: String,
    ) -> Result<(), CheckpointdError> {
        if self.races.contains_key(&name) {
            return self.defer_request(client, req_no);
        }
        let linked = self.replicas.get(&name).is_some_and(|r| !r.unlinked);
        if !linked && !self.known_ckpts.contains(&name) {
            return self.respond(client, req_no, Err(CkptError::NotExist));
        }
        self.unlink_local(&name)?;
        self.broadcast(CkptMessage::new(Subtype::UnlinkBcast, &self.me, &name))?;
        pf_info!("unlinked checkpoint '{}'", name);
        self.respond(client, req_no, Ok(ReplyData::Done))
    }

    /// Sends a call on an open checkpoint to the active node, or answers it
    /// here when it can be.
    fn start_routed(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        call: ClientCall,
    ) -> Result<(), CheckpointdError> {
        let ckpt = match call.ckpt() {
            Some(ckpt) => ckpt,
            None => {
                return self.respond(client, req_no, Err(CkptError::InvalidParam))
            }
        };
        let ockpt = match self
            .resolve_ckpt(client, ckpt)
            .and_then(|o| check_access(&call, o.flags).map(|_| o))
        {
            Ok(ockpt) => ockpt,
            Err(e) => return self.respond(client, req_no, Err(e)),
        };
        if self.is_blocked(&ockpt.name) {
            return self.defer_request(client, req_no);
        }

        let to_node = match &ockpt.target {
            Target::LocalReplica => match self.replicas.get(&ockpt.name) {
                Some(replica) => {
                    if let ClientCall::StatusGet { .. } = call {
                        let status = replica.status();
                        return self.respond(
                            client,
                            req_no,
                            Ok(ReplyData::Status(status)),
                        );
                    }
                    replica.active_node.clone()
                }
                None => {
                    return self.respond(client, req_no, Err(CkptError::BadHandle))
                }
            },
            Target::Remote { active_node, .. } => active_node.clone(),
        };

        let msg = routed_message(&self.me, &ockpt.name, client, req_no, &call)?
            .with_active(&to_node);
        if let Some(req) = self.request_mut(client, req_no) {
            req.name = Some(ockpt.name.clone());
            req.to_node = Some(to_node.clone());
        }
        self.send_to(&to_node, msg)
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::store::SectionsChosen;

    #[test]
    fn access_by_open_mode() {
        let write = ClientCall::Overwrite {
            ckpt: 1,
            id: vec![],
            data: vec![1],
        };
        let read = ClientCall::Read {
            ckpt: 1,
            id: vec![],
            offset: 0,
            size: 1,
        };
        let status = ClientCall::StatusGet { ckpt: 1 };
        assert_eq!(check_access(&write, OpenFlags::READ), Err(CkptError::Access));
        assert_eq!(check_access(&write, OpenFlags::WRITE), Ok(()));
        assert_eq!(check_access(&read, OpenFlags::WRITE), Err(CkptError::Access));
        assert_eq!(
            check_access(&read, OpenFlags::READ.with(OpenFlags::COLOCATED)),
            Ok(())
        );
        assert_eq!(check_access(&status, OpenFlags::COLOCATED), Ok(()));
    }

    #[test]
    fn routed_message_kinds() -> Result<(), CheckpointdError> {
        let msg = routed_message(
            "n1",
            "c1",
            3,
            7,
            &ClientCall::SectionCreate {
                ckpt: 1,
                id: b"s".to_vec(),
                expiration: 0,
                data: b"x".to_vec(),
            },
        )?;
        assert_eq!(msg.subtype, Subtype::Update);
        assert_eq!(msg.client_request, Some(RequestKind::SectionCreate));
        assert_eq!(
            msg.param_as::<Mutation>()?,
            Mutation::SectionCreate {
                id: b"s".to_vec(),
                expiration: 0,
                data: b"x".to_vec(),
            }
        );

        let msg = routed_message(
            "n1",
            "c1",
            3,
            8,
            &ClientCall::SectionQuery {
                ckpt: 1,
                chosen: SectionsChosen::Any,
                expiration: 0,
            },
        )?;
        assert_eq!(msg.subtype, Subtype::Read);
        assert_eq!(
            msg.param_as::<ReadKind>()?,
            ReadKind::Query {
                chosen: SectionsChosen::Any,
                expiration: 0,
            }
        );

        let msg =
            routed_message("n1", "c1", 3, 9, &ClientCall::Synchronize { ckpt: 1 })?;
        assert_eq!(msg.subtype, Subtype::Sync);
        assert!(msg.param.is_empty());
        assert!(
            routed_message("n1", "c1", 3, 10, &ClientCall::Close { ckpt: 1 })
                .is_err()
        );
        Ok(())
    }
}
