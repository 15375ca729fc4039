//! Checkpoint service -- open races and remote opens.
//!
//! Opening a name with no local replica broadcasts an open request. Every
//! peer answers with what it knows; once all answers are in, the opener
//! joins or remotely opens an existing holder, or creates the checkpoint
//! itself. Concurrent creators of the same name settle pairwise: the one
//! with the lexically smaller node name wins and the other waits for its
//! create announcement.

use super::*;

use crate::server::{ClientCall, RequestKind};
use crate::store::{CkptAttributes, CkptError, OpenFlags};

/// Progress of an open race.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(super) enum RaceStage {
    /// Collecting answers to the open broadcast.
    Broadcasting,
    /// Yielded to `winner`; waits for its create announcement.
    Waiting { winner: NodeName },
    /// Pulling a replica from `holder`.
    Joining { holder: NodeName },
    /// Opening against `holder`'s replica.
    Remote { holder: NodeName },
}

/// State of an open that has no local replica to go by.
#[derive(Debug)]
pub(super) struct OpenRace {
    client: ClientHandle,
    req_no: RequestNo,
    flags: OpenFlags,
    attrs: Option<CkptAttributes>,
    pub(super) stage: RaceStage,

    /// Map from peer -> its verdict and the active node it named, once
    /// answered.
    verdicts: BTreeMap<NodeName, Option<(OpenVerdict, NodeName)>>,

    /// First error any peer returned.
    error: Option<CkptError>,
}

impl OpenRace {
    fn new(
        client: ClientHandle,
        req_no: RequestNo,
        flags: OpenFlags,
        attrs: Option<CkptAttributes>,
        peers: Vec<NodeName>,
    ) -> Self {
        OpenRace {
            client,
            req_no,
            flags,
            attrs,
            stage: RaceStage::Broadcasting,
            verdicts: peers.into_iter().map(|p| (p, None)).collect(),
            error: None,
        }
    }

    pub(super) fn client(&self) -> ClientHandle {
        self.client
    }

    pub(super) fn req_no(&self) -> RequestNo {
        self.req_no
    }

    pub(super) fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn is_request(&self, client: ClientHandle, req_no: RequestNo) -> bool {
        self.client == client && self.req_no == req_no
    }

    /// Whether the race still collects broadcast answers.
    fn collecting(&self) -> bool {
        matches!(self.stage, RaceStage::Broadcasting | RaceStage::Waiting { .. })
    }

    fn all_answered(&self) -> bool {
        self.verdicts.values().all(Option::is_some)
    }

    /// The node to open against, preferring a replier holding the active
    /// replica itself.
    fn holder(&self) -> Option<NodeName> {
        let answered = || self.verdicts.iter().filter_map(|(n, v)| Some((n, v.as_ref()?)));
        answered()
            .find(|(_, (verdict, _))| *verdict == OpenVerdict::Active)
            .map(|(node, _)| node.clone())
            .or_else(|| {
                answered()
                    .find(|(_, (verdict, active))| {
                        matches!(verdict, OpenVerdict::Standby | OpenVerdict::Earlier)
                            && !active.is_empty()
                    })
                    .map(|(_, (_, active))| active.clone())
            })
    }
}

// Service open race handling
impl Service {
    /// Starts handling an open request.
    pub(super) fn start_open(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        name: String,
        flags: OpenFlags,
        attrs: Option<CkptAttributes>,
    ) -> Result<(), CheckpointdError> {
        if name.is_empty()
            || attrs
                .as_ref()
                .is_some_and(|a| a.max_sections == 0 || a.retention < 0)
        {
            return self.respond(client, req_no, Err(CkptError::InvalidParam));
        }
        if self.is_blocked(&name) {
            return self.defer_request(client, req_no);
        }

        if let Some(replica) = self.replicas.get(&name) {
            if let Err(e) = replica.check_open(attrs.as_ref()) {
                return self.respond(client, req_no, Err(e));
            }
            return self.finish_open(client, req_no, &name, flags, Target::LocalReplica);
        }

        if let Some(req) = self.request_mut(client, req_no) {
            req.name = Some(name.clone());
            req.to_node = None;
        }
        let race = OpenRace::new(client, req_no, flags, attrs, self.up_peers());
        self.races.insert(name.clone(), race);
        self.broadcast_race(&name)?;
        self.resolve_race(&name)
    }

    /// Sends the open broadcast of a race.
    fn broadcast_race(&mut self, name: &str) -> Result<(), CheckpointdError> {
        let race = match self.races.get(name) {
            Some(race) => race,
            None => return Ok(()),
        };
        pf_debug!("open race for '{}' broadcasting", name);
        let msg = CkptMessage::new(Subtype::OpenBcast, &self.me, name)
            .with_client(&self.me, race.client, race.req_no, RequestKind::Open)
            .with_param(&OpenParam {
                attrs: race.attrs.clone(),
                flags: race.flags,
            })?;
        self.broadcast(msg)
    }

    /// Restarts a race from the broadcast stage against the current peers.
    fn rebroadcast_race(&mut self, name: &str) -> Result<(), CheckpointdError> {
        let peers = self.up_peers();
        let (client, req_no) = match self.races.get_mut(name) {
            Some(race) => {
                race.stage = RaceStage::Broadcasting;
                race.verdicts = peers.into_iter().map(|p| (p, None)).collect();
                race.error = None;
                (race.client, race.req_no)
            }
            None => return Ok(()),
        };
        if let Some(req) = self.request_mut(client, req_no) {
            req.to_node = None;
        }
        self.broadcast_race(name)?;
        self.resolve_race(name)
    }

    /// Acts on a race once every peer has answered.
    fn resolve_race(&mut self, name: &str) -> Result<(), CheckpointdError> {
        let race = match self.races.get(name) {
            Some(race) if race.collecting() && race.all_answered() => race,
            _ => return Ok(()),
        };
        let (client, req_no) = (race.client, race.req_no);

        if let Some(e) = race.error {
            self.end_race(name)?;
            return self.respond(client, req_no, Err(e));
        }
        if let Some(holder) = race.holder().filter(|h| *h != self.me) {
            return self.open_against(name, holder);
        }
        if let RaceStage::Waiting { winner } = &race.stage {
            pf_debug!("open race for '{}' waiting on {}", name, winner);
            return Ok(());
        }
        if race.attrs.is_some() {
            self.create_and_open(name)
        } else {
            self.end_race(name)?;
            self.respond(client, req_no, Err(CkptError::NotExist))
        }
    }

    /// Moves a race on to an existing holder of the checkpoint.
    fn open_against(
        &mut self,
        name: &str,
        holder: NodeName,
    ) -> Result<(), CheckpointdError> {
        let (client, req_no, param, colocated) = match self.races.get_mut(name) {
            Some(race) => {
                let colocated = race.flags.colocated;
                race.stage = if colocated {
                    RaceStage::Joining {
                        holder: holder.clone(),
                    }
                } else {
                    RaceStage::Remote {
                        holder: holder.clone(),
                    }
                };
                let param = OpenParam {
                    attrs: race.attrs.clone(),
                    flags: race.flags,
                };
                (race.client, race.req_no, param, colocated)
            }
            None => return Ok(()),
        };
        if let Some(req) = self.request_mut(client, req_no) {
            req.to_node = Some(holder.clone());
        }

        let subtype = if colocated {
            pf_debug!("joining '{}' from {}", name, holder);
            Subtype::ReplicaCreate
        } else {
            pf_debug!("opening '{}' remotely at {}", name, holder);
            Subtype::OpenRemote
        };
        let msg = CkptMessage::new(subtype, &self.me, name)
            .with_client(&self.me, client, req_no, RequestKind::Open)
            .with_param(&param)?;
        self.send_to(&holder, msg)
    }

    /// Creates the checkpoint here, opens it, and announces the creation.
    fn create_and_open(&mut self, name: &str) -> Result<(), CheckpointdError> {
        let race = match self.races.remove(name) {
            Some(race) => race,
            None => return Ok(()),
        };
        let attrs = match race.attrs {
            Some(attrs) => attrs,
            None => {
                self.respond(race.client, race.req_no, Err(CkptError::NotExist))?;
                return self.resume_deferred();
            }
        };

        if !self.replicas.contains_key(name) {
            self.replicas
                .insert(name.into(), Replica::create(name, attrs, &self.me));
            pf_info!("created checkpoint '{}'", name);
        }
        self.known_ckpts.insert(name.into());
        self.broadcast(
            CkptMessage::new(Subtype::CkptCreateBcast, &self.me, name)
                .with_active(&self.me),
        )?;
        self.finish_open(race.client, race.req_no, name, race.flags, Target::LocalReplica)?;
        self.resume_deferred()
    }

    /// Ends a race and lets whatever waited on it proceed.
    pub(super) fn end_race(&mut self, name: &str) -> Result<(), CheckpointdError> {
        if self.races.remove(name).is_some() {
            self.resume_deferred()?;
        }
        Ok(())
    }

    /// Hands out a new open checkpoint handle to the requesting client. If
    /// the request is gone by now, whatever was acquired for it is
    /// released instead.
    pub(super) fn finish_open(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
        name: &str,
        flags: OpenFlags,
        target: Target,
    ) -> Result<(), CheckpointdError> {
        if self.request(client, req_no).is_none() {
            pf_debug!("open of '{}' completed without its request", name);
            return match target {
                Target::LocalReplica => {
                    if self.replicas.get(name).is_some_and(|r| r.ref_count() == 0) {
                        self.start_retention(name);
                    }
                    Ok(())
                }
                Target::Remote {
                    handle_node,
                    remote_handle,
                    ..
                } => self.release_remote(name, &handle_node, remote_handle),
            };
        }

        let handle =
            self.open_handle(name, flags, Opener::Local(client), target);
        self.respond(client, req_no, Ok(ReplyData::CkptHandle(handle)))
    }

    /// Registers an open checkpoint handle.
    fn open_handle(
        &mut self,
        name: &str,
        flags: OpenFlags,
        opener: Opener,
        target: Target,
    ) -> CkptHandle {
        let handle = self.next_ckpt;
        self.next_ckpt += 1;

        if let Opener::Local(client) = &opener {
            if let Some(c) = self.clients.get_mut(client) {
                c.open_ckpts.insert(handle);
            }
        }
        if target == Target::LocalReplica {
            if let Some(replica) = self.replicas.get_mut(name) {
                replica.open_ref();
            }
            self.timers.cancel(&TimerKey::Retention { name: name.into() });
        }
        pf_debug!("opened handle {} on '{}' for {:?}", handle, name, opener);
        self.open_ckpts.insert(
            handle,
            OpenCheckpoint {
                handle,
                name: name.into(),
                flags,
                opener,
                target,
            },
        );
        handle
    }

    /// Releases a remote open nobody is waiting for anymore.
    fn release_remote(
        &mut self,
        name: &str,
        handle_node: &str,
        remote_handle: CkptHandle,
    ) -> Result<(), CheckpointdError> {
        let msg = CkptMessage::new(Subtype::CloseRemote, &self.me, name)
            .with_origin(&self.me, 0, 0)
            .with_param(&remote_handle)?;
        self.send_to(handle_node, msg)
    }

    /// Handler of open broadcast from a peer.
    pub(super) fn handle_open_bcast(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let param: OpenParam = msg.param_as()?;
        let requester = msg.from.clone();
        let mut ret = Ok(());

        let (verdict, active) = if let Some(race) = self.races.get_mut(&msg.ckpt_name)
        {
            match &race.stage {
                RaceStage::Broadcasting => {
                    if race.attrs.is_some()
                        && (param.attrs.is_none() || self.me < requester)
                    {
                        (OpenVerdict::RaceHigh, String::new())
                    } else if param.attrs.is_some() {
                        pf_debug!(
                            "yielding open race for '{}' to {}",
                            msg.ckpt_name,
                            requester
                        );
                        race.stage = RaceStage::Waiting {
                            winner: requester.clone(),
                        };
                        (OpenVerdict::RaceLow, String::new())
                    } else {
                        (OpenVerdict::NoReplica, String::new())
                    }
                }
                RaceStage::Waiting { .. } => (OpenVerdict::NoReplica, String::new()),
                RaceStage::Joining { holder } | RaceStage::Remote { holder } => {
                    (OpenVerdict::Earlier, holder.clone())
                }
            }
        } else if let Some(replica) = self.replicas.get(&msg.ckpt_name) {
            if replica.is_active {
                ret = replica.check_open(param.attrs.as_ref());
                (OpenVerdict::Active, self.me.clone())
            } else {
                (OpenVerdict::Standby, replica.active_node.clone())
            }
        } else {
            (OpenVerdict::NoReplica, String::new())
        };

        let reply = msg
            .reply(Subtype::OpenBcastReply, &self.me)
            .with_active(&active)
            .with_ret(ret)
            .with_param(&verdict)?;
        self.send_to(&requester, reply)
    }

    /// Handler of a peer's answer to my open broadcast.
    pub(super) fn handle_open_bcast_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let verdict: OpenVerdict = msg.param_as()?;
        let name = msg.ckpt_name.clone();
        match self.races.get_mut(&name) {
            Some(race)
                if race.is_request(msg.client_handle, msg.client_req_no)
                    && race.collecting()
                    && race.verdicts.contains_key(&msg.from) =>
            {
                race.verdicts.insert(
                    msg.from.clone(),
                    Some((verdict, msg.active_node.clone())),
                );
                if let Err(e) = msg.ret {
                    race.error.get_or_insert(e);
                }
                if verdict == OpenVerdict::RaceHigh
                    && race.stage == RaceStage::Broadcasting
                {
                    race.stage = RaceStage::Waiting {
                        winner: msg.from.clone(),
                    };
                }
            }
            _ => {
                pf_debug!("ignoring stale open answer from {}", msg.from);
                return Ok(());
            }
        }
        self.resolve_race(&name)
    }

    /// Handler of a peer announcing it created a checkpoint.
    pub(super) fn handle_ckpt_create_bcast(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        self.known_ckpts.insert(name.clone());
        self.send_to(&msg.from, msg.reply(Subtype::CkptCreateBcastReply, &self.me))?;
        if self.races.get(&name).is_some_and(|r| r.collecting()) {
            self.open_against(&name, msg.from)?;
        }
        Ok(())
    }

    pub(super) fn handle_ckpt_create_bcast_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        pf_trace!("{} saw creation of '{}'", msg.from, msg.ckpt_name);
        Ok(())
    }

    /// Handler of a remote open against my replica.
    pub(super) fn handle_open_remote(
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

        let reply = msg
            .reply(Subtype::OpenRemoteReply, &self.me)
            .with_active(&self.me);
        let reply = match ret {
            Ok(()) => {
                let opener = Opener::Remote {
                    host: msg.client_host.clone(),
                    client: msg.client_handle,
                };
                let handle = self.open_handle(
                    &name,
                    param.flags,
                    opener,
                    Target::LocalReplica,
                );
                reply.with_param(&handle)?
            }
            Err(e) => reply.with_ret(Err(e)),
        };
        self.send_to(&msg.from, reply)
    }

    /// Handler of the answer to my remote open.
    pub(super) fn handle_open_remote_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let name = msg.ckpt_name.clone();
        let expected = RaceStage::Remote {
            holder: msg.from.clone(),
        };
        let current = self.races.get(&name).is_some_and(|r| {
            r.is_request(msg.client_handle, msg.client_req_no) && r.stage == expected
        });
        if !current {
            if msg.ret.is_ok() {
                let remote_handle: CkptHandle = msg.param_as()?;
                self.release_remote(&name, &msg.from, remote_handle)?;
            }
            return Ok(());
        }

        let race = match self.races.remove(&name) {
            Some(race) => race,
            None => return Ok(()),
        };
        match msg.ret {
            Ok(()) => {
                let remote_handle: CkptHandle = msg.param_as()?;
                let target = Target::Remote {
                    active_node: msg.active_node.clone(),
                    handle_node: msg.from.clone(),
                    remote_handle,
                };
                self.finish_open(race.client, race.req_no, &name, race.flags, target)?;
            }
            Err(e) => self.respond(race.client, race.req_no, Err(e))?,
        }
        self.resume_deferred()
    }

    /// Handler of a remote close of one of my open handles.
    pub(super) fn handle_close_remote(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let handle: CkptHandle = msg.param_as()?;
        let opener = Opener::Remote {
            host: msg.client_host.clone(),
            client: msg.client_handle,
        };
        let owned = self
            .open_ckpts
            .get(&handle)
            .is_some_and(|o| o.opener == opener || msg.client_handle == 0);
        let ret = if owned {
            self.close_open_ckpt(handle)?;
            Ok(())
        } else {
            Err(CkptError::BadHandle)
        };
        self.send_to(
            &msg.from,
            msg.reply(Subtype::CloseRemoteReply, &self.me).with_ret(ret),
        )
    }

    /// Handler of the answer to my remote close.
    pub(super) fn handle_close_remote_reply(
        &mut self,
        msg: CkptMessage,
    ) -> Result<(), CheckpointdError> {
        let (client, req_no) = (msg.client_handle, msg.client_req_no);
        let ckpt = match self.request(client, req_no) {
            Some(req) if req.to_node.as_deref() == Some(msg.from.as_str()) => {
                match req.call {
                    ClientCall::Close { ckpt } => ckpt,
                    _ => return Ok(()),
                }
            }
            _ => return Ok(()),
        };
        if let Err(e) = msg.ret {
            pf_warn!("remote close at {} failed: {}", msg.from, e);
        }
        self.close_open_ckpt(ckpt)?;
        self.respond(client, req_no, Ok(ReplyData::Done))
    }

    /// Handler of open request timer expiry.
    pub(super) fn open_timeout(
        &mut self,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<(), CheckpointdError> {
        let name = self.request(client, req_no).and_then(|r| r.name.clone());
        let stage = name
            .as_ref()
            .and_then(|n| self.races.get(n))
            .filter(|r| r.is_request(client, req_no))
            .map(|r| {
                (r.stage.clone(), r.attrs.is_some() && r.flags.colocated)
            });

        // only a colocated creator may fall back to a replica of its own
        match (name, stage) {
            (Some(name), Some((RaceStage::Broadcasting, true)))
            | (Some(name), Some((RaceStage::Waiting { .. }, true))) => {
                pf_warn!("open race for '{}' timed out, creating locally", name);
                self.create_and_open(&name)
            }
            (Some(name), Some((stage, _))) => {
                self.races.remove(&name);
                if let RaceStage::Joining { .. } = stage {
                    if self.replicas.get(&name).is_some_and(|r| r.joining) {
                        self.remove_replica(&name)?;
                    }
                }
                self.respond(client, req_no, Err(CkptError::Timeout))?;
                self.resume_deferred()
            }
            _ => self.respond(client, req_no, Err(CkptError::Timeout)),
        }
    }

    /// Adjusts every race to the loss of a peer.
    pub(super) fn races_node_down(
        &mut self,
        dead: &str,
    ) -> Result<(), CheckpointdError> {
        let names: Vec<String> = self.races.keys().cloned().collect();
        for name in names {
            let restart = match self.races.get_mut(&name) {
                Some(race) => {
                    if race.collecting() {
                        race.verdicts.remove(dead);
                    }
                    match &race.stage {
                        RaceStage::Waiting { winner } => winner == dead,
                        RaceStage::Joining { holder }
                        | RaceStage::Remote { holder } => holder == dead,
                        RaceStage::Broadcasting => false,
                    }
                }
                None => continue,
            };

            if restart {
                pf_debug!("open race for '{}' lost {}, restarting", name, dead);
                if self.replicas.get(&name).is_some_and(|r| r.joining) {
                    self.remove_replica(&name)?;
                }
                self.rebroadcast_race(&name)?;
            } else {
                self.resolve_race(&name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod open_tests {
    use super::*;

    fn answered(
        race: &mut OpenRace,
        node: &str,
        verdict: OpenVerdict,
        active: &str,
    ) {
        race.verdicts
            .insert(node.into(), Some((verdict, active.into())));
    }

    #[test]
    fn holder_prefers_active() {
        let mut race = OpenRace::new(
            1,
            1,
            OpenFlags::READ,
            None,
            vec!["n2".into(), "n3".into(), "n4".into()],
        );
        assert!(race.collecting());
        assert!(!race.all_answered());
        answered(&mut race, "n2", OpenVerdict::Standby, "n4");
        assert_eq!(race.holder(), Some("n4".into()));
        answered(&mut race, "n3", OpenVerdict::NoReplica, "");
        answered(&mut race, "n4", OpenVerdict::Active, "n4");
        assert!(race.all_answered());
        assert_eq!(race.holder(), Some("n4".into()));
    }

    #[test]
    fn holder_from_earlier_opener() {
        let mut race =
            OpenRace::new(1, 1, OpenFlags::READ, None, vec!["n2".into()]);
        assert_eq!(race.holder(), None);
        answered(&mut race, "n2", OpenVerdict::Earlier, "n5");
        assert_eq!(race.holder(), Some("n5".into()));
        race.stage = RaceStage::Remote {
            holder: "n5".into(),
        };
        assert!(!race.collecting());
        assert!(race.is_request(1, 1));
        assert!(!race.is_request(1, 2));
    }

    #[test]
    fn no_holder_from_races() {
        let mut race =
            OpenRace::new(1, 1, OpenFlags::READ, None, vec!["n2".into()]);
        answered(&mut race, "n2", OpenVerdict::RaceHigh, "");
        assert_eq!(race.holder(), None);
        answered(&mut race, "n2", OpenVerdict::Earlier, "");
        assert_eq!(race.holder(), None);
    }
}
