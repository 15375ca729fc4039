//! Checkpoint client session: one initialized client handle on one daemon
//! connection, offering every checkpoint call as an async method.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use crate::client::{ClientApiStub, ClientRecvStub, ClientSendStub};
use crate::server::{ApiReply, ApiRequest, ClientCall, ConnId, ReplyData};
use crate::store::{
    CkptAttributes, CkptHandle, CkptResult, CkptStatus,
    ClientHandle, OpenFlags, RequestNo, SaTime, SectionDescriptor,
    SectionsChosen, SUPPORTED_VERSION,
};
use crate::utils::CheckpointdError;

/// Which async call a pending request number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncCall {
    Open,
    Synchronize,
}

/// Outcome of an async call, handed out by `dispatch()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Open {
        invocation: RequestNo,
        result: CkptResult<CkptHandle>,
    },
    Synchronize {
        invocation: RequestNo,
        result: CkptResult<()>,
    },
}

/// Iterator over the section descriptors selected by a section query.
#[derive(Debug, Clone)]
pub struct SectionIter {
    descriptors: std::vec::IntoIter<SectionDescriptor>,
}

impl Iterator for SectionIter {
    type Item = SectionDescriptor;

    fn next(&mut self) -> Option<SectionDescriptor> {
        self.descriptors.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.descriptors.size_hint()
    }
}

/// An initialized checkpoint client.
pub struct CkptSession {
    send_stub: ClientSendStub,
    recv_stub: ClientRecvStub,

    /// Handle the daemon assigned at init.
    client: ClientHandle,

    next_req: RequestNo,

    /// Per-call deadline passed to the daemon, in millisecs.
    timeout_ms: Option<u64>,

    /// Async calls sent but not yet answered.
    async_calls: HashMap<RequestNo, AsyncCall>,

    /// Async calls answered but not yet dispatched.
    completions: VecDeque<Completion>,
}

impl CkptSession {
    /// Connects to the daemon at `addr` and initializes a client on it.
    pub async fn init(
        conn: ConnId,
        addr: SocketAddr,
        timeout_ms: Option<u64>,
    ) -> Result<Self, CheckpointdError> {
        let (mut send_stub, mut recv_stub) =
            ClientApiStub::new(conn).connect(addr).await?;
        send_stub
            .send_req(&ApiRequest::Req {
                client: 0,
                req_no: 0,
                timeout_ms,
                call: ClientCall::Init {
                    version: SUPPORTED_VERSION,
                },
            })
            .await?;

        let client = match recv_stub.recv_reply().await? {
            ApiReply::Reply {
                req_no: 0,
                result: Ok(ReplyData::ClientHandle(client)),
                ..
            } => client,
            ApiReply::Reply {
                result: Err(e), ..
            } => return logged_err!("init rejected by daemon: {}", e),
            reply => return logged_err!("unexpected init reply {:?}", reply),
        };
        pf_debug!("initialized as client {} on conn {}", client, conn);

        Ok(CkptSession {
            send_stub,
            recv_stub,
            client,
            next_req: 1,
            timeout_ms,
            async_calls: HashMap::new(),
            completions: VecDeque::new(),
        })
    }

    pub fn client(&self) -> ClientHandle {
        self.client
    }

    /// Finalizes the client; fails with `Busy` while it still has
    /// checkpoints open or calls outstanding.
    pub async fn finalize(&mut self) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self.call(ClientCall::Finalize).await?;
        Self::unpack_done(result)
    }

    /// Closes the connection. The daemon finalizes the client if that has
    /// not happened yet.
    pub async fn leave(mut self) -> Result<(), CheckpointdError> {
        self.send_stub.send_req(&ApiRequest::Leave).await?;
        loop {
            if let ApiReply::Leave = self.recv_stub.recv_reply().await? {
                return Ok(());
            }
        }
    }

    pub async fn open(
        &mut self,
        name: &str,
        flags: OpenFlags,
        attrs: Option<CkptAttributes>,
    ) -> Result<CkptResult<CkptHandle>, CheckpointdError> {
        let result = self
            .call(ClientCall::Open {
                name: name.into(),
                flags,
                attrs,
            })
            .await?;
        Self::unpack(result, |data| match data {
            ReplyData::CkptHandle(handle) => Some(handle),
            _ => None,
        })
    }

    /// Starts an open whose outcome arrives through `dispatch()`. Returns
    /// the invocation number identifying it.
    pub async fn open_async(
        &mut self,
        name: &str,
        flags: OpenFlags,
        attrs: Option<CkptAttributes>,
    ) -> Result<RequestNo, CheckpointdError> {
        let req_no = self
            .send_call(ClientCall::Open {
                name: name.into(),
                flags,
                attrs,
            })
            .await?;
        self.async_calls.insert(req_no, AsyncCall::Open);
        Ok(req_no)
    }

    pub async fn close(
        &mut self,
        ckpt: CkptHandle,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self.call(ClientCall::Close { ckpt }).await?;
        Self::unpack_done(result)
    }

    pub async fn unlink(
        &mut self,
        name: &str,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self.call(ClientCall::Unlink { name: name.into() }).await?;
        Self::unpack_done(result)
    }

    pub async fn retention_set(
        &mut self,
        ckpt: CkptHandle,
        retention: SaTime,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self
            .call(ClientCall::RetentionSet { ckpt, retention })
            .await?;
        Self::unpack_done(result)
    }

    /// Makes this node's replica the active one.
    pub async fn active_set(
        &mut self,
        ckpt: CkptHandle,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self.call(ClientCall::ActiveSet { ckpt }).await?;
        Self::unpack_done(result)
    }

    pub async fn status_get(
        &mut self,
        ckpt: CkptHandle,
    ) -> Result<CkptResult<CkptStatus>, CheckpointdError> {
        let result = self.call(ClientCall::StatusGet { ckpt }).await?;
        Self::unpack(result, |data| match data {
            ReplyData::Status(status) => Some(status),
            _ => None,
        })
    }

    pub async fn synchronize(
        &mut self,
        ckpt: CkptHandle,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self.call(ClientCall::Synchronize { ckpt }).await?;
        Self::unpack_done(result)
    }

    /// Starts a synchronize whose outcome arrives through `dispatch()`.
    pub async fn synchronize_async(
        &mut self,
        ckpt: CkptHandle,
    ) -> Result<RequestNo, CheckpointdError> {
        let req_no = self.send_call(ClientCall::Synchronize { ckpt }).await?;
        self.async_calls.insert(req_no, AsyncCall::Synchronize);
        Ok(req_no)
    }

    pub async fn section_create(
        &mut self,
        ckpt: CkptHandle,
        id: &[u8],
        expiration: SaTime,
        data: &[u8],
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self
            .call(ClientCall::SectionCreate {
                ckpt,
                id: id.to_vec(),
                expiration,
                data: data.to_vec(),
            })
            .await?;
        Self::unpack_done(result)
    }

    pub async fn section_delete(
        &mut self,
        ckpt: CkptHandle,
        id: &[u8],
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self
            .call(ClientCall::SectionDelete {
                ckpt,
                id: id.to_vec(),
            })
            .await?;
        Self::unpack_done(result)
    }

    pub async fn expiration_set(
        &mut self,
        ckpt: CkptHandle,
        id: &[u8],
        expiration: SaTime,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self
            .call(ClientCall::ExpirationSet {
                ckpt,
                id: id.to_vec(),
                expiration,
            })
            .await?;
        Self::unpack_done(result)
    }

    pub async fn write(
        &mut self,
        ckpt: CkptHandle,
        id: &[u8],
        offset: u64,
        data: &[u8],
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self
            .call(ClientCall::Write {
                ckpt,
                id: id.to_vec(),
                offset,
                data: data.to_vec(),
            })
            .await?;
        Self::unpack_done(result)
    }

    pub async fn overwrite(
        &mut self,
        ckpt: CkptHandle,
        id: &[u8],
        data: &[u8],
    ) -> Result<CkptResult<()>, CheckpointdError> {
        let result = self
            .call(ClientCall::Overwrite {
                ckpt,
                id: id.to_vec(),
                data: data.to_vec(),
            })
            .await?;
        Self::unpack_done(result)
    }

    /// Reads up to `size` bytes at `offset`, stopping at the end of the
    /// section.
    pub async fn read(
        &mut self,
        ckpt: CkptHandle,
        id: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<CkptResult<Vec<u8>>, CheckpointdError> {
        let result = self
            .call(ClientCall::Read {
                ckpt,
                id: id.to_vec(),
                offset,
                size,
            })
            .await?;
        Self::unpack(result, |data| match data {
            ReplyData::Data(bytes) => Some(bytes),
            _ => None,
        })
    }

    /// Queries the sections selected by `chosen` and `expiration`.
    pub async fn section_iter(
        &mut self,
        ckpt: CkptHandle,
        chosen: SectionsChosen,
        expiration: SaTime,
    ) -> Result<CkptResult<SectionIter>, CheckpointdError> {
        let result = self
            .call(ClientCall::SectionQuery {
                ckpt,
                chosen,
                expiration,
            })
            .await?;
        Self::unpack(result, |data| match data {
            ReplyData::Sections(descriptors) => Some(SectionIter {
                descriptors: descriptors.into_iter(),
            }),
            _ => None,
        })
    }

    /// Hands out the outcomes of async calls answered so far. If `block` is
    /// set and none are ready, waits until at least one is.
    pub async fn dispatch(
        &mut self,
        block: bool,
    ) -> Result<Vec<Completion>, CheckpointdError> {
        while block && self.completions.is_empty() && !self.async_calls.is_empty()
        {
            let reply = self.recv_stub.recv_reply().await?;
            self.stash_reply(reply)?;
        }
        Ok(self.completions.drain(..).collect())
    }

    /// Number of async calls not yet answered.
    pub fn outstanding(&self) -> usize {
        self.async_calls.len()
    }
}

// CkptSession request/reply plumbing
impl CkptSession {
    async fn send_call(
        &mut self,
        call: ClientCall,
    ) -> Result<RequestNo, CheckpointdError> {
        let req_no = self.next_req;
        self.next_req = self.next_req.wrapping_add(1);
        self.send_stub
            .send_req(&ApiRequest::Req {
                client: self.client,
                req_no,
                timeout_ms: self.timeout_ms,
                call,
            })
            .await?;
        Ok(req_no)
    }

    /// Sends a call and waits for its reply, stashing async outcomes that
    /// arrive meanwhile.
    async fn call(
        &mut self,
        call: ClientCall,
    ) -> Result<CkptResult<ReplyData>, CheckpointdError> {
        let req_no = self.send_call(call).await?;
        loop {
            match self.recv_stub.recv_reply().await? {
                ApiReply::Reply {
                    req_no: replied,
                    result,
                    ..
                } if replied == req_no => return Ok(result),
                reply => self.stash_reply(reply)?,
            }
        }
    }

    fn stash_reply(&mut self, reply: ApiReply) -> Result<(), CheckpointdError> {
        let (req_no, result) = match reply {
            ApiReply::Reply { req_no, result, .. } => (req_no, result),
            ApiReply::Leave => {
                return logged_err!("unexpected leave reply");
            }
        };
        let completion = match self.async_calls.remove(&req_no) {
            Some(AsyncCall::Open) => Completion::Open {
                invocation: req_no,
                result: Self::unpack(result, |data| match data {
                    ReplyData::CkptHandle(handle) => Some(handle),
                    _ => None,
                })?,
            },
            Some(AsyncCall::Synchronize) => Completion::Synchronize {
                invocation: req_no,
                result: Self::unpack_done(result)?,
            },
            None => {
                pf_warn!("dropping reply to unknown request {}", req_no);
                return Ok(());
            }
        };
        self.completions.push_back(completion);
        Ok(())
    }

    fn unpack<T>(
        result: CkptResult<ReplyData>,
        extract: impl FnOnce(ReplyData) -> Option<T>,
    ) -> Result<CkptResult<T>, CheckpointdError> {
        match result {
            Ok(data) => match extract(data) {
                Some(value) => Ok(Ok(value)),
                None => logged_err!("reply data of unexpected kind"),
            },
            Err(e) => Ok(Err(e)),
        }
    }

    fn unpack_done(
        result: CkptResult<ReplyData>,
    ) -> Result<CkptResult<()>, CheckpointdError> {
        Self::unpack(result, |data| match data {
            ReplyData::Done => Some(()),
            _ => None,
        })
    }
}
