//! Checkpoint daemon client-facing API module implementation.

use std::net::SocketAddr;

use crate::store::{
    CkptAttributes, CkptHandle, CkptResult, CkptStatus, ClientHandle,
    OpenFlags, RequestNo, SaTime, SectionDescriptor, SectionsChosen, Version,
};
use crate::utils::CheckpointdError;

use bytes::{Bytes, BytesMut};

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Client connection ID type, chosen by the connecting side.
pub type ConnId = u64;

/// Kind of a client call, also carried on the wire between daemons.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum RequestKind {
    Init,
    Finalize,
    Open,
    Close,
    Unlink,
    RetentionSet,
    ActiveSet,
    StatusGet,
    SectionCreate,
    SectionDelete,
    ExpirationSet,
    SectionQuery,
    Write,
    Overwrite,
    Read,
    Sync,
}

/// One client library call.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ClientCall {
    Init {
        version: Version,
    },
    Finalize,
    Open {
        name: String,
        flags: OpenFlags,
        /// Creation attributes; `None` opens an existing checkpoint only.
        attrs: Option<CkptAttributes>,
    },
    Close {
        ckpt: CkptHandle,
    },
    Unlink {
        name: String,
    },
    RetentionSet {
        ckpt: CkptHandle,
        retention: SaTime,
    },
    ActiveSet {
        ckpt: CkptHandle,
    },
    StatusGet {
        ckpt: CkptHandle,
    },
    SectionCreate {
        ckpt: CkptHandle,
        id: Vec<u8>,
        expiration: SaTime,
        data: Vec<u8>,
    },
    SectionDelete {
        ckpt: CkptHandle,
        id: Vec<u8>,
    },
    ExpirationSet {
        ckpt: CkptHandle,
        id: Vec<u8>,
        expiration: SaTime,
    },
    SectionQuery {
        ckpt: CkptHandle,
        chosen: SectionsChosen,
        expiration: SaTime,
    },
    Write {
        ckpt: CkptHandle,
        id: Vec<u8>,
        offset: u64,
        data: Vec<u8>,
    },
    Overwrite {
        ckpt: CkptHandle,
        id: Vec<u8>,
        data: Vec<u8>,
    },
    Read {
        ckpt: CkptHandle,
        id: Vec<u8>,
        offset: u64,
        size: u64,
    },
    Synchronize {
        ckpt: CkptHandle,
    },
}

impl ClientCall {
    pub fn kind(&self) -> RequestKind {
        match self {
            ClientCall::Init { .. } => RequestKind::Init,
            ClientCall::Finalize => RequestKind::Finalize,
            ClientCall::Open { .. } => RequestKind::Open,
            ClientCall::Close { .. } => RequestKind::Close,
            ClientCall::Unlink { .. } => RequestKind::Unlink,
            ClientCall::RetentionSet { .. } => RequestKind::RetentionSet,
            ClientCall::ActiveSet { .. } => RequestKind::ActiveSet,
            ClientCall::StatusGet { .. } => RequestKind::StatusGet,
            ClientCall::SectionCreate { .. } => RequestKind::SectionCreate,
            ClientCall::SectionDelete { .. } => RequestKind::SectionDelete,
            ClientCall::ExpirationSet { .. } => RequestKind::ExpirationSet,
            ClientCall::SectionQuery { .. } => RequestKind::SectionQuery,
            ClientCall::Write { .. } => RequestKind::Write,
            ClientCall::Overwrite { .. } => RequestKind::Overwrite,
            ClientCall::Read { .. } => RequestKind::Read,
            ClientCall::Synchronize { .. } => RequestKind::Sync,
        }
    }

    /// Checkpoint handle the call operates on, if any.
    pub fn ckpt(&self) -> Option<CkptHandle> {
        match self {
            ClientCall::Close { ckpt }
            | ClientCall::RetentionSet { ckpt, .. }
            | ClientCall::ActiveSet { ckpt }
            | ClientCall::StatusGet { ckpt }
            | ClientCall::SectionCreate { ckpt, .. }
            | ClientCall::SectionDelete { ckpt, .. }
            | ClientCall::ExpirationSet { ckpt, .. }
            | ClientCall::SectionQuery { ckpt, .. }
            | ClientCall::Write { ckpt, .. }
            | ClientCall::Overwrite { ckpt, .. }
            | ClientCall::Read { ckpt, .. }
            | ClientCall::Synchronize { ckpt } => Some(*ckpt),
            _ => None,
        }
    }
}

/// Successful result payload of a client call.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ReplyData {
    Done,
    ClientHandle(ClientHandle),
    CkptHandle(CkptHandle),
    Data(Vec<u8>),
    Status(CkptStatus),
    Sections(Vec<SectionDescriptor>),
}

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Regular request.
    Req {
        /// Client handle returned by init; ignored for init itself.
        client: ClientHandle,

        /// Client-chosen request number.
        req_no: RequestNo,

        /// Caller deadline, capped by the daemon's request timeout.
        timeout_ms: Option<u64>,

        call: ClientCall,
    },

    /// Connection leave notification.
    Leave,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to regular request.
    Reply {
        client: ClientHandle,
        req_no: RequestNo,
        result: CkptResult<ReplyData>,
    },

    /// Reply to connection leave notification.
    Leave,
}

/// The external client-facing API module.
pub struct ExternalApi {
    /// Receiver side of the req channel.
    rx_req: Option<mpsc::Receiver<(ConnId, ApiRequest)>>,

    /// Map from connection ID -> sender side of its reply channel, shared
    /// with the client acceptor thread.
    tx_replies: Option<flashmap::ReadHandle<ConnId, mpsc::Sender<ApiReply>>>,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: Option<JoinHandle<()>>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module.
    pub fn new() -> Self {
        ExternalApi {
            rx_req: None,
            tx_replies: None,
            client_acceptor_handle: None,
        }
    }

    /// Spawns the client acceptor thread. Creates a req channel for
    /// buffering incoming client requests and per-connection reply channels
    /// for sending back replies. Creates a TCP listener for client
    /// connections.
    pub async fn setup(
        &mut self,
        api_addr: SocketAddr,
        chan_req_cap: usize,
        chan_reply_cap: usize,
    ) -> Result<(), CheckpointdError> {
        if self.client_acceptor_handle.is_some() {
            return logged_err!("setup already done");
        }
        if chan_req_cap == 0 {
            return logged_err!("invalid chan_req_cap {}", chan_req_cap);
        }
        if chan_reply_cap == 0 {
            return logged_err!("invalid chan_reply_cap {}", chan_reply_cap);
        }

        let (tx_req, rx_req) = mpsc::channel(chan_req_cap);
        self.rx_req = Some(rx_req);

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ConnId, mpsc::Sender<ApiReply>>();
        self.tx_replies = Some(tx_replies_read);

        let client_listener = TcpListener::bind(api_addr).await?;

        let client_acceptor_handle =
            tokio::spawn(Self::client_acceptor_thread(
                tx_req,
                chan_reply_cap,
                client_listener,
                tx_replies_write,
            ));
        self.client_acceptor_handle = Some(client_acceptor_handle);

        Ok(())
    }

    /// Returns whether a connection ID is connected to me.
    pub fn has_conn(&self, conn: ConnId) -> Result<bool, CheckpointdError> {
        match self.tx_replies {
            Some(ref tx_replies) => Ok(tx_replies.guard().contains_key(&conn)),
            None => logged_err!("has_conn called before setup"),
        }
    }

    /// Waits for the next client request.
    pub async fn get_req(
        &mut self,
    ) -> Result<(ConnId, ApiRequest), CheckpointdError> {
        match self.rx_req {
            Some(ref mut rx_req) => match rx_req.recv().await {
                Some((conn, req)) => Ok((conn, req)),
                None => logged_err!("req channel has been closed"),
            },
            None => logged_err!("get_req called before setup"),
        }
    }

    /// Sends a reply back to client by sending to the reply channel.
    pub async fn send_reply(
        &mut self,
        reply: ApiReply,
        conn: ConnId,
    ) -> Result<(), CheckpointdError> {
        let tx_reply = match self.tx_replies {
            Some(ref tx_replies) => tx_replies.guard().get(&conn).cloned(),
            None => return logged_err!("send_reply called before setup"),
        };
        match tx_reply {
            Some(tx_reply) => {
                tx_reply.send(reply).await?;
                Ok(())
            }
            None => {
                logged_err!("connection {} not found among active ones", conn)
            }
        }
    }
}

impl Default for ExternalApi {
    fn default() -> Self {
        Self::new()
    }
}

// ExternalApi client_acceptor thread implementation
impl ExternalApi {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        tx_req: mpsc::Sender<(ConnId, ApiRequest)>,
        chan_reply_cap: usize,
        client_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<ConnId, mpsc::Sender<ApiReply>>,
    ) {
        pf_debug!("client_acceptor thread spawned");

        if let Ok(local_addr) = client_listener.local_addr() {
            pf_info!("accepting clients on '{}'", local_addr);
        }

        loop {
            let (mut stream, addr) = match client_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!("error accepting client connection: {}", e);
                    continue;
                }
            };

            let conn = match stream.read_u64().await {
                Ok(conn) => conn,
                Err(e) => {
                    pf_error!("error receiving new connection ID: {}", e);
                    continue;
                }
            };

            let mut tx_replies_guard = tx_replies.guard();
            if let Some(sender) = tx_replies_guard.get(&conn) {
                if sender.is_closed() {
                    // if this connection ID has left before, garbage collect
                    // it now
                    tx_replies_guard.remove(conn);
                } else {
                    pf_error!("duplicate connection ID listened: {}", conn);
                    continue;
                }
            }
            pf_info!("accepted new connection {} ({})", conn, addr);

            let (tx_reply, rx_reply) = mpsc::channel(chan_reply_cap);
            tx_replies_guard.insert(conn, tx_reply);
            tx_replies_guard.publish();

            tokio::spawn(Self::client_servant_thread(
                conn,
                addr,
                stream,
                tx_req.clone(),
                rx_reply,
            ));
        }
    }
}

// ExternalApi client_servant thread implementation
impl ExternalApi {
    /// Reads a client request from given TcpStream.
    async fn read_req(
        // first 8 btyes being the request length, and the rest bytes being the
        // request itself
        req_buf: &mut BytesMut,
        conn_read: &mut ReadHalf<'_>,
    ) -> Result<ApiRequest, CheckpointdError> {
        // CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()`
        // here because this function is used as a `tokio::select!` branch and
        // that those two methods are not cancellation-safe

        // read length of request first
        while req_buf.len() < 8 {
            // req_len not wholesomely read from socket before last cancellation
            if conn_read.read_buf(req_buf).await? == 0 {
                return Err(CheckpointdError::msg("connection closed"));
            }
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&req_buf[..8]);
        let req_len = u64::from_be_bytes(len_bytes);

        // then read the request itself
        let req_end = 8 + req_len as usize;
        if req_buf.capacity() < req_end {
            // capacity not big enough, reserve more space
            req_buf.reserve(req_end - req_buf.len());
        }
        while req_buf.len() < req_end {
            if conn_read.read_buf(req_buf).await? == 0 {
                return Err(CheckpointdError::msg("connection closed"));
            }
        }
        let req = decode_from_slice(&req_buf[8..req_end])?;

        // if reached this point, no further cancellation to this call is
        // possible (because there are no more awaits ahead); discard bytes
        // used in this call
        if req_buf.len() > req_end {
            let buf_tail = Bytes::copy_from_slice(&req_buf[req_end..]);
            req_buf.clear();
            req_buf.extend_from_slice(&buf_tail);
        } else {
            req_buf.clear();
        }

        Ok(req)
    }

    /// Writes a reply through given TcpStream.
    async fn write_reply(
        reply: &ApiReply,
        conn_write: &mut WriteHalf<'_>,
    ) -> Result<(), CheckpointdError> {
        let reply_bytes = encode_to_vec(reply)?;
        conn_write.write_u64(reply_bytes.len() as u64).await?; // send length first
        conn_write.write_all(&reply_bytes[..]).await?;
        Ok(())
    }

    /// Client request listener and reply sender thread function.
    async fn client_servant_thread(
        conn: ConnId,
        addr: SocketAddr,
        mut stream: TcpStream,
        tx_req: mpsc::Sender<(ConnId, ApiRequest)>,
        mut rx_reply: mpsc::Receiver<ApiReply>,
    ) {
        pf_debug!("client_servant thread for {} ({}) spawned", conn, addr);

        let (mut conn_read, mut conn_write) = stream.split();
        let mut req_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // select between getting a new reply to send back and receiving
                // new client request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = Self::write_reply(&reply, &mut conn_write).await {
                                pf_error!("error replying to {}: {}", conn, e);
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // receives client request
                req = Self::read_req(&mut req_buf, &mut conn_read) => {
                    match req {
                        // connection leaving, let the service clean up, send
                        // dummy reply and break
                        Ok(ApiRequest::Leave) => {
                            if let Err(e) = tx_req.send((conn, ApiRequest::Leave)).await {
                                pf_error!("error sending to tx_req for {}: {}", conn, e);
                            }
                            if let Err(e) = Self::write_reply(&ApiReply::Leave, &mut conn_write).await {
                                pf_error!("error replying to {}: {}", conn, e);
                            } else {
                                pf_info!("connection {} has left", conn);
                            }
                            break;
                        },

                        Ok(req) => {
                            pf_trace!("request from {} req {:?}", conn, req);
                            if let Err(e) = tx_req.send((conn, req)).await {
                                pf_error!("error sending to tx_req for {}: {}", conn, e);
                            }
                        },

                        Err(e) => {
                            // probably the client exitted without leaving
                            pf_warn!("error reading request from {}: {}", conn, e);
                            if let Err(e) = tx_req.send((conn, ApiRequest::Leave)).await {
                                pf_error!("error sending to tx_req for {}: {}", conn, e);
                            }
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!("client_servant thread for {} ({}) exitted", conn, addr);
    }
}
