//! Checkpoint client API communication stub implementation.

use std::net::SocketAddr;

use crate::server::{ApiReply, ApiRequest, ConnId};
use crate::utils::CheckpointdError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Client API connection stub.
pub struct ClientApiStub {
    /// My connection ID.
    conn: ConnId,
}

impl ClientApiStub {
    /// Creates a new API connection stub.
    pub fn new(conn: ConnId) -> Self {
        ClientApiStub { conn }
    }

    /// Connects to the given daemon address, returning a split pair of owned
    /// read/write halves on success.
    pub async fn connect(
        &self,
        addr: SocketAddr,
    ) -> Result<(ClientSendStub, ClientRecvStub), CheckpointdError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u64(self.conn).await?; // send my connection ID

        let (read_half, write_half) = stream.into_split();
        let send_stub = ClientSendStub::new(self.conn, write_half);
        let recv_stub = ClientRecvStub::new(self.conn, read_half);

        Ok((send_stub, recv_stub))
    }
}

/// Client write stub that owns a TCP write half.
pub struct ClientSendStub {
    /// My connection ID.
    conn: ConnId,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,
}

impl ClientSendStub {
    /// Creates a new write stub.
    fn new(conn: ConnId, conn_write: OwnedWriteHalf) -> Self {
        ClientSendStub { conn, conn_write }
    }

    /// Sends a request to established daemon connection.
    pub async fn send_req(
        &mut self,
        req: &ApiRequest,
    ) -> Result<(), CheckpointdError> {
        let req_bytes = encode_to_vec(req)?;
        self.conn_write.write_u64(req_bytes.len() as u64).await?; // send length first
        self.conn_write.write_all(&req_bytes[..]).await?;
        pf_trace!("conn {} sent req {:?}", self.conn, req);
        Ok(())
    }
}

/// Client read stub that owns a TCP read half.
pub struct ClientRecvStub {
    /// My connection ID.
    conn: ConnId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,
}

impl ClientRecvStub {
    /// Creates a new read stub.
    fn new(conn: ConnId, conn_read: OwnedReadHalf) -> Self {
        ClientRecvStub { conn, conn_read }
    }

    /// Receives a reply from established daemon connection. Not
    /// cancellation-safe.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, CheckpointdError> {
        let reply_len = self.conn_read.read_u64().await?;
        let mut reply_buf: Vec<u8> = vec![0; reply_len as usize];
        self.conn_read.read_exact(&mut reply_buf[..]).await?;
        let reply = decode_from_slice(&reply_buf)?;
        pf_trace!("conn {} recv reply {:?}", self.conn, reply);
        Ok(reply)
    }
}
