//! Checkpoint daemon peer-to-peer transport module implementation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::service::FieldMsg;
use crate::store::NodeName;
use crate::utils::CheckpointdError;

use bytes::{Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Longest node name accepted in a connection handshake.
const MAX_NAME_LEN: usize = 255;

/// Something that happened on the link to one peer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PeerEvent {
    /// A message arrived from the peer.
    Msg(NodeName, FieldMsg),

    /// The connection to the peer broke.
    Down(NodeName),
}

/// The peer-to-peer cluster transport hub module.
pub struct TransportHub {
    /// My node name.
    me: NodeName,

    /// Capacity of each per-peer send channel.
    chan_send_cap: usize,

    /// Map from peer name -> sender side of its send channel.
    tx_sends: HashMap<NodeName, mpsc::Sender<FieldMsg>>,

    /// Sender side of the event channel, cloned into every messenger.
    tx_event: Option<mpsc::Sender<PeerEvent>>,

    /// Receiver side of the event channel.
    rx_event: Option<mpsc::Receiver<PeerEvent>>,

    /// TCP listener for peer connections.
    peer_listener: Option<TcpListener>,

    /// Map from peer name -> join handle of its messenger thread.
    peer_messenger_handles: HashMap<NodeName, JoinHandle<()>>,
}

// TransportHub public API implementation
impl TransportHub {
    /// Creates a new transport hub for node `me`.
    pub fn new(me: impl Into<NodeName>) -> Self {
        TransportHub {
            me: me.into(),
            chan_send_cap: 0,
            tx_sends: HashMap::new(),
            tx_event: None,
            rx_event: None,
            peer_listener: None,
            peer_messenger_handles: HashMap::new(),
        }
    }

    /// Creates the event channel and binds the peer listener.
    pub async fn setup(
        &mut self,
        p2p_addr: SocketAddr,
        chan_send_cap: usize,
        chan_recv_cap: usize,
    ) -> Result<(), CheckpointdError> {
        if self.peer_listener.is_some() {
            return logged_err!("setup already done");
        }
        if chan_send_cap == 0 {
            return logged_err!("invalid chan_send_cap {}", chan_send_cap);
        }
        if chan_recv_cap == 0 {
            return logged_err!("invalid chan_recv_cap {}", chan_recv_cap);
        }
        self.chan_send_cap = chan_send_cap;

        let (tx_event, rx_event) = mpsc::channel(chan_recv_cap);
        self.tx_event = Some(tx_event);
        self.rx_event = Some(rx_event);

        let peer_listener = TcpListener::bind(p2p_addr).await?;
        self.peer_listener = Some(peer_listener);

        Ok(())
    }

    /// Names of the peers currently connected.
    pub fn peers(&self) -> Vec<NodeName> {
        let mut peers: Vec<NodeName> = self.tx_sends.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Connects to a peer actively.
    pub async fn connect_peer(
        &mut self,
        peer: &str,
        addr: SocketAddr,
    ) -> Result<(), CheckpointdError> {
        if self.tx_event.is_none() {
            return logged_err!("connect_peer called before setup");
        }
        if self.tx_sends.contains_key(peer) {
            return logged_err!("peer {} already connected", peer);
        }

        let mut stream = TcpStream::connect(addr).await?;
        Self::write_name(&self.me, &mut stream).await?;
        pf_debug!("connected to peer {} ({})", peer, addr);

        self.spawn_messenger(peer.into(), addr, stream)
    }

    /// Waits for a connection attempt from some peer, returning its name.
    pub async fn wait_on_peer(&mut self) -> Result<NodeName, CheckpointdError> {
        let (mut stream, addr) = match self.peer_listener {
            Some(ref listener) => listener.accept().await?,
            None => return logged_err!("wait_on_peer called before setup"),
        };
        let peer = Self::read_name(&mut stream).await?;
        if peer == self.me || self.tx_sends.contains_key(&peer) {
            return logged_err!("duplicate peer name '{}' waited on", peer);
        }
        pf_debug!("waited on peer {} ({})", peer, addr);

        self.spawn_messenger(peer.clone(), addr, stream)?;
        Ok(peer)
    }

    /// Connects to every given peer. Connection attempts only flow from the
    /// lexically larger name to the smaller one, so two nodes never dial
    /// each other at the same time.
    pub async fn group_connect(
        &mut self,
        peer_addrs: &HashMap<NodeName, SocketAddr>,
    ) -> Result<HashSet<NodeName>, CheckpointdError> {
        let mut peers: Vec<&NodeName> =
            peer_addrs.keys().filter(|&n| *n != self.me).collect();
        peers.sort();

        let mid_idx = peers.partition_point(|&n| *n < self.me);
        let mut connected: HashSet<NodeName> = HashSet::new();

        // peers with names smaller than mine are dialed
        for &peer in &peers[..mid_idx] {
            let addr = peer_addrs[peer];
            while self.connect_peer(peer, addr).await.is_err() {
                // retry until the peer is listening
                time::sleep(Duration::from_millis(10)).await;
            }
            connected.insert(peer.clone());
        }

        // peers with names larger than mine dial me
        for _ in &peers[mid_idx..] {
            let peer = self.wait_on_peer().await?;
            if peer < self.me || !peer_addrs.contains_key(&peer) {
                return logged_err!("unexpected peer '{}' waited on", peer);
            }
            connected.insert(peer);
        }

        pf_info!("group connected peers {:?}", peers);
        Ok(connected)
    }

    /// Sends a message to each of the given peers. Peers without a live
    /// connection are skipped.
    pub async fn send_msg(
        &mut self,
        msg: FieldMsg,
        targets: &[NodeName],
    ) -> Result<(), CheckpointdError> {
        for peer in targets {
            match self.tx_sends.get(peer) {
                Some(tx_send) => {
                    if tx_send.send(msg.clone()).await.is_err() {
                        pf_warn!("link to {} has closed", peer);
                        self.tx_sends.remove(peer);
                    }
                }
                None => {
                    pf_debug!("peer {} not connected, dropping msg", peer);
                }
            }
        }
        Ok(())
    }

    /// Sends a message to every connected peer.
    pub async fn broadcast_msg(
        &mut self,
        msg: FieldMsg,
    ) -> Result<(), CheckpointdError> {
        let peers = self.peers();
        self.send_msg(msg, &peers).await
    }

    /// Waits for the next event from any peer link.
    pub async fn recv_event(&mut self) -> Result<PeerEvent, CheckpointdError> {
        let event = match self.rx_event {
            Some(ref mut rx_event) => match rx_event.recv().await {
                Some(event) => event,
                None => return logged_err!("event channel has been closed"),
            },
            None => return logged_err!("recv_event called before setup"),
        };
        if let PeerEvent::Down(ref peer) = event {
            self.tx_sends.remove(peer);
            self.peer_messenger_handles.remove(peer);
        }
        Ok(event)
    }
}

// TransportHub handshake and messenger spawning
impl TransportHub {
    async fn write_name(
        name: &str,
        stream: &mut TcpStream,
    ) -> Result<(), CheckpointdError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(CheckpointdError::msg(format!(
                "invalid node name '{}'",
                name
            )));
        }
        stream.write_u16(name.len() as u16).await?;
        stream.write_all(name.as_bytes()).await?;
        Ok(())
    }

    async fn read_name(
        stream: &mut TcpStream,
    ) -> Result<NodeName, CheckpointdError> {
        let len = stream.read_u16().await? as usize;
        if len == 0 || len > MAX_NAME_LEN {
            return Err(CheckpointdError::msg(format!(
                "invalid node name length {}",
                len
            )));
        }
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf[..]).await?;
        Ok(String::from_utf8(buf)?)
    }

    fn spawn_messenger(
        &mut self,
        peer: NodeName,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<(), CheckpointdError> {
        let tx_event = match self.tx_event {
            Some(ref tx_event) => tx_event.clone(),
            None => return logged_err!("messenger spawned before setup"),
        };
        let (tx_send, rx_send) = mpsc::channel(self.chan_send_cap);
        self.tx_sends.insert(peer.clone(), tx_send);

        let handle = tokio::spawn(Self::peer_messenger_thread(
            peer.clone(),
            addr,
            stream,
            rx_send,
            tx_event,
        ));
        self.peer_messenger_handles.insert(peer, handle);
        Ok(())
    }
}

// TransportHub peer_messenger thread implementation
impl TransportHub {
    /// Writes a message through given TcpStream.
    async fn write_msg(
        msg: &FieldMsg,
        conn_write: &mut WriteHalf<'_>,
    ) -> Result<(), CheckpointdError> {
        let msg_bytes = encode_to_vec(msg)?;
        conn_write.write_u64(msg_bytes.len() as u64).await?; // send length first
        conn_write.write_all(&msg_bytes[..]).await?;
        Ok(())
    }

    /// Reads a message from given TcpStream. Partial frames survive in
    /// `msg_buf` across cancellations.
    async fn read_msg(
        msg_buf: &mut BytesMut,
        conn_read: &mut ReadHalf<'_>,
    ) -> Result<FieldMsg, CheckpointdError> {
        while msg_buf.len() < 8 {
            if conn_read.read_buf(msg_buf).await? == 0 {
                return Err(CheckpointdError::msg("connection closed"));
            }
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&msg_buf[..8]);
        let msg_end = 8 + u64::from_be_bytes(len_bytes) as usize;

        if msg_buf.capacity() < msg_end {
            msg_buf.reserve(msg_end - msg_buf.len());
        }
        while msg_buf.len() < msg_end {
            if conn_read.read_buf(msg_buf).await? == 0 {
                return Err(CheckpointdError::msg("connection closed"));
            }
        }
        let msg = decode_from_slice(&msg_buf[8..msg_end])?;

        if msg_buf.len() > msg_end {
            let buf_tail = Bytes::copy_from_slice(&msg_buf[msg_end..]);
            msg_buf.clear();
            msg_buf.extend_from_slice(&buf_tail);
        } else {
            msg_buf.clear();
        }
        Ok(msg)
    }

    /// Peer messenger thread function.
    async fn peer_messenger_thread(
        peer: NodeName,
        addr: SocketAddr,
        mut conn: TcpStream,
        mut rx_send: mpsc::Receiver<FieldMsg>,
        tx_event: mpsc::Sender<PeerEvent>,
    ) {
        pf_debug!("peer_messenger thread for {} ({}) spawned", peer, addr);

        let (mut conn_read, mut conn_write) = conn.split();
        let mut msg_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = rx_send.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = Self::write_msg(&msg, &mut conn_write).await {
                                pf_error!("error sending to {}: {}", peer, e);
                                break;
                            }
                            pf_trace!("sent to {} msg {:?}", peer, msg);
                        },
                        None => break, // hub dropped the link
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut msg_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            pf_trace!("recv from {} msg {:?}", peer, msg);
                            if let Err(e) = tx_event.send(PeerEvent::Msg(peer.clone(), msg)).await {
                                pf_error!("error sending to tx_event for {}: {}", peer, e);
                            }
                        },
                        Err(e) => {
                            pf_warn!("link to {} broken: {}", peer, e);
                            break;
                        }
                    }
                },
            }
        }

        if let Err(e) = tx_event.send(PeerEvent::Down(peer.clone())).await {
            pf_error!("error reporting {} down: {}", peer, e);
        }
        pf_debug!("peer_messenger thread for {} ({}) exitted", peer, addr);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn field_msg(text: &str) -> FieldMsg {
        FieldMsg::from([("t".to_string(), text.to_string())])
    }

    fn addrs(
        base: u16,
    ) -> Result<HashMap<NodeName, SocketAddr>, CheckpointdError> {
        Ok(HashMap::from([
            ("n0".to_string(), format!("127.0.0.1:{}", base).parse()?),
            ("n1".to_string(), format!("127.0.0.1:{}", base + 1).parse()?),
            ("n2".to_string(), format!("127.0.0.1:{}", base + 2).parse()?),
        ]))
    }

    #[test]
    fn hub_setup() -> Result<(), CheckpointdError> {
        let mut hub = TransportHub::new("n0");
        assert!(tokio_test::block_on(hub.setup(
            "127.0.0.1:52800".parse()?,
            0,
            0
        ))
        .is_err());
        tokio_test::block_on(hub.setup("127.0.0.1:52800".parse()?, 100, 100))?;
        assert!(hub.rx_event.is_some());
        assert!(hub.peer_listener.is_some());
        assert!(hub.peers().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_connect() -> Result<(), CheckpointdError> {
        let peer_addrs = addrs(54800)?;
        for me in ["n1", "n2"] {
            let peer_addrs = peer_addrs.clone();
            tokio::spawn(async move {
                let mut hub = TransportHub::new(me);
                hub.setup(peer_addrs[me], 1, 1).await?;
                hub.group_connect(&peer_addrs).await?;
                // keep the links open until the test ends
                time::sleep(Duration::from_secs(1)).await;
                Ok::<(), CheckpointdError>(())
            });
        }
        let mut hub = TransportHub::new("n0");
        hub.setup(peer_addrs["n0"], 1, 1).await?;
        let connected = hub.group_connect(&peer_addrs).await?;
        assert_eq!(
            connected,
            HashSet::from(["n1".to_string(), "n2".to_string()])
        );
        assert_eq!(hub.peers(), vec!["n1".to_string(), "n2".to_string()]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_recv_down() -> Result<(), CheckpointdError> {
        let peer_addrs = addrs(55800)?;
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        let peer_addrs2 = peer_addrs.clone();
        tokio::spawn(async move {
            let mut hub = TransportHub::new("n1");
            hub.setup(peer_addrs2["n1"], 5, 5).await?;
            hub.connect_peer("n0", peer_addrs2["n0"]).await?;
            let event = hub.recv_event().await?;
            assert_eq!(event, PeerEvent::Msg("n0".into(), field_msg("hello")));
            hub.send_msg(field_msg("world"), &["n0".into()]).await?;
            barrier2.wait().await;
            // dropping the hub closes the link
            Ok::<(), CheckpointdError>(())
        });
        let mut hub = TransportHub::new("n0");
        hub.setup(peer_addrs["n0"], 5, 5).await?;
        assert_eq!(hub.wait_on_peer().await?, "n1");
        hub.broadcast_msg(field_msg("hello")).await?;
        let event = hub.recv_event().await?;
        assert_eq!(event, PeerEvent::Msg("n1".into(), field_msg("world")));
        barrier.wait().await;
        assert_eq!(hub.recv_event().await?, PeerEvent::Down("n1".into()));
        assert!(hub.peers().is_empty());
        // sends to a lost peer are dropped quietly
        hub.send_msg(field_msg("late"), &["n1".into()]).await?;
        Ok(())
    }
}
