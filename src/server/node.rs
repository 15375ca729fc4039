//! Checkpoint daemon node: one reactor task driving a `Service` from its
//! peer transport, client API, and timer.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::server::{ApiReply, ConnId, ExternalApi, PeerEvent, TransportHub};
use crate::service::{ClientChannel, ClusterTransport, FieldMsg, Service, ServiceConfig};
use crate::store::NodeName;
use crate::utils::{CheckpointdError, Timer};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Where an outgoing peer message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerTarget {
    Nodes(Vec<NodeName>),
    All,
}

/// `ClusterTransport` that hands messages to the reactor loop, which owns
/// the actual `TransportHub`.
struct ChannelTransport {
    tx_out: mpsc::UnboundedSender<(PeerTarget, FieldMsg)>,
}

impl ClusterTransport for ChannelTransport {
    fn send_to_node(
        &mut self,
        node: &str,
        msg: FieldMsg,
    ) -> Result<(), CheckpointdError> {
        self.tx_out
            .send((PeerTarget::Nodes(vec![node.into()]), msg))?;
        Ok(())
    }

    fn send_to_nodes(
        &mut self,
        nodes: &[NodeName],
        msg: FieldMsg,
    ) -> Result<(), CheckpointdError> {
        self.tx_out.send((PeerTarget::Nodes(nodes.to_vec()), msg))?;
        Ok(())
    }

    fn broadcast(&mut self, msg: FieldMsg) -> Result<(), CheckpointdError> {
        self.tx_out.send((PeerTarget::All, msg))?;
        Ok(())
    }
}

/// `ClientChannel` that hands replies to the reactor loop, which owns the
/// actual `ExternalApi`.
struct ChannelReplies {
    tx_reply: mpsc::UnboundedSender<(ConnId, ApiReply)>,
}

impl ClientChannel for ChannelReplies {
    fn send_reply(
        &mut self,
        conn: ConnId,
        reply: ApiReply,
    ) -> Result<(), CheckpointdError> {
        self.tx_reply.send((conn, reply))?;
        Ok(())
    }
}

/// Channel capacities of a node's transport modules.
#[derive(Debug, Clone, Copy)]
pub struct ChanCaps {
    pub peer_send: usize,
    pub peer_recv: usize,
    pub client_req: usize,
    pub client_reply: usize,
}

impl Default for ChanCaps {
    fn default() -> Self {
        ChanCaps {
            peer_send: 10000,
            peer_recv: 100000,
            client_req: 10000,
            client_reply: 1000,
        }
    }
}

/// A running checkpoint daemon node.
pub struct CheckpointNode {
    service: Service,
    transport_hub: TransportHub,
    external_api: ExternalApi,
    timer: Timer,

    rx_out: mpsc::UnboundedReceiver<(PeerTarget, FieldMsg)>,
    rx_reply: mpsc::UnboundedReceiver<(ConnId, ApiReply)>,
}

impl CheckpointNode {
    /// Connects to every peer in `peer_addrs`, opens the client API, and
    /// announces the node to the group.
    pub async fn new_and_setup(
        me: NodeName,
        p2p_addr: SocketAddr,
        api_addr: SocketAddr,
        peer_addrs: HashMap<NodeName, SocketAddr>,
        config: ServiceConfig,
        caps: ChanCaps,
    ) -> Result<Self, CheckpointdError> {
        let mut transport_hub = TransportHub::new(me.clone());
        transport_hub
            .setup(p2p_addr, caps.peer_send, caps.peer_recv)
            .await?;
        if !peer_addrs.is_empty() {
            transport_hub.group_connect(&peer_addrs).await?;
        }

        let mut external_api = ExternalApi::new();
        external_api
            .setup(api_addr, caps.client_req, caps.client_reply)
            .await?;

        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut service = Service::new(
            me,
            config,
            Box::new(ChannelTransport { tx_out }),
            Box::new(ChannelReplies { tx_reply }),
        );
        for peer in transport_hub.peers() {
            service.mark_up(&peer);
        }
        service.start()?;

        Ok(CheckpointNode {
            service,
            transport_hub,
            external_api,
            timer: Timer::new(),
            rx_out,
            rx_reply,
        })
    }

    /// Main event loop; returns once a termination signal arrives.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), CheckpointdError> {
        loop {
            self.timer.arm_or_park(self.service.next_deadline());

            tokio::select! {
                // outgoing peer message
                out = self.rx_out.recv() => {
                    let Some((target, msg)) = out else {
                        return logged_err!("peer out channel has been closed");
                    };
                    let result = match target {
                        PeerTarget::Nodes(nodes) => {
                            self.transport_hub.send_msg(msg, &nodes).await
                        }
                        PeerTarget::All => self.transport_hub.broadcast_msg(msg).await,
                    };
                    if let Err(e) = result {
                        pf_error!("error sending peer msg: {}", e);
                    }
                },

                // outgoing client reply
                reply = self.rx_reply.recv() => {
                    let Some((conn, reply)) = reply else {
                        return logged_err!("reply channel has been closed");
                    };
                    if let Err(e) = self.external_api.send_reply(reply, conn).await {
                        pf_warn!("error replying to connection {}: {}", conn, e);
                    }
                },

                // peer message or peer loss
                event = self.transport_hub.recv_event() => {
                    let result = match event {
                        Ok(PeerEvent::Msg(peer, fields)) => {
                            pf_trace!("handling msg from {}", peer);
                            self.service.handle_peer_fields(&fields)
                        }
                        Ok(PeerEvent::Down(peer)) => {
                            self.service.handle_node_down(&peer)
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        pf_error!("error handling peer event: {}", e);
                    }
                },

                // client request
                req = self.external_api.get_req() => {
                    let result = match req {
                        Ok((conn, req)) => self.service.handle_client_req(conn, req),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        pf_error!("error handling client req: {}", e);
                    }
                },

                // timer expiry
                _ = self.timer.timeout() => {
                    if let Err(e) = self.service.handle_timeouts(Instant::now()) {
                        pf_error!("error handling timeouts: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("node caught termination signal");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;
    use crate::client::ClientApiStub;
    use crate::server::{ApiRequest, ClientCall, ReplyData};
    use crate::store::SUPPORTED_VERSION;

    #[test]
    fn channel_transport_targets() -> Result<(), CheckpointdError> {
        let (tx_out, mut rx_out) = mpsc::unbounded_channel();
        let mut transport = ChannelTransport { tx_out };
        let msg = FieldMsg::from([("t".to_string(), "ckpt".to_string())]);
        transport.send_to_node("n2", msg.clone())?;
        transport.broadcast(msg.clone())?;
        assert_eq!(
            rx_out.try_recv()?,
            (PeerTarget::Nodes(vec!["n2".into()]), msg.clone())
        );
        assert_eq!(rx_out.try_recv()?, (PeerTarget::All, msg));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_node_init() -> Result<(), CheckpointdError> {
        let mut node = CheckpointNode::new_and_setup(
            "solo".into(),
            "127.0.0.1:56800".parse()?,
            "127.0.0.1:56801".parse()?,
            HashMap::new(),
            ServiceConfig::default(),
            ChanCaps::default(),
        )
        .await?;
        let (tx_term, rx_term) = watch::channel(false);
        let reactor = tokio::spawn(async move { node.run(rx_term).await });

        let (mut send_stub, mut recv_stub) = ClientApiStub::new(11)
            .connect("127.0.0.1:56801".parse()?)
            .await?;
        send_stub
            .send_req(&ApiRequest::Req {
                client: 0,
                req_no: 1,
                timeout_ms: None,
                call: ClientCall::Init {
                    version: SUPPORTED_VERSION,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            ApiReply::Reply {
                client: 1,
                req_no: 1,
                result: Ok(ReplyData::ClientHandle(1)),
            }
        );

        tx_term.send(true)?;
        match reactor.await {
            Ok(result) => result,
            Err(e) => Err(CheckpointdError::msg(e.to_string())),
        }
    }
}
