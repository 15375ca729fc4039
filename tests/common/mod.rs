//! In-memory checkpoint cluster: every node's `Service` runs in-process and
//! peer traffic goes through one shared FIFO queue, delivered on demand.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::{Duration, Instant};

use checkpointd::{
    ApiReply, ApiRequest, CheckpointdError, CkptAttributes, CkptHandle,
    CkptResult, ClientCall, ClientChannel, ClientHandle, ClusterTransport,
    ConnId, CreationFlags, FieldMsg, NodeName, OpenFlags, ReplyData,
    RequestNo, Service, ServiceConfig, SUPPORTED_VERSION,
};

/// Upper bound on deliveries in one `deliver_all`, to catch message storms.
const MAX_DELIVERIES: usize = 100_000;

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, CheckpointdError> {
    m.lock().map_err(|e| CheckpointdError::msg(e.to_string()))
}

/// Shared network state: in-flight messages and the set of live nodes.
#[derive(Default)]
struct Net {
    queue: VecDeque<(NodeName, NodeName, FieldMsg)>,
    alive: BTreeSet<NodeName>,
}

struct QueueTransport {
    me: NodeName,
    net: Arc<Mutex<Net>>,
}

impl ClusterTransport for QueueTransport {
    fn send_to_node(
        &mut self,
        node: &str,
        msg: FieldMsg,
    ) -> Result<(), CheckpointdError> {
        let mut net = lock(&self.net)?;
        if net.alive.contains(node) {
            net.queue.push_back((self.me.clone(), node.into(), msg));
        }
        Ok(())
    }

    fn broadcast(&mut self, msg: FieldMsg) -> Result<(), CheckpointdError> {
        let mut net = lock(&self.net)?;
        let peers: Vec<NodeName> = net
            .alive
            .iter()
            .filter(|n| **n != self.me)
            .cloned()
            .collect();
        for peer in peers {
            net.queue.push_back((self.me.clone(), peer, msg.clone()));
        }
        Ok(())
    }
}

struct QueueReplies {
    replies: Arc<Mutex<Vec<(ConnId, ApiReply)>>>,
}

impl ClientChannel for QueueReplies {
    fn send_reply(
        &mut self,
        conn: ConnId,
        reply: ApiReply,
    ) -> Result<(), CheckpointdError> {
        lock(&self.replies)?.push((conn, reply));
        Ok(())
    }
}

/// A group of in-process checkpoint services.
pub struct Cluster {
    net: Arc<Mutex<Net>>,
    config: ServiceConfig,
    nodes: BTreeMap<NodeName, Service>,
    replies: HashMap<NodeName, Arc<Mutex<Vec<(ConnId, ApiReply)>>>>,

    /// Map from (node, client handle) -> connection the client sits on.
    conns: HashMap<(NodeName, ClientHandle), ConnId>,

    next_conn: ConnId,
    next_req: RequestNo,
}

impl Cluster {
    /// Brings up a fully connected group with the given config.
    pub fn with_config(
        names: &[&str],
        config: ServiceConfig,
    ) -> Result<Self, CheckpointdError> {
        let mut cluster = Cluster {
            net: Arc::new(Mutex::new(Net::default())),
            config,
            nodes: BTreeMap::new(),
            replies: HashMap::new(),
            conns: HashMap::new(),
            next_conn: 1,
            next_req: 1,
        };
        lock(&cluster.net)?.alive = names.iter().map(|n| n.to_string()).collect();
        for &name in names {
            cluster.spawn(name)?;
        }
        for service in cluster.nodes.values_mut() {
            service.start()?;
        }
        cluster.deliver_all()?;
        Ok(cluster)
    }

    pub fn new(names: &[&str]) -> Result<Self, CheckpointdError> {
        Self::with_config(names, ServiceConfig::default())
    }

    pub fn service(&self, node: &str) -> Result<&Service, CheckpointdError> {
        self.nodes
            .get(node)
            .ok_or_else(|| CheckpointdError::msg(format!("no node {}", node)))
    }

    fn service_mut(
        &mut self,
        node: &str,
    ) -> Result<&mut Service, CheckpointdError> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| CheckpointdError::msg(format!("no node {}", node)))
    }

    /// Delivers the oldest in-flight message. Returns false if none.
    pub fn deliver_one(&mut self) -> Result<bool, CheckpointdError> {
        let next = lock(&self.net)?.queue.pop_front();
        let (_, to, msg) = match next {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if let Some(service) = self.nodes.get_mut(&to) {
            service.handle_peer_fields(&msg)?;
        }
        Ok(true)
    }

    /// Delivers messages until the network is quiet.
    pub fn deliver_all(&mut self) -> Result<(), CheckpointdError> {
        for _ in 0..MAX_DELIVERIES {
            if !self.deliver_one()? {
                return Ok(());
            }
        }
        Err(CheckpointdError::msg("network never went quiet"))
    }

    /// Number of messages in flight.
    pub fn in_flight(&self) -> Result<usize, CheckpointdError> {
        Ok(lock(&self.net)?.queue.len())
    }

    /// Drops every message in flight.
    pub fn discard_all(&mut self) -> Result<(), CheckpointdError> {
        lock(&self.net)?.queue.clear();
        Ok(())
    }

    /// Crashes a node: its service vanishes along with any traffic from or
    /// to it, and the survivors are told it left.
    pub fn kill(&mut self, node: &str) -> Result<(), CheckpointdError> {
        self.crash(node)?;
        let survivors: Vec<NodeName> = self.nodes.keys().cloned().collect();
        for survivor in survivors {
            self.notify_down(&survivor, node)?;
        }
        self.deliver_all()
    }

    /// Crashes a node without telling anyone yet.
    pub fn crash(&mut self, node: &str) -> Result<(), CheckpointdError> {
        {
            let mut net = lock(&self.net)?;
            net.alive.remove(node);
            net.queue.retain(|(from, to, _)| from != node && to != node);
        }
        self.nodes.remove(node);
        Ok(())
    }

    /// Tells `observer` that `dead` left, without delivering anything.
    pub fn notify_down(
        &mut self,
        observer: &str,
        dead: &str,
    ) -> Result<(), CheckpointdError> {
        self.service_mut(observer)?.handle_node_down(dead)
    }

    /// Starts a new node that announces itself to the running group.
    pub fn join(&mut self, node: &str) -> Result<(), CheckpointdError> {
        lock(&self.net)?.alive.insert(node.to_string());
        self.spawn(node)?;
        for service in self.nodes.values_mut() {
            service.mark_up(node);
        }
        self.service_mut(node)?.start()?;
        self.deliver_all()
    }

    fn spawn(&mut self, name: &str) -> Result<(), CheckpointdError> {
        let sink = Arc::new(Mutex::new(vec![]));
        let mut service = Service::new(
            name,
            self.config.clone(),
            Box::new(QueueTransport {
                me: name.into(),
                net: self.net.clone(),
            }),
            Box::new(QueueReplies {
                replies: sink.clone(),
            }),
        );
        for peer in lock(&self.net)?.alive.iter() {
            service.mark_up(peer);
        }
        self.nodes.insert(name.to_string(), service);
        self.replies.insert(name.to_string(), sink);
        Ok(())
    }

    /// Fires the timers of `node` as if `after` had passed.
    pub fn fire_timeouts(
        &mut self,
        node: &str,
        after: Duration,
    ) -> Result<(), CheckpointdError> {
        self.service_mut(node)?
            .handle_timeouts(Instant::now() + after)?;
        self.deliver_all()
    }

    /// Attaches a new client to `node`.
    pub fn init_client(
        &mut self,
        node: &str,
    ) -> Result<ClientHandle, CheckpointdError> {
        let conn = self.next_conn;
        self.next_conn += 1;
        self.service_mut(node)?.handle_client_req(
            conn,
            ApiRequest::Req {
                client: 0,
                req_no: 0,
                timeout_ms: None,
                call: ClientCall::Init {
                    version: SUPPORTED_VERSION,
                },
            },
        )?;
        let reply = self.take_reply_on(node, conn, 0)?;
        match reply {
            Some(Ok(ReplyData::ClientHandle(handle))) => {
                self.conns.insert((node.into(), handle), conn);
                Ok(handle)
            }
            other => Err(CheckpointdError::msg(format!(
                "unexpected init reply {:?}",
                other
            ))),
        }
    }

    /// Submits a call without delivering anything.
    pub fn submit(
        &mut self,
        node: &str,
        client: ClientHandle,
        call: ClientCall,
    ) -> Result<RequestNo, CheckpointdError> {
        let conn = self.conn_of(node, client)?;
        let req_no = self.next_req;
        self.next_req += 1;
        self.service_mut(node)?.handle_client_req(
            conn,
            ApiRequest::Req {
                client,
                req_no,
                timeout_ms: None,
                call,
            },
        )?;
        Ok(req_no)
    }

    /// Takes the reply to a submitted call, if it has arrived.
    pub fn take_reply(
        &mut self,
        node: &str,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Result<Option<CkptResult<ReplyData>>, CheckpointdError> {
        let conn = self.conn_of(node, client)?;
        self.take_reply_on(node, conn, req_no)
    }

    /// Submits a call, lets the cluster settle, and returns its reply.
    pub fn call(
        &mut self,
        node: &str,
        client: ClientHandle,
        call: ClientCall,
    ) -> Result<CkptResult<ReplyData>, CheckpointdError> {
        let req_no = self.submit(node, client, call)?;
        self.deliver_all()?;
        self.take_reply(node, client, req_no)?.ok_or_else(|| {
            CheckpointdError::msg(format!("no reply to request {}", req_no))
        })
    }

    /// Opens a checkpoint and unwraps the handle.
    pub fn open(
        &mut self,
        node: &str,
        client: ClientHandle,
        name: &str,
        flags: OpenFlags,
        attrs: Option<CkptAttributes>,
    ) -> Result<CkptHandle, CheckpointdError> {
        let call = ClientCall::Open {
            name: name.into(),
            flags,
            attrs,
        };
        match self.call(node, client, call)? {
            Ok(ReplyData::CkptHandle(ckpt)) => Ok(ckpt),
            other => Err(CheckpointdError::msg(format!(
                "open of '{}' on {} gave {:?}",
                name, node, other
            ))),
        }
    }

    fn conn_of(
        &self,
        node: &str,
        client: ClientHandle,
    ) -> Result<ConnId, CheckpointdError> {
        self.conns
            .get(&(node.to_string(), client))
            .copied()
            .ok_or_else(|| {
                CheckpointdError::msg(format!(
                    "client {} not attached to {}",
                    client, node
                ))
            })
    }

    fn take_reply_on(
        &mut self,
        node: &str,
        conn: ConnId,
        req_no: RequestNo,
    ) -> Result<Option<CkptResult<ReplyData>>, CheckpointdError> {
        let sink = self.replies.get(node).ok_or_else(|| {
            CheckpointdError::msg(format!("no node {}", node))
        })?;
        let mut replies = lock(sink)?;
        let pos = replies.iter().position(|(c, reply)| {
            *c == conn
                && matches!(reply, ApiReply::Reply { req_no: r, .. } if *r == req_no)
        });
        Ok(pos.and_then(|i| match replies.remove(i).1 {
            ApiReply::Reply { result, .. } => Some(result),
            ApiReply::Leave => None,
        }))
    }
}

/// Creation attributes with room for `max_sections` sections of
/// `max_section_size` bytes each.
pub fn attrs(
    creation_flags: CreationFlags,
    max_sections: u32,
    max_section_size: u64,
    retention: i64,
) -> CkptAttributes {
    CkptAttributes {
        creation_flags,
        checkpoint_size: max_sections as u64 * max_section_size,
        retention,
        max_sections,
        max_section_size,
        max_section_id_size: 64,
    }
}

pub const RW: OpenFlags = OpenFlags {
    read: true,
    write: true,
    colocated: false,
};

pub const RW_COLOCATED: OpenFlags = OpenFlags {
    read: true,
    write: true,
    colocated: true,
};
