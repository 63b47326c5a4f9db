//! Cluster: a topic lives on exactly one node; every other node reaches it
//! through a proxy topic and a per-(topic, node) multiplexing session.
//!
//! Transport is length-prefixed JSON frames over TCP. Each node dials every
//! peer and keeps the connection alive with a reconnect loop; requests flow
//! over the dialed connection, replies come back on it. Every cross-node
//! message carries the sender's ring signature so a stale peer is rejected
//! with "out of sync" instead of misrouting.

pub mod ring;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use palaver_common::Uid;

use crate::config::{ClusterConfig, ClusterNodeConfig};
use crate::hub::{MetaAction, MetaReq, SessionJoin, SessionLeave};
use crate::push::Receipt;
use crate::session::{Outbound, SessionCtl, SessionProto, SessionRef, SEND_QUEUE_DEPTH};
use crate::wire::{self, ClientMessage, ServerMessage};
use crate::Globals;
use ring::{Ring, HASH_REPLICAS};

/// Initial reconnect delay; doubles up to the cap.
const RECONNECT_BASE: Duration = Duration::from_millis(200);
const RECONNECT_MAX: Duration = Duration::from_secs(3);
/// How long a call waits for the peer's reply.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// A frame larger than this is a protocol violation.
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Kind of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProxyReqType {
    #[default]
    None,
    Join,
    Leave,
    Meta,
    Broadcast,
}

/// Basic info on the remote session a proxied message originated from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSess {
    pub remote_addr: String,
    pub user_agent: String,
    pub uid: Uid,
    pub auth_lvl: u16,
    pub lang: String,
    pub device_id: String,
    pub platform: String,
    pub sid: String,
    pub background: bool,
}

impl ClusterSess {
    fn from_ref(sess: &SessionRef) -> Self {
        Self {
            remote_addr: sess.remote_addr.clone(),
            user_agent: sess.user_agent.clone(),
            uid: sess.uid,
            auth_lvl: sess.auth_lvl.as_u16(),
            lang: sess.lang.clone(),
            device_id: sess.device_id.clone(),
            platform: sess.platform.clone(),
            sid: sess.sid.clone(),
            background: sess.background,
        }
    }
}

/// Proxy-to-master request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterReq {
    pub node: String,
    pub signature: String,
    pub fingerprint: i64,
    pub req_type: ProxyReqType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_msg: Option<ClientMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srv_msg: Option<ServerMessage>,
    pub rcpt_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sess: Option<ClusterSess>,
    /// Routing metadata that does not survive `ServerMessage` serialization.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_sid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub as_user: String,
    /// True when the proxy topic is gone and its multiplexing session
    /// should be torn down.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub gone: bool,
}

/// Master-to-proxy response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterResp {
    pub srv_msg: ServerMessage,
    /// Originating session to forward to, or `"*"` for fan-out.
    pub orig_sid: String,
    pub rcpt_to: String,
    pub orig_req_type: ProxyReqType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_sid: String,
}

/// Intra-cluster routing request (messages sent without attaching first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRoute {
    pub node: String,
    pub signature: String,
    pub fingerprint: i64,
    pub srv_msg: ServerMessage,
    pub rcpt_to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_sid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub as_user: String,
}

/// Update routed to the node that owns a user's `me` topic: push receipts
/// and user deletion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserCacheReq {
    pub node: String,
    pub user_id: Uid,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub gone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_rcpt: Option<Receipt>,
}

/// One RPC frame on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct RpcFrame {
    id: u64,
    body: RpcBody,
}

#[derive(Debug, Serialize, Deserialize)]
enum RpcBody {
    TopicMaster(ClusterReq),
    TopicProxy(ClusterResp),
    Route(ClusterRoute),
    UserCacheUpdate(UserCacheReq),
    Reply { rejected: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The peer is not connected; the reconnect loop is on it.
    Unreachable(String),
    /// The peer rejected the call: ring signatures disagree.
    OutOfSync,
    Internal(String),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Unreachable(node) => write!(f, "cluster: node '{node}' unreachable"),
            ClusterError::OutOfSync => f.write_str("cluster: node out of sync"),
            ClusterError::Internal(msg) => write!(f, "cluster: {msg}"),
        }
    }
}

impl std::error::Error for ClusterError {}

/// A peer node as seen from this one.
pub struct ClusterNode {
    pub name: String,
    pub addr: String,
    connected: AtomicBool,
    /// Writer channel of the live connection, if any.
    tx: Mutex<Option<mpsc::Sender<RpcFrame>>>,
    pending: DashMap<u64, oneshot::Sender<bool>>,
    next_id: AtomicU64,
    /// Ids of multiplexing sessions originated from this peer.
    pub msess: Mutex<HashSet<String>>,
    down_since: Mutex<Option<Instant>>,
}

impl ClusterNode {
    fn new(cfg: &ClusterNodeConfig) -> Arc<Self> {
        Arc::new(Self {
            name: cfg.name.clone(),
            addr: cfg.addr.clone(),
            connected: AtomicBool::new(false),
            tx: Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            msess: Mutex::new(HashSet::new()),
            down_since: Mutex::new(Some(Instant::now())),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Issue one call and wait for the peer's accept/reject verdict.
    async fn call(&self, body: RpcBody) -> Result<bool, ClusterError> {
        let tx = {
            let guard = self.tx.lock();
            match (&*guard, self.is_connected()) {
                (Some(tx), true) => tx.clone(),
                _ => return Err(ClusterError::Unreachable(self.name.clone())),
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        if tx.send(RpcFrame { id, body }).await.is_err() {
            self.pending.remove(&id);
            return Err(ClusterError::Unreachable(self.name.clone()));
        }

        match tokio::time::timeout(CALL_TIMEOUT, reply_rx).await {
            Ok(Ok(rejected)) => Ok(rejected),
            Ok(Err(_)) => Err(ClusterError::Unreachable(self.name.clone())),
            Err(_) => {
                self.pending.remove(&id);
                Err(ClusterError::Internal(format!(
                    "call to '{}' timed out",
                    self.name
                )))
            }
        }
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            *self.down_since.lock() = Some(Instant::now());
            *self.tx.lock() = None;
            // Outstanding calls will never be answered.
            self.pending.clear();
            tracing::warn!(node = %self.name, "cluster node disconnected");
        }
    }
}

/// The cluster runtime of this node.
pub struct Cluster {
    nodes: HashMap<String, Arc<ClusterNode>>,
    this_node: String,
    /// Startup nonce distinguishing a restart from a rehash.
    fingerprint: i64,
    listen_on: String,
    ring: RwLock<Arc<Ring>>,
    failover_enabled: bool,
    /// How long a peer stays dark before its sessions are garbage-collected.
    node_down_after: Duration,
}

impl Cluster {
    /// Build the cluster from config. Returns `None` for a standalone
    /// server (no cluster section or no self name).
    pub fn from_config(cfg: &ClusterConfig, self_override: &str) -> Option<Arc<Cluster>> {
        let this_name = if self_override.is_empty() {
            cfg.this_name.clone()
        } else {
            self_override.to_string()
        };
        if this_name.is_empty() {
            tracing::info!("cluster: running as a standalone server");
            return None;
        }

        let mut nodes = HashMap::new();
        let mut listen_on = String::new();
        let mut ring_keys = Vec::new();
        for node in &cfg.nodes {
            ring_keys.push(node.name.clone());
            if node.name == this_name {
                listen_on = node.addr.clone();
                continue;
            }
            nodes.insert(node.name.clone(), ClusterNode::new(node));
        }

        if nodes.is_empty() {
            tracing::error!("cluster: invalid cluster size: 1");
            return None;
        }
        if listen_on.is_empty() {
            tracing::error!(node = %this_name, "cluster: self node missing from the node list");
            return None;
        }

        let (failover_enabled, node_down_after) = match &cfg.failover {
            Some(fo) if fo.enabled => (true, Duration::from_millis(fo.node_down_after_ms)),
            _ => (false, Duration::from_secs(10)),
        };

        Some(Arc::new(Cluster {
            nodes,
            this_node: this_name,
            fingerprint: chrono::Utc::now().timestamp(),
            listen_on,
            ring: RwLock::new(Arc::new(Ring::new(HASH_REPLICAS, &ring_keys))),
            failover_enabled,
            node_down_after,
        }))
    }

    pub fn this_node(&self) -> String {
        self.this_node.clone()
    }

    /// Names of the peer nodes (excluding this one).
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn fingerprint(&self) -> i64 {
        self.fingerprint
    }

    pub fn signature(&self) -> String {
        self.ring.read().signature().to_string()
    }

    /// Node owning a topic name under the current ring.
    pub fn node_for(&self, topic: &str) -> String {
        self.ring.read().get(topic).to_string()
    }

    /// True when the topic is owned by some other node.
    pub fn is_remote_topic(&self, topic: &str) -> bool {
        let owner = self.node_for(topic);
        !owner.is_empty() && owner != self.this_node
    }

    /// Replace the ring. Pass `None` to rebuild over all configured nodes.
    /// The caller follows up with a hub rehash signal.
    pub fn rehash(&self, nodes: Option<Vec<String>>) -> Vec<String> {
        let keys = match nodes {
            Some(keys) => keys,
            None => {
                let mut keys: Vec<String> = self.nodes.keys().cloned().collect();
                keys.push(self.this_node.clone());
                keys
            }
        };
        *self.ring.write() = Arc::new(Ring::new(HASH_REPLICAS, &keys));
        tracing::info!(nodes = ?keys, "cluster rehashed");
        keys
    }

    fn node(&self, name: &str) -> Option<Arc<ClusterNode>> {
        self.nodes.get(name).cloned()
    }

    /// Spawn the listener, the per-peer dialers and the failover monitor.
    pub fn start(self: &Arc<Self>, globals: Arc<Globals>) {
        let listen_on = self.listen_on.clone();
        let accept_globals = globals.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&listen_on).await {
                Ok(l) => l,
                Err(err) => {
                    tracing::error!(%listen_on, ?err, "cluster listener bind failed");
                    return;
                }
            };
            tracing::info!(%listen_on, "cluster listening");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "cluster peer connected");
                        let globals = accept_globals.clone();
                        tokio::spawn(serve_peer(globals, stream));
                    }
                    Err(err) => {
                        tracing::warn!(?err, "cluster accept failed");
                    }
                }
            }
        });

        for node in self.nodes.values() {
            tokio::spawn(dial_peer(node.clone()));
        }

        if self.failover_enabled {
            tokio::spawn(monitor_peers(self.clone(), globals.clone()));
        }

        tracing::info!(
            nodes = self.nodes.len() + 1,
            node = %self.this_node,
            "cluster initialized"
        );
    }

    // -----------------------------------------------------------------
    // Proxy-side calls
    // -----------------------------------------------------------------

    fn make_req(
        &self,
        req_type: ProxyReqType,
        topic: &str,
        sess: Option<&SessionRef>,
    ) -> ClusterReq {
        ClusterReq {
            node: self.this_node.clone(),
            signature: self.signature(),
            fingerprint: self.fingerprint,
            req_type,
            rcpt_to: topic.to_string(),
            sess: sess.map(ClusterSess::from_ref),
            ..Default::default()
        }
    }

    async fn proxy_to_master(&self, req: ClusterReq) -> Result<(), ClusterError> {
        let owner = self.node_for(&req.rcpt_to);
        let Some(node) = self.node(&owner) else {
            return Err(ClusterError::Unreachable(owner));
        };
        match node.call(RpcBody::TopicMaster(req)).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(ClusterError::OutOfSync),
            Err(err) => {
                node.mark_disconnected();
                Err(err)
            }
        }
    }

    pub async fn forward_join(&self, topic: &str, sreg: &SessionJoin) -> Result<(), ClusterError> {
        let mut req = self.make_req(ProxyReqType::Join, topic, Some(&sreg.sess));
        req.cli_msg = Some(ClientMessage {
            sub: Some(sreg.pkt.clone()),
            ..Default::default()
        });
        self.proxy_to_master(req).await
    }

    pub async fn forward_leave(
        &self,
        topic: &str,
        leave: &SessionLeave,
    ) -> Result<(), ClusterError> {
        let mut req = self.make_req(ProxyReqType::Leave, topic, Some(&leave.sess));
        req.cli_msg = Some(ClientMessage {
            leave: Some(wire::ClientLeave {
                id: leave.id.clone(),
                topic: leave.topic.clone(),
                unsub: leave.unsub,
            }),
            ..Default::default()
        });
        self.proxy_to_master(req).await
    }

    pub async fn forward_meta(&self, topic: &str, meta: &MetaReq) -> Result<(), ClusterError> {
        let mut req = self.make_req(ProxyReqType::Meta, topic, Some(&meta.sess));
        req.cli_msg = Some(meta.pkt.clone());
        self.proxy_to_master(req).await
    }

    pub async fn forward_broadcast(
        &self,
        topic: &str,
        msg: ServerMessage,
    ) -> Result<(), ClusterError> {
        let mut req = self.make_req(ProxyReqType::Broadcast, topic, msg.sess.as_ref());
        req.skip_sid = msg.skip_sid.clone();
        req.as_user = msg.as_user.clone();
        let mut stripped = msg;
        stripped.sess = None;
        req.srv_msg = Some(stripped);
        self.proxy_to_master(req).await
    }

    /// Tell the master this node's proxy topic is gone.
    pub async fn proxy_gone(&self, topic: &str) -> Result<(), ClusterError> {
        let mut req = self.make_req(ProxyReqType::Leave, topic, None);
        req.gone = true;
        self.proxy_to_master(req).await
    }

    /// Route a server message to the node owning its recipient topic.
    pub async fn route(&self, msg: ServerMessage) -> Result<(), ClusterError> {
        let owner = self.node_for(&msg.rcpt_to);
        let Some(node) = self.node(&owner) else {
            return Err(ClusterError::Unreachable(owner));
        };
        let route = ClusterRoute {
            node: self.this_node.clone(),
            signature: self.signature(),
            fingerprint: self.fingerprint,
            rcpt_to: msg.rcpt_to.clone(),
            skip_sid: msg.skip_sid.clone(),
            as_user: msg.as_user.clone(),
            srv_msg: {
                let mut stripped = msg;
                stripped.sess = None;
                stripped
            },
        };
        match node.call(RpcBody::Route(route)).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(ClusterError::OutOfSync),
            Err(err) => {
                node.mark_disconnected();
                Err(err)
            }
        }
    }

    /// Send a user-cache update to the node owning the user's `me` topic.
    pub async fn user_cache_update(&self, req: UserCacheReq) -> Result<(), ClusterError> {
        let owner = self.node_for(&req.user_id.user_id());
        let Some(node) = self.node(&owner) else {
            return Err(ClusterError::Unreachable(owner));
        };
        let mut req = req;
        req.node = self.this_node.clone();
        match node.call(RpcBody::UserCacheUpdate(req)).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(ClusterError::OutOfSync),
            Err(err) => {
                node.mark_disconnected();
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire plumbing
// ---------------------------------------------------------------------------

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &RpcFrame) -> std::io::Result<()> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<RpcFrame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid frame size {len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Dial a peer and keep the connection alive. Requests queued on the node
/// are written out; replies resolve their pending calls.
async fn dial_peer(node: Arc<ClusterNode>) {
    let mut delay = RECONNECT_BASE;
    loop {
        let stream = match TcpStream::connect(&node.addr).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(node = %node.name, ?err, "cluster connect failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<RpcFrame>(SEND_QUEUE_DEPTH);
        *node.tx.lock() = Some(tx);
        node.connected.store(true, Ordering::SeqCst);
        *node.down_since.lock() = None;
        delay = RECONNECT_BASE;
        tracing::info!(node = %node.name, "cluster connected");

        let writer_node = node.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    tracing::debug!(node = %writer_node.name, ?err, "cluster write failed");
                    break;
                }
            }
        });

        // Read replies until the connection dies.
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if let RpcBody::Reply { rejected } = frame.body {
                        if let Some((_, reply)) = node.pending.remove(&frame.id) {
                            let _ = reply.send(rejected);
                        }
                    } else {
                        tracing::warn!(node = %node.name, "unexpected request on reply stream");
                    }
                }
                Err(err) => {
                    tracing::debug!(node = %node.name, ?err, "cluster read failed");
                    break;
                }
            }
        }

        node.mark_disconnected();
        write_task.abort();
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX);
    }
}

/// Serve one inbound peer connection: read requests, dispatch, reply.
async fn serve_peer(globals: Arc<Globals>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => return,
        };

        let rejected = dispatch_request(&globals, frame.body).await;
        let reply = RpcFrame {
            id: frame.id,
            body: RpcBody::Reply { rejected },
        };
        if write_frame(&mut writer, &reply).await.is_err() {
            return;
        }
    }
}

/// Handle one inbound request; returns the `rejected` verdict.
async fn dispatch_request(globals: &Arc<Globals>, body: RpcBody) -> bool {
    let Some(cluster) = &globals.cluster else {
        return true;
    };

    match body {
        RpcBody::TopicMaster(req) => topic_master(globals, cluster, req).await,
        RpcBody::TopicProxy(resp) => {
            if let Some(handle) = globals.hub.topic_get(&resp.rcpt_to) {
                if let Some(proxy) = &handle.proxy {
                    let _ = proxy.send(resp).await;
                } else {
                    tracing::warn!(topic = %handle.name, "master response for a non-proxy topic");
                }
            } else {
                tracing::debug!(topic = %resp.rcpt_to, "master response for unknown topic");
            }
            false
        }
        RpcBody::Route(route) => {
            if route.signature != cluster.signature() {
                tracing::warn!(node = %route.node, "route signature mismatch");
                return true;
            }
            let mut msg = route.srv_msg;
            msg.rcpt_to = route.rcpt_to;
            msg.skip_sid = route.skip_sid;
            msg.as_user = route.as_user;
            let _ = globals.hub.route.send(Box::new(msg)).await;
            false
        }
        RpcBody::UserCacheUpdate(req) => {
            if req.gone {
                globals.sessions.evict_user(req.user_id, "").await;
            }
            if let Some(rcpt) = req.push_rcpt {
                globals.push.push(rcpt);
            }
            false
        }
        RpcBody::Reply { .. } => {
            tracing::warn!("stray reply on request stream");
            false
        }
    }
}

/// Master endpoint: a proxy node forwarded a client request for a topic
/// this node owns.
async fn topic_master(globals: &Arc<Globals>, cluster: &Arc<Cluster>, req: ClusterReq) -> bool {
    let Some(node) = cluster.node(&req.node) else {
        tracing::warn!(node = %req.node, "request from an unknown node");
        return false;
    };

    // One multiplexing session per (topic, origin node).
    let msid = format!("{}-{}", req.rcpt_to, req.node);

    if req.gone {
        // The proxy topic is gone; tear down its multiplexing session.
        if let Some(msess) = globals.sessions.get(&msid) {
            let _ = msess.ctl.send(SessionCtl::Stop).await;
        }
        node.msess.lock().remove(&msid);
        return false;
    }

    if req.signature != cluster.signature() {
        tracing::warn!(topic = %req.rcpt_to, node = %req.node, "master signature mismatch");
        return true;
    }

    let msess = match globals.sessions.get(&msid) {
        Some(msess) => msess,
        None => {
            let msess = spawn_multiplex_session(globals.clone(), node.clone(), &msid);
            node.msess.lock().insert(msid.clone());
            tracing::info!(msid = %msid, "multiplexing session started");
            msess
        }
    };

    // A thin local stand-in for the remote session.
    let sess = req.sess.as_ref().map(|cs| SessionRef {
        sid: cs.sid.clone(),
        uid: cs.uid,
        auth_lvl: crate::auth::AuthLevel::from_u16(cs.auth_lvl)
            .unwrap_or(crate::auth::AuthLevel::None),
        user_agent: cs.user_agent.clone(),
        remote_addr: cs.remote_addr.clone(),
        lang: cs.lang.clone(),
        device_id: cs.device_id.clone(),
        platform: cs.platform.clone(),
        background: cs.background,
        proto: SessionProto::Cluster,
        send: msess.send.clone(),
        ctl: msess.ctl.clone(),
        proxy_req: req.req_type,
        multi_sid: Some(msid.clone()),
    });

    match req.req_type {
        ProxyReqType::Join => {
            let (Some(sess), Some(cli)) = (sess, req.cli_msg) else {
                return true;
            };
            let Some(sub) = cli.sub else { return true };
            let _ = globals
                .hub
                .join
                .send(SessionJoin {
                    topic: req.rcpt_to,
                    pkt: sub,
                    sess,
                    created: false,
                    loaded: false,
                })
                .await;
        }
        ProxyReqType::Leave => {
            let (Some(sess), Some(cli)) = (sess, req.cli_msg) else {
                return true;
            };
            let Some(leave) = cli.leave else { return true };
            if let Some(handle) = globals.hub.topic_get(&req.rcpt_to) {
                let _ = handle
                    .leave
                    .send(SessionLeave {
                        sess,
                        unsub: leave.unsub,
                        topic: leave.topic,
                        id: leave.id,
                    })
                    .await;
            } else {
                tracing::debug!(topic = %req.rcpt_to, "leave for unknown topic");
            }
        }
        ProxyReqType::Meta => {
            let (Some(sess), Some(cli)) = (sess, req.cli_msg) else {
                return true;
            };
            let Some(action) = meta_action_of(&cli) else {
                return true;
            };
            if let Some(handle) = globals.hub.topic_get(&req.rcpt_to) {
                let _ = handle
                    .meta
                    .send(MetaReq {
                        topic: req.rcpt_to,
                        action,
                        pkt: cli,
                        sess,
                    })
                    .await;
            } else {
                tracing::debug!(topic = %req.rcpt_to, "meta for unknown topic");
            }
        }
        ProxyReqType::Broadcast => {
            let Some(mut msg) = req.srv_msg else { return true };
            msg.rcpt_to = req.rcpt_to;
            msg.skip_sid = req.skip_sid;
            msg.as_user = req.as_user;
            msg.sess = sess;
            // Preserve the client-assigned ack id when present.
            if let Some(cli) = &req.cli_msg {
                if let Some(publish) = &cli.publish {
                    msg.id = publish.id.clone();
                }
            }
            let _ = globals.hub.route.send(Box::new(msg)).await;
        }
        ProxyReqType::None => {
            tracing::warn!(topic = %req.rcpt_to, "unknown proxy request type");
            return true;
        }
    }

    false
}

/// Derive the meta action the same way the session layer does.
fn meta_action_of(cli: &ClientMessage) -> Option<MetaAction> {
    if let Some(get) = &cli.get {
        let what = wire::parse_meta_what(&get.query.what);
        if what == 0 {
            return None;
        }
        return Some(MetaAction::Get(what));
    }
    if let Some(set) = &cli.set {
        let mut what = 0u8;
        if set.query.desc.is_some() {
            what |= wire::META_DESC;
        }
        if set.query.sub.is_some() {
            what |= wire::META_SUB;
        }
        if set.query.tags.is_some() {
            what |= wire::META_TAGS;
        }
        if what == 0 {
            return None;
        }
        return Some(MetaAction::Set(what));
    }
    if let Some(del) = &cli.del {
        return wire::parse_del_what(&del.what).map(MetaAction::Del);
    }
    None
}

/// Create the master-side stand-in for all sessions of a remote node
/// attached to one topic, and start its write loop.
fn spawn_multiplex_session(
    globals: Arc<Globals>,
    node: Arc<ClusterNode>,
    msid: &str,
) -> SessionRef {
    let (send_tx, send_rx) = mpsc::channel::<Outbound>(SEND_QUEUE_DEPTH);
    let (ctl_tx, ctl_rx) = mpsc::channel::<SessionCtl>(SEND_QUEUE_DEPTH);

    let sess_ref = SessionRef {
        sid: msid.to_string(),
        uid: Uid(0),
        auth_lvl: crate::auth::AuthLevel::None,
        user_agent: String::new(),
        remote_addr: node.addr.clone(),
        lang: String::new(),
        device_id: String::new(),
        platform: String::new(),
        background: false,
        proto: SessionProto::Cluster,
        send: send_tx,
        ctl: ctl_tx,
        proxy_req: ProxyReqType::None,
        multi_sid: None,
    };
    globals.sessions.insert(sess_ref.clone());

    let msid = msid.to_string();
    tokio::spawn(multiplex_write_loop(globals, node, msid, send_rx, ctl_rx));

    sess_ref
}

/// Write loop of a multiplexing session: one message at a time, deciding
/// whether it answers a single proxied session or fans out to all of them.
async fn multiplex_write_loop(
    globals: Arc<Globals>,
    node: Arc<ClusterNode>,
    msid: String,
    mut send_rx: mpsc::Receiver<Outbound>,
    mut ctl_rx: mpsc::Receiver<SessionCtl>,
) {
    // Topics this multiplexing session is attached to, for cleanup.
    let mut subs: HashMap<String, crate::hub::TopicHandle> = HashMap::new();

    loop {
        tokio::select! {
            Some(out) = send_rx.recv() => {
                let msg = match out {
                    Outbound::Message(msg) => msg,
                    Outbound::Serialized(_) => {
                        tracing::warn!(msid = %msid, "serialized payload on a multiplexing session");
                        continue;
                    }
                };

                let mut resp = ClusterResp {
                    rcpt_to: msg.rcpt_to.clone(),
                    skip_sid: msg.skip_sid.clone(),
                    orig_sid: "*".to_string(),
                    ..Default::default()
                };

                if let Some(sess) = &msg.sess {
                    resp.orig_req_type = sess.proxy_req;
                    if msg.data.is_some() || msg.pres.is_some() || msg.info.is_some() {
                        // Broadcast payloads fan out on the proxy side.
                        resp.orig_sid = "*".to_string();
                    } else {
                        resp.orig_sid = sess.sid.clone();
                    }
                }

                let mut stripped = *msg;
                stripped.sess = None;
                resp.srv_msg = stripped;

                if let Err(err) = node.call(RpcBody::TopicProxy(resp)).await {
                    tracing::warn!(msid = %msid, ?err, "master-to-proxy write failed");
                    node.mark_disconnected();
                    break;
                }
            }

            Some(ctl) = ctl_rx.recv() => {
                match ctl {
                    SessionCtl::Attached { topic, handle } => {
                        subs.insert(topic, handle);
                    }
                    SessionCtl::Detach { topic } => {
                        subs.remove(&topic);
                    }
                    SessionCtl::Stop => break,
                }
            }

            else => break,
        }
    }

    // Orphaned: leave every topic this session represented.
    let sess = globals.sessions.get(&msid);
    for (_, handle) in subs.drain() {
        if let Some(sess) = &sess {
            let _ = handle
                .leave
                .send(SessionLeave {
                    sess: sess.clone(),
                    unsub: false,
                    topic: String::new(),
                    id: String::new(),
                })
                .await;
        }
    }
    globals.sessions.delete(&msid);
    node.msess.lock().remove(&msid);
    tracing::info!(msid = %msid, "multiplexing session closed");
}

/// Watch for peers that stay dark and garbage-collect the multiplexing
/// sessions they originated.
async fn monitor_peers(cluster: Arc<Cluster>, globals: Arc<Globals>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        for node in cluster.nodes.values() {
            if node.is_connected() {
                continue;
            }
            let expired = {
                let guard = node.down_since.lock();
                guard.map_or(false, |since| since.elapsed() > cluster.node_down_after)
            };
            if !expired {
                continue;
            }

            let orphans: Vec<String> = node.msess.lock().drain().collect();
            if orphans.is_empty() {
                continue;
            }
            tracing::warn!(node = %node.name, count = orphans.len(),
                "peer declared dead, collecting its sessions");
            for msid in orphans {
                if let Some(sess) = globals.sessions.get(&msid) {
                    let _ = sess.ctl.send(SessionCtl::Stop).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_sess_snapshots_session_fields() {
        let (send, _send_rx) = mpsc::channel(1);
        let (ctl, _ctl_rx) = mpsc::channel(1);
        let sess = SessionRef {
            sid: "ses_1".into(),
            uid: Uid(77),
            auth_lvl: crate::auth::AuthLevel::Auth,
            user_agent: "test-ua".into(),
            remote_addr: "10.0.0.1:555".into(),
            lang: "en".into(),
            device_id: "dev".into(),
            platform: "web".into(),
            background: true,
            proto: SessionProto::Websocket,
            send,
            ctl,
            proxy_req: ProxyReqType::None,
            multi_sid: None,
        };
        let cs = ClusterSess::from_ref(&sess);
        assert_eq!(cs.sid, "ses_1");
        assert_eq!(cs.uid, Uid(77));
        assert_eq!(cs.auth_lvl, 20);
        assert!(cs.background);
    }

    #[test]
    fn rpc_frame_round_trips() {
        let frame = RpcFrame {
            id: 42,
            body: RpcBody::Reply { rejected: true },
        };
        let bytes = serde_json::to_vec(&frame).unwrap();
        let back: RpcFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, 42);
        assert!(matches!(back.body, RpcBody::Reply { rejected: true }));
    }

    #[test]
    fn standalone_config_yields_no_cluster() {
        let cfg = ClusterConfig::default();
        assert!(Cluster::from_config(&cfg, "").is_none());
    }

    #[test]
    fn single_node_cluster_is_rejected() {
        let cfg = ClusterConfig {
            this_name: "one".into(),
            nodes: vec![ClusterNodeConfig {
                name: "one".into(),
                addr: "127.0.0.1:12001".into(),
            }],
            failover: None,
        };
        assert!(Cluster::from_config(&cfg, "").is_none());
    }

    #[test]
    fn remote_topic_detection() {
        let cfg = ClusterConfig {
            this_name: "one".into(),
            nodes: vec![
                ClusterNodeConfig {
                    name: "one".into(),
                    addr: "127.0.0.1:12001".into(),
                },
                ClusterNodeConfig {
                    name: "two".into(),
                    addr: "127.0.0.1:12002".into(),
                },
                ClusterNodeConfig {
                    name: "three".into(),
                    addr: "127.0.0.1:12003".into(),
                },
            ],
            failover: None,
        };
        let cluster = Cluster::from_config(&cfg, "").unwrap();

        // Every topic has exactly one owner; local ones are not remote.
        let mut saw_local = false;
        let mut saw_remote = false;
        for i in 0..200 {
            let name = format!("grpTopic{i}");
            let owner = cluster.node_for(&name);
            assert!(!owner.is_empty());
            if cluster.is_remote_topic(&name) {
                saw_remote = true;
                assert_ne!(owner, "one");
            } else {
                saw_local = true;
                assert_eq!(owner, "one");
            }
        }
        assert!(saw_local && saw_remote);
    }

    #[test]
    fn rehash_changes_signature_when_membership_changes() {
        let cfg = ClusterConfig {
            this_name: "one".into(),
            nodes: vec![
                ClusterNodeConfig {
                    name: "one".into(),
                    addr: "127.0.0.1:12001".into(),
                },
                ClusterNodeConfig {
                    name: "two".into(),
                    addr: "127.0.0.1:12002".into(),
                },
            ],
            failover: None,
        };
        let cluster = Cluster::from_config(&cfg, "").unwrap();
        let sig_before = cluster.signature();

        cluster.rehash(Some(vec!["one".into(), "two".into(), "four".into()]));
        assert_ne!(cluster.signature(), sig_before);

        // Rebuilding over the full configured set restores the original.
        cluster.rehash(None);
        assert_eq!(cluster.signature(), sig_before);
    }
}
