//! The hub: registry of live topics, admission of subscription requests,
//! topic teardown, rehash broadcasts, and meta queries for topics that are
//! not loaded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use palaver_common::uid::{parse_p2p, parse_user_id, topic_cat, TopicCat};
use palaver_common::{AccessMode, Uid, ZERO_UID};

use crate::cluster::ClusterResp;
use crate::presence::{self, PresParams};
use crate::session::{select_access_mode, SessionRef};
use crate::store::types::{time_now, Message, ObjTimes, QueryOpt, Subscription, Topic as StoredTopic};
use crate::topic::{parse_default_access, PerUserData, Topic};
use crate::wire::{self, ClientDel, ClientMessage, ClientSub, DelWhat, ServerMessage, TopicDesc};
use crate::Globals;

/// Mailbox depths.
const ROUTE_QUEUE: usize = 4096;
const META_QUEUE: usize = 128;

/// Request to subscribe a session to a topic.
#[derive(Debug)]
pub struct SessionJoin {
    /// Routable (expanded) name of the topic.
    pub topic: String,
    pub pkt: ClientSub,
    pub sess: SessionRef,
    /// Set by topic initialization when the topic was just created.
    pub created: bool,
    /// Set by topic initialization when the topic was just loaded.
    pub loaded: bool,
}

/// Request to detach a session from a topic, optionally deleting the
/// subscription.
#[derive(Debug)]
pub struct SessionLeave {
    pub sess: SessionRef,
    pub unsub: bool,
    /// Original (user-visible) topic name of the request.
    pub topic: String,
    pub id: String,
}

/// What a `{get}`/`{set}`/`{del}` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaAction {
    Get(u8),
    Set(u8),
    Del(DelWhat),
}

/// A metadata request on its way to a topic.
#[derive(Debug)]
pub struct MetaReq {
    pub topic: String,
    pub action: MetaAction,
    pub pkt: ClientMessage,
    pub sess: SessionRef,
}

/// Request to unregister a topic.
#[derive(Debug)]
pub struct TopicUnreg {
    pub topic: String,
    pub sess: Option<SessionRef>,
    pub pkt: Option<ClientDel>,
    /// Unregister and delete, vs. plain unregister (GC).
    pub del: bool,
}

/// Why a topic is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep-alive expiry or registry removal.
    None,
    Deleted,
    Rehashing,
    Shutdown,
}

/// Shutdown signal delivered on a topic's exit channel.
#[derive(Debug)]
pub struct ShutDown {
    pub reason: StopReason,
    pub done: Option<oneshot::Sender<()>>,
}

/// Mailbox handles of a live topic, stored in the hub registry. Sessions
/// read the registry to learn whether a topic is local; only the hub task
/// mutates it.
#[derive(Debug, Clone)]
pub struct TopicHandle {
    pub name: String,
    pub reg: mpsc::Sender<SessionJoin>,
    pub leave: mpsc::Sender<SessionLeave>,
    pub broadcast: mpsc::Sender<Box<ServerMessage>>,
    pub meta: mpsc::Sender<MetaReq>,
    pub ua: mpsc::Sender<String>,
    pub exit: mpsc::Sender<ShutDown>,
    pub is_proxy: bool,
    pub master_node: String,
    /// Proxy topics only: where master responses are delivered.
    pub proxy: Option<mpsc::Sender<ClusterResp>>,
}

/// The hub handle held by every other component.
#[derive(Clone)]
pub struct Hub {
    pub topics: Arc<DashMap<String, TopicHandle>>,
    pub join: mpsc::Sender<SessionJoin>,
    pub route: mpsc::Sender<Box<ServerMessage>>,
    pub unreg: mpsc::Sender<TopicUnreg>,
    pub meta: mpsc::Sender<MetaReq>,
    pub rehash: mpsc::Sender<()>,
    pub shutdown: mpsc::Sender<oneshot::Sender<usize>>,
    shutting_down: Arc<AtomicBool>,
}

pub struct HubReceivers {
    pub(crate) join: mpsc::Receiver<SessionJoin>,
    pub(crate) route: mpsc::Receiver<Box<ServerMessage>>,
    pub(crate) unreg: mpsc::Receiver<TopicUnreg>,
    pub(crate) meta: mpsc::Receiver<MetaReq>,
    pub(crate) rehash: mpsc::Receiver<()>,
    pub(crate) shutdown: mpsc::Receiver<oneshot::Sender<usize>>,
}

impl Hub {
    pub fn new() -> (Hub, HubReceivers) {
        let (join_tx, join_rx) = mpsc::channel(1);
        let (route_tx, route_rx) = mpsc::channel(ROUTE_QUEUE);
        let (unreg_tx, unreg_rx) = mpsc::channel(1);
        let (meta_tx, meta_rx) = mpsc::channel(META_QUEUE);
        let (rehash_tx, rehash_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        (
            Hub {
                topics: Arc::new(DashMap::new()),
                join: join_tx,
                route: route_tx,
                unreg: unreg_tx,
                meta: meta_tx,
                rehash: rehash_tx,
                shutdown: shutdown_tx,
                shutting_down: Arc::new(AtomicBool::new(false)),
            },
            HubReceivers {
                join: join_rx,
                route: route_rx,
                unreg: unreg_rx,
                meta: meta_rx,
                rehash: rehash_rx,
                shutdown: shutdown_rx,
            },
        )
    }

    pub fn topic_get(&self, name: &str) -> Option<TopicHandle> {
        self.topics.get(name).map(|e| e.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// The hub task.
pub async fn run(globals: Arc<Globals>, mut rx: HubReceivers) {
    loop {
        tokio::select! {
            Some(join) = rx.join.recv() => {
                handle_join(&globals, join).await;
            }

            Some(msg) = rx.route.recv() => {
                handle_route(&globals, msg).await;
            }

            Some(meta) = rx.meta.recv() => {
                if let Some(handle) = globals.hub.topic_get(&meta.topic) {
                    let _ = handle.meta.send(meta).await;
                } else if matches!(meta.action, MetaAction::Get(_)) {
                    let globals = globals.clone();
                    tokio::spawn(async move {
                        reply_topic_desc_basic(&globals, meta).await;
                    });
                }
            }

            Some(unreg) = rx.unreg.recv() => {
                handle_unreg(&globals, unreg).await;
            }

            Some(()) = rx.rehash.recv() => {
                handle_rehash(&globals).await;
            }

            Some(done) = rx.shutdown.recv() => {
                globals.hub.shutting_down.store(true, Ordering::SeqCst);

                let handles: Vec<TopicHandle> = globals
                    .hub
                    .topics
                    .iter()
                    .map(|e| e.clone())
                    .collect();
                globals.hub.topics.clear();

                let mut waits = Vec::with_capacity(handles.len());
                for handle in &handles {
                    let (tx, rx_done) = oneshot::channel();
                    if handle
                        .exit
                        .try_send(ShutDown { reason: StopReason::Shutdown, done: Some(tx) })
                        .is_ok()
                    {
                        waits.push(rx_done);
                    }
                }
                let count = waits.len();
                for wait in waits {
                    let _ = wait.await;
                }

                tracing::info!(topics = count, "hub shutdown completed");
                let _ = done.send(count);
                return;
            }
        }
    }
}

async fn handle_join(globals: &Arc<Globals>, join: SessionJoin) {
    let mut join = join;
    if let Some(handle) = globals.hub.topic_get(&join.topic) {
        match handle.reg.send(join).await {
            Ok(()) => return,
            // The topic died between lookup and send; re-init below.
            Err(mpsc::error::SendError(j)) => join = j,
        }
    }

    if globals.hub.is_shutting_down() {
        return;
    }

    let globals = globals.clone();
    if globals.is_remote_topic(&join.topic) {
        tokio::spawn(async move {
            proxy_topic_init(globals, join).await;
        });
    } else {
        tokio::spawn(async move {
            topic_init(globals, join).await;
        });
    }
}

/// Route a message to a topic the sender is not attached to.
async fn handle_route(globals: &Arc<Globals>, msg: Box<ServerMessage>) {
    if let Some(handle) = globals.hub.topic_get(&msg.rcpt_to) {
        if let Err(err) = handle.broadcast.try_send(msg) {
            tracing::warn!(topic = %handle.name, ?err, "topic broadcast queue full, message dropped");
        }
        return;
    }

    if globals.is_remote_topic(&msg.rcpt_to) {
        let globals = globals.clone();
        tokio::spawn(async move {
            if let Err(err) = globals.route_to_remote(*msg).await {
                tracing::warn!(?err, "intra-cluster route failed");
            }
        });
        return;
    }

    if msg.data.is_some() {
        // Normally the topic persists its own messages; an offline 'me'
        // must still receive invites, so persist here.
        let globals = globals.clone();
        tokio::spawn(async move {
            persist_offline_data(&globals, *msg).await;
        });
    } else {
        tracing::debug!(topic = %msg.rcpt_to, kind = msg.describe(),
            "message for an offline topic dropped");
    }
}

async fn persist_offline_data(globals: &Globals, msg: ServerMessage) {
    let now = time_now();
    let Some(data) = msg.data.as_ref() else { return };
    let name = msg.rcpt_to.clone();

    let seq = match globals.store.topic_get(&name).await {
        Ok(Some(topic)) => topic.seq_id + 1,
        Ok(None) => {
            let stored = StoredTopic {
                name: name.clone(),
                times: ObjTimes::new(),
                access: Default::default(),
                seq_id: 0,
                clear_id: 0,
                public: None,
                tags: Vec::new(),
            };
            // Raced creation is fine: both writers proceed to the message.
            let sub = Subscription::new(
                parse_user_id(&name),
                &name,
                AccessMode::NONE,
                AccessMode::NONE,
            );
            let _ = globals.store.topic_create(&stored, &sub).await;
            1
        }
        Err(err) => {
            tracing::warn!(topic = %name, ?err, "offline store lookup failed");
            if let Some(sess) = &msg.sess {
                let _ = sess.queue_out(&wire::err_unknown(&msg.id, &name, now)).await;
            }
            return;
        }
    };

    let stored = Message {
        topic: name.clone(),
        seq_id: seq,
        created_at: data.ts,
        from: parse_user_id(&data.from),
        head: data.head.clone(),
        content: data.content.clone(),
    };
    if let Err(err) = globals.store.message_save(&stored).await {
        tracing::warn!(topic = %name, ?err, "offline message save failed");
        if let Some(sess) = &msg.sess {
            let _ = sess.queue_out(&wire::err_unknown(&msg.id, &name, now)).await;
        }
        return;
    }
    let _ = globals.store.topic_update_on_message(&name, &stored).await;

    if let Some(sess) = &msg.sess {
        let _ = sess
            .queue_out(&wire::no_err_accepted(&msg.id, &name, now))
            .await;
    }
}

async fn handle_unreg(globals: &Arc<Globals>, unreg: TopicUnreg) {
    if unreg.del {
        if let Some(handle) = globals.hub.topic_get(&unreg.topic) {
            // Online: the topic knows ownership, let it decide.
            if let (Some(sess), Some(pkt)) = (unreg.sess, unreg.pkt) {
                let req = MetaReq {
                    topic: unreg.topic,
                    action: MetaAction::Del(DelWhat::Topic),
                    pkt: ClientMessage {
                        del: Some(pkt),
                        ..Default::default()
                    },
                    sess,
                };
                let _ = handle.meta.send(req).await;
            }
        } else {
            let globals = globals.clone();
            tokio::spawn(async move {
                offline_topic_delete(&globals, unreg).await;
            });
        }
        return;
    }

    // Plain unregister: GC after idle, or a topic asking to be forgotten.
    if let Some((_, handle)) = globals.hub.topics.remove(&unreg.topic) {
        let _ = handle.exit.try_send(ShutDown {
            reason: StopReason::None,
            done: None,
        });
    }
    if let (Some(sess), Some(pkt)) = (unreg.sess, unreg.pkt) {
        let _ = sess
            .queue_out(&wire::no_err(&pkt.id, &pkt.topic, time_now()))
            .await;
    }
}

/// Delete a topic that is not currently loaded.
async fn offline_topic_delete(globals: &Globals, unreg: TopicUnreg) {
    let now = time_now();
    let Some(sess) = unreg.sess else { return };
    let pkt = unreg.pkt.unwrap_or_default();
    let name = unreg.topic;

    let subs = match globals.store.subs_for_topic(&name, QueryOpt::default()).await {
        Ok(subs) => subs,
        Err(err) => {
            tracing::warn!(topic = %name, ?err, "failed to load subscribers for delete");
            let _ = sess.queue_out(&wire::err_unknown(&pkt.id, &pkt.topic, now)).await;
            return;
        }
    };
    if subs.is_empty() {
        let _ = sess.queue_out(&wire::info_no_action(&pkt.id, &pkt.topic, now)).await;
        return;
    }

    let cat = topic_cat(&name).unwrap_or(TopicCat::Grp);
    let Some(own) = subs.iter().find(|s| s.user == sess.uid) else {
        let _ = sess.queue_out(&wire::info_no_action(&pkt.id, &pkt.topic, now)).await;
        return;
    };

    if own.effective().is_owner() {
        if let Err(err) = globals.store.topic_delete(&name).await {
            tracing::warn!(topic = %name, ?err, "offline topic delete failed");
            let _ = sess.queue_out(&wire::err_unknown(&pkt.id, &pkt.topic, now)).await;
            return;
        }
        presence::pres_subs_offline_offline(
            globals,
            &name,
            cat,
            &subs,
            "gone",
            &PresParams::default(),
            &sess.sid,
        )
        .await;
    } else {
        if cat == TopicCat::P2P && subs.len() < 2 {
            // Last subscription of a P2P topic takes the topic with it.
            if let Err(err) = globals.store.topic_delete(&name).await {
                tracing::warn!(topic = %name, ?err, "offline p2p delete failed");
                let _ = sess.queue_out(&wire::err_unknown(&pkt.id, &pkt.topic, now)).await;
                return;
            }
        } else if let Err(err) = globals.store.sub_delete(&name, sess.uid).await {
            tracing::warn!(topic = %name, ?err, "offline unsubscribe failed");
            let _ = sess.queue_out(&wire::err_unknown(&pkt.id, &pkt.topic, now)).await;
            return;
        }

        // The requester's other sessions drop the subscription.
        presence::pres_single_user_offline_offline(
            globals,
            sess.uid,
            &pkt.topic,
            "gone",
            &PresParams::default(),
            &sess.sid,
        )
        .await;
        if cat == TopicCat::P2P && subs.len() == 2 {
            // The other party stops exchanging status with this user.
            if let Some((u1, u2)) = parse_p2p(&name) {
                let other = if u1 == sess.uid { u2 } else { u1 };
                presence::pres_single_user_offline_offline(
                    globals,
                    other,
                    &sess.uid.user_id(),
                    "off+rem",
                    &PresParams::default(),
                    "",
                )
                .await;
            }
        }
    }

    let _ = sess.queue_out(&wire::no_err(&pkt.id, &pkt.topic, now)).await;
}

/// Unregister every topic whose ownership moved to another node.
async fn handle_rehash(globals: &Arc<Globals>) {
    let Some(cluster) = &globals.cluster else { return };

    let mut doomed = Vec::new();
    for entry in globals.hub.topics.iter() {
        let name = entry.key();
        let owner_now = cluster.node_for(name);
        if entry.is_proxy {
            if owner_now != entry.master_node {
                doomed.push(name.clone());
            }
        } else if owner_now != cluster.this_node() {
            doomed.push(name.clone());
        }
    }

    tracing::info!(count = doomed.len(), "rehash: unregistering moved topics");
    for name in doomed {
        if let Some((_, handle)) = globals.hub.topics.remove(&name) {
            let _ = handle.exit.try_send(ShutDown {
                reason: StopReason::Rehashing,
                done: None,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Topic initialization
// ---------------------------------------------------------------------------

/// Default access granted to new subscribers of a topic category.
pub fn get_default_access(cat: TopicCat, auth: bool) -> AccessMode {
    if !auth {
        return AccessMode::NONE;
    }
    match cat {
        TopicCat::Grp => {
            AccessMode::READ | AccessMode::WRITE | AccessMode::PRES | AccessMode::SHARE
        }
        TopicCat::P2P => AccessMode::P2P,
        // 'me' and 'fnd' accept no external subscriptions.
        TopicCat::Me | TopicCat::Fnd => AccessMode::NONE,
    }
}

/// Load an existing topic from the store or create a new one, then register
/// it and hand it the pending join.
async fn topic_init(globals: Arc<Globals>, mut sreg: SessionJoin) {
    let now = time_now();
    let original = sreg.pkt.topic.clone();
    let sess = sreg.sess.clone();

    let mut topic = if original == "me" {
        let Some(mut t) = init_me_topic(&globals, &sreg).await else { return };
        t.user_agent = sess.user_agent.clone();
        t
    } else if original == "fnd" {
        let Some(t) = init_fnd_topic(&globals, &sreg).await else { return };
        t
    } else if original.starts_with("usr") || original.starts_with("p2p") {
        let Some((t, created)) = init_p2p_topic(&globals, &sreg).await else { return };
        sreg.created = created;
        t
    } else if original.starts_with("new") {
        let Some(t) = init_new_grp_topic(&globals, &mut sreg).await else { return };
        sreg.created = true;
        t
    } else if original.starts_with("grp") {
        let Some(t) = init_grp_topic(&globals, &sreg).await else { return };
        t
    } else {
        let _ = sess
            .queue_out(&wire::err_topic_not_found(&sreg.pkt.id, &original, now))
            .await;
        return;
    };

    // Don't let freshly initialized topics outlive a shutdown in progress.
    if globals.hub.is_shutting_down() {
        return;
    }

    tracing::debug!(topic = %topic.name, "topic created or loaded");

    let handle = topic.handle.clone();
    globals.hub.topics.insert(topic.name.clone(), handle.clone());

    tokio::spawn(topic.run());

    sreg.loaded = true;
    let _ = handle.reg.send(sreg).await;
}

async fn init_me_topic(globals: &Arc<Globals>, sreg: &SessionJoin) -> Option<Topic> {
    let now = time_now();
    let sess = &sreg.sess;
    let name = sess.uid.user_id();

    let user = match globals.store.user_get(sess.uid).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::warn!(user = %name, "account unexpectedly missing");
            let _ = sess
                .queue_out(&wire::err_user_not_found(&sreg.pkt.id, "me", now))
                .await;
            return None;
        }
        Err(err) => {
            tracing::warn!(user = %name, ?err, "cannot load user for 'me'");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, "me", now)).await;
            return None;
        }
    };

    let mut topic = Topic::new(globals.clone(), &name, "me", TopicCat::Me);
    topic.access_auth = user.access.auth;
    topic.access_anon = user.access.anon;
    topic.public = user.public.clone();
    topic.created = user.times.created_at;
    topic.updated = user.times.updated_at;

    // Offline invites accumulate under this name while the user is away.
    if let Ok(Some(stored)) = globals.store.topic_get(&name).await {
        topic.last_id = stored.seq_id;
        topic.clear_id = stored.clear_id;
    }

    if load_subscribers(globals, &mut topic).await.is_err() {
        let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, "me", now)).await;
        return None;
    }
    Some(topic)
}

async fn init_fnd_topic(globals: &Arc<Globals>, sreg: &SessionJoin) -> Option<Topic> {
    let now = time_now();
    let sess = &sreg.sess;
    let name = sess.uid.fnd_name();

    let user = match globals.store.user_get(sess.uid).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            let _ = sess
                .queue_out(&wire::err_user_not_found(&sreg.pkt.id, "fnd", now))
                .await;
            return None;
        }
        Err(err) => {
            tracing::warn!(user = %name, ?err, "cannot load user for 'fnd'");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, "fnd", now)).await;
            return None;
        }
    };

    let mut topic = Topic::new(globals.clone(), &name, "fnd", TopicCat::Fnd);
    // No one can join 'fnd'; subscriptions are blocked by default 'N'.
    topic.access_auth = get_default_access(TopicCat::Fnd, true);
    topic.access_anon = get_default_access(TopicCat::Fnd, false);
    topic.public = Some(serde_json::json!(user.tags));
    topic.created = user.times.created_at;
    topic.updated = user.times.updated_at;

    if load_subscribers(globals, &mut topic).await.is_err() {
        let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, "fnd", now)).await;
        return None;
    }
    Some(topic)
}

/// Attach to or create a P2P topic. Returns the topic and whether it (or
/// the missing half of it) was just created.
async fn init_p2p_topic(globals: &Arc<Globals>, sreg: &SessionJoin) -> Option<(Topic, bool)> {
    let now = time_now();
    let sess = &sreg.sess;
    let original = &sreg.pkt.topic;
    let name = sreg.topic.clone();

    let mut topic = Topic::new(globals.clone(), &name, "", TopicCat::P2P);

    let stopic = match globals.store.topic_get(&name).await {
        Ok(t) => t,
        Err(err) => {
            tracing::warn!(topic = %name, ?err, "error while loading p2p topic");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, original, now)).await;
            return None;
        }
    };

    let mut subs = Vec::new();
    if stopic.is_some() {
        subs = match globals.store.subs_for_topic(&name, QueryOpt::default()).await {
            Ok(subs) => subs,
            Err(err) => {
                tracing::warn!(topic = %name, ?err, "cannot load p2p subscriptions");
                let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, original, now)).await;
                return None;
            }
        };
        if subs.is_empty() {
            tracing::error!(topic = %name, "p2p topic with no subscriptions");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, original, now)).await;
            return None;
        }
        if let Some(stopic) = &stopic {
            topic.created = stopic.times.created_at;
            topic.updated = stopic.times.updated_at;
            topic.last_id = stopic.seq_id;
            topic.clear_id = stopic.clear_id;
        }
    }

    // Who is the other party?
    let uid1 = sess.uid;
    let uid2 = if original.starts_with("usr") {
        parse_user_id(original)
    } else {
        match parse_p2p(&name) {
            Some((a, b)) => {
                if a == uid1 {
                    b
                } else {
                    a
                }
            }
            None => ZERO_UID,
        }
    };
    if uid2.is_zero() {
        let _ = sess.queue_out(&wire::err_malformed(&sreg.pkt.id, original, now)).await;
        return None;
    }

    let users = match globals.store.user_get_all(&[uid1, uid2]).await {
        Ok(users) => users,
        Err(err) => {
            tracing::warn!(topic = %name, ?err, "failed to load p2p users");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, original, now)).await;
            return None;
        }
    };
    if users.len() != 2 {
        // The invited user does not exist.
        let _ = sess
            .queue_out(&wire::err_user_not_found(&sreg.pkt.id, original, now))
            .await;
        return None;
    }
    let (user1, user2) = if users[0].uid == uid1 {
        (&users[0], &users[1])
    } else {
        (&users[1], &users[0])
    };

    if stopic.is_some() && subs.len() == 2 {
        // Both subscriptions exist: plain attach.
        for sub in &subs {
            let other = if sub.user == uid1 { user2 } else { user1 };
            topic.per_user.insert(
                sub.user,
                PerUserData {
                    public: other.public.clone(),
                    topic_name: other.uid.user_id(),
                    private: sub.private.clone(),
                    mode_want: sub.mode_want,
                    mode_given: sub.mode_given,
                    clear_id: sub.clear_id,
                    recv_id: sub.recv_seq_id,
                    read_id: sub.read_seq_id,
                    created: Some(sub.times.created_at),
                    updated: Some(sub.times.updated_at),
                    ..Default::default()
                },
            );
        }
        return Some((topic, false));
    }

    // One or both subscriptions are missing; recreate what is absent.
    let mut sub1 = subs.iter().find(|s| s.user == uid1).cloned();
    let mut sub2 = subs.iter().find(|s| s.user == uid2).cloned();
    let user1_only = sub1.is_none() && sub2.is_some();

    if sub2.is_none() {
        let mut given = user1.access.auth;
        if let Some(set) = &sreg.pkt.set {
            if let Some(desc) = &set.desc {
                if let Some(defacs) = &desc.default_acs {
                    if let Ok(access) = parse_default_access(defacs, AccessMode::P2P) {
                        if access.auth != AccessMode::NONE {
                            given = access.auth;
                        }
                    }
                }
            }
        }
        // The invited party has not asked for anything yet: want stays 'N'
        // so the invite reads as an invitation, not a fait accompli.
        let sub = Subscription::new(uid2, &name, AccessMode::NONE, given & AccessMode::P2P);
        sub2 = Some(sub);
    }

    if sub1.is_none() {
        let mode_given = select_access_mode(
            sess.auth_lvl,
            user2.access.anon,
            user2.access.auth,
            AccessMode::P2P,
        );
        // By default want what was given to the other side.
        let mut mode_want = sub2.as_ref().map(|s| s.mode_given).unwrap_or(AccessMode::P2P);
        let mut private = None;

        if let Some(set) = &sreg.pkt.set {
            if let Some(sub) = &set.sub {
                if !sub.user.is_empty() {
                    tracing::debug!(topic = %name, "mode for another user ignored on p2p create");
                } else if !sub.mode.is_empty() {
                    if let Ok(m) = AccessMode::parse(&sub.mode) {
                        mode_want = m & AccessMode::P2P;
                    }
                }
                // An explicit {sub} must leave the user able to join.
                mode_want |= AccessMode::JOIN;
            }
            if let Some(desc) = &set.desc {
                if !wire::is_null_value(&desc.private) {
                    private = desc.private.clone();
                }
            }
        }

        let mut sub = Subscription::new(uid1, &name, mode_want, mode_given);
        sub.private = private;
        sub1 = Some(sub);
    }

    let sub1 = sub1.expect("requester subscription populated above");
    let sub2 = sub2.expect("peer subscription populated above");

    if stopic.is_none() {
        if let Err(err) = globals.store.topic_create_p2p(&sub1, &sub2).await {
            tracing::warn!(topic = %name, ?err, "p2p topic creation failed");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, original, now)).await;
            return None;
        }
        topic.created = sub1.times.created_at;
        topic.updated = sub1.times.updated_at;
    } else {
        let to_make = if user1_only { &sub1 } else { &sub2 };
        if let Err(err) = globals.store.sub_create(to_make).await {
            tracing::warn!(topic = %name, ?err, "p2p re-subscription failed");
            let _ = sess.queue_out(&wire::err_unknown(&sreg.pkt.id, original, now)).await;
            return None;
        }
    }

    topic.per_user.insert(
        uid1,
        PerUserData {
            public: user2.public.clone(),
            topic_name: uid2.user_id(),
            private: sub1.private.clone(),
            mode_want: sub1.mode_want,
            mode_given: sub1.mode_given,
            clear_id: sub1.clear_id,
            recv_id: sub1.recv_seq_id,
            read_id: sub1.read_seq_id,
            created: Some(sub1.times.created_at),
            updated: Some(sub1.times.updated_at),
            ..Default::default()
        },
    );
    topic.per_user.insert(
        uid2,
        PerUserData {
            public: user1.public.clone(),
            topic_name: uid1.user_id(),
            private: sub2.private.clone(),
            mode_want: sub2.mode_want,
            mode_given: sub2.mode_given,
            clear_id: sub2.clear_id,
            recv_id: sub2.recv_seq_id,
            read_id: sub2.read_seq_id,
            created: Some(sub2.times.created_at),
            updated: Some(sub2.times.updated_at),
            ..Default::default()
        },
    );

    Some((topic, true))
}

async fn init_new_grp_topic(globals: &Arc<Globals>, sreg: &mut SessionJoin) -> Option<Topic> {
    let now = time_now();
    let sess = sreg.sess.clone();
    let name = sreg.topic.clone();

    let mut topic = Topic::new(globals.clone(), &name, &name, TopicCat::Grp);
    topic.owner = sess.uid;
    topic.access_auth = get_default_access(TopicCat::Grp, true);
    topic.access_anon = get_default_access(TopicCat::Grp, false);

    let mut user_data = PerUserData {
        mode_given: AccessMode::FULL,
        mode_want: AccessMode::FULL,
        created: Some(now),
        updated: Some(now),
        ..Default::default()
    };
    let mut tags: Vec<String> = Vec::new();

    if let Some(set) = &sreg.pkt.set {
        if let Some(desc) = &set.desc {
            if !wire::is_null_value(&desc.public) {
                topic.public = desc.public.clone();
            }
            if !wire::is_null_value(&desc.private) {
                user_data.private = desc.private.clone();
            }
            if let Some(defacs) = &desc.default_acs {
                // Owner bits cannot be handed out by default.
                match parse_default_access(defacs, !AccessMode::BANNED) {
                    Ok(mut access) => {
                        if access.auth.is_owner() || access.anon.is_owner() {
                            tracing::debug!(topic = %name, "default owner access stripped");
                            access.auth &= !AccessMode::OWNER;
                            access.anon &= !AccessMode::OWNER;
                        }
                        topic.access_auth = access.auth;
                        topic.access_anon = access.anon;
                    }
                    Err(()) => {
                        tracing::debug!(topic = %name, "invalid default access ignored");
                    }
                }
            }
        }
        if let Some(sub) = &set.sub {
            if !sub.mode.is_empty() {
                if let Ok(mode) = AccessMode::parse(&sub.mode) {
                    // The creator may restrict their own access, but never
                    // out of joining or owning what they just made.
                    user_data.mode_want = mode | AccessMode::JOIN | AccessMode::OWNER;
                }
            }
        }
        tags = set
            .tags
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !t.is_empty())
            .take(globals.run.max_tag_count)
            .collect();
    }

    topic.per_user.insert(sess.uid, user_data.clone());
    topic.created = now;
    topic.updated = now;

    let stored = StoredTopic {
        name: name.clone(),
        times: ObjTimes {
            created_at: now,
            updated_at: now,
        },
        access: crate::store::types::DefaultAccess {
            auth: topic.access_auth,
            anon: topic.access_anon,
        },
        seq_id: 0,
        clear_id: 0,
        public: topic.public.clone(),
        tags,
    };
    let mut owner_sub = Subscription::new(sess.uid, &name, user_data.mode_want, user_data.mode_given);
    owner_sub.private = user_data.private.clone();

    if let Err(err) = globals.store.topic_create(&stored, &owner_sub).await {
        tracing::warn!(topic = %name, ?err, "cannot save new topic");
        let _ = sess
            .queue_out(&wire::err_unknown(&sreg.pkt.id, &sreg.pkt.topic, now))
            .await;
        return None;
    }

    // The client learns the assigned name; 'newXYZ' has no value to keep.
    sreg.pkt.topic = name;
    Some(topic)
}

async fn init_grp_topic(globals: &Arc<Globals>, sreg: &SessionJoin) -> Option<Topic> {
    let now = time_now();
    let sess = &sreg.sess;
    let name = sreg.topic.clone();

    let stopic = match globals.store.topic_get(&name).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            let _ = sess
                .queue_out(&wire::err_topic_not_found(&sreg.pkt.id, &sreg.pkt.topic, now))
                .await;
            return None;
        }
        Err(err) => {
            tracing::warn!(topic = %name, ?err, "error while loading topic");
            let _ = sess
                .queue_out(&wire::err_unknown(&sreg.pkt.id, &sreg.pkt.topic, now))
                .await;
            return None;
        }
    };

    let mut topic = Topic::new(globals.clone(), &name, &name, TopicCat::Grp);
    topic.access_auth = stopic.access.auth;
    topic.access_anon = stopic.access.anon;
    topic.public = stopic.public.clone();
    topic.created = stopic.times.created_at;
    topic.updated = stopic.times.updated_at;
    topic.last_id = stopic.seq_id;
    topic.clear_id = stopic.clear_id;

    if load_subscribers(globals, &mut topic).await.is_err() {
        let _ = sess
            .queue_out(&wire::err_unknown(&sreg.pkt.id, &sreg.pkt.topic, now))
            .await;
        return None;
    }
    Some(topic)
}

/// Populate the per-user cache from stored subscriptions; discovers the
/// owner along the way.
async fn load_subscribers(
    globals: &Arc<Globals>,
    topic: &mut Topic,
) -> Result<(), crate::store::StoreError> {
    let subs = globals
        .store
        .subs_for_topic(&topic.name, QueryOpt::default())
        .await?;
    for sub in subs {
        let uid = sub.user;
        if sub.effective().is_owner() {
            topic.owner = uid;
        }
        topic.per_user.insert(
            uid,
            PerUserData {
                created: Some(sub.times.created_at),
                updated: Some(sub.times.updated_at),
                clear_id: sub.clear_id,
                read_id: sub.read_seq_id,
                recv_id: sub.recv_seq_id,
                private: sub.private,
                mode_want: sub.mode_want,
                mode_given: sub.mode_given,
                ..Default::default()
            },
        );
    }
    Ok(())
}

/// Create a proxy topic for a name the ring maps to another node.
async fn proxy_topic_init(globals: Arc<Globals>, sreg: SessionJoin) {
    let Some(cluster) = &globals.cluster else { return };
    let master = cluster.node_for(&sreg.topic);
    if master.is_empty() || master == cluster.this_node() {
        // Raced with a rehash; retry as a local join.
        let _ = globals.hub.join.send(sreg).await;
        return;
    }

    if globals.hub.is_shutting_down() {
        return;
    }

    let cat = topic_cat(&sreg.topic).unwrap_or(TopicCat::Grp);
    let mut topic = Topic::new(globals.clone(), &sreg.topic, &sreg.pkt.topic, cat);
    topic.is_proxy = true;
    topic.master_node = master.clone();

    let (proxy_tx, proxy_rx) = mpsc::channel(crate::topic::BROADCAST_QUEUE);
    topic.handle.is_proxy = true;
    topic.handle.master_node = master;
    topic.handle.proxy = Some(proxy_tx);

    let handle = topic.handle.clone();
    globals.hub.topics.insert(topic.name.clone(), handle.clone());

    tokio::spawn(topic.run_proxy(proxy_rx));
    let _ = handle.reg.send(sreg).await;
}

/// Answer a `get desc` for a topic that is not loaded, straight from the
/// store.
async fn reply_topic_desc_basic(globals: &Globals, meta: MetaReq) {
    let now = time_now();
    let sess = &meta.sess;
    let get = meta.pkt.get.clone().unwrap_or_default();

    let mut desc = TopicDesc::default();

    if meta.topic.starts_with("grp") {
        match globals.store.topic_get(&meta.topic).await {
            Ok(Some(topic)) => {
                desc.created = Some(topic.times.created_at);
                desc.updated = Some(topic.times.updated_at);
                desc.public = topic.public;
            }
            Ok(None) => {
                let _ = sess
                    .queue_out(&wire::err_topic_not_found(&get.id, &get.topic, now))
                    .await;
                return;
            }
            Err(err) => {
                tracing::warn!(topic = %meta.topic, ?err, "desc lookup failed");
                let _ = sess.queue_out(&wire::err_unknown(&get.id, &get.topic, now)).await;
                return;
            }
        }
    } else {
        // 'me' and p2p topics describe the other user.
        let uid = if meta.topic.starts_with("usr") {
            parse_user_id(&meta.topic)
        } else if meta.topic.starts_with("p2p") {
            match parse_p2p(&meta.topic) {
                Some((u1, u2)) if u1 == sess.uid => u2,
                Some((u1, u2)) if u2 == sess.uid => u1,
                _ => ZERO_UID,
            }
        } else {
            ZERO_UID
        };

        if uid.is_zero() {
            let _ = sess.queue_out(&wire::err_malformed(&get.id, &get.topic, now)).await;
            return;
        }

        match globals.store.user_get(uid).await {
            Ok(Some(user)) => {
                desc.created = Some(user.times.created_at);
                desc.updated = Some(user.times.updated_at);
                desc.public = user.public;
            }
            Ok(None) => {
                let _ = sess
                    .queue_out(&wire::err_user_not_found(&get.id, &get.topic, now))
                    .await;
                return;
            }
            Err(err) => {
                tracing::warn!(topic = %meta.topic, ?err, "user desc lookup failed");
                let _ = sess.queue_out(&wire::err_unknown(&get.id, &get.topic, now)).await;
                return;
            }
        }
    }

    let reply = ServerMessage {
        meta: Some(wire::ServerMeta {
            id: get.id.clone(),
            topic: get.topic.clone(),
            ts: Some(now),
            desc: Some(desc),
            sub: None,
            tags: None,
        }),
        ..Default::default()
    };
    let _ = sess.queue_out(&reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_access_by_category() {
        assert_eq!(
            get_default_access(TopicCat::Grp, true).to_string(),
            "RWPS"
        );
        assert_eq!(get_default_access(TopicCat::P2P, true), AccessMode::P2P);
        assert_eq!(get_default_access(TopicCat::Me, true), AccessMode::NONE);
        assert_eq!(get_default_access(TopicCat::Fnd, true), AccessMode::NONE);
        assert_eq!(get_default_access(TopicCat::Grp, false), AccessMode::NONE);
    }

    #[test]
    fn stop_reason_equality() {
        assert_eq!(StopReason::None, StopReason::None);
        assert_ne!(StopReason::Deleted, StopReason::Rehashing);
    }
}
