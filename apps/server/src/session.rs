//! Client sessions: one per connection, each with its own read and write
//! task. The session decodes packets, enforces the protocol-version and
//! authentication gates, expands topic names, and routes requests into
//! topic mailboxes or the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use ulid::Ulid;

use palaver_common::{uid, AccessMode, Uid, ZERO_UID};

use crate::auth::{AuthError, AuthLevel};
use crate::cluster::ProxyReqType;
use crate::hub::{MetaAction, MetaReq, SessionJoin, SessionLeave, TopicHandle, TopicUnreg};
use crate::store::types::{time_now, DeviceDef};
use crate::wire::{self, ClientMessage, DelWhat, ServerData, ServerInfo, ServerMessage};
use crate::Globals;

/// Outbound enqueue timeout; a slower consumer loses the message.
pub const QUEUE_OUT_TIMEOUT: Duration = Duration::from_micros(50);

/// Outbound queue depth per session.
pub const SEND_QUEUE_DEPTH: usize = 128;

/// Wire transport of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProto {
    Websocket,
    LongPoll,
    Grpc,
    /// Multiplexing session standing in for sessions on another node.
    Cluster,
}

/// One outbound unit. Fan-out paths serialize once and share the bytes;
/// cluster write loops need the structured form.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(Box<ServerMessage>),
    Serialized(Arc<String>),
}

/// Control messages a topic (or the hub) sends to a session.
#[derive(Debug, Clone)]
pub enum SessionCtl {
    /// The topic accepted the subscription; remember its mailboxes.
    Attached {
        topic: String,
        handle: TopicHandle,
    },
    /// The topic evicted this session.
    Detach { topic: String },
    /// Terminate the session.
    Stop,
}

/// Immutable snapshot of a session passed into topics and across the
/// cluster. Cheap to clone; the channels are handles.
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub sid: String,
    pub uid: Uid,
    pub auth_lvl: AuthLevel,
    pub user_agent: String,
    pub remote_addr: String,
    pub lang: String,
    pub device_id: String,
    pub platform: String,
    pub background: bool,
    pub proto: SessionProto,
    pub send: mpsc::Sender<Outbound>,
    pub ctl: mpsc::Sender<SessionCtl>,
    /// Master side only: request type the proxied message arrived under.
    pub proxy_req: ProxyReqType,
    /// Master side only: id of the multiplexing session carrying this one.
    pub multi_sid: Option<String>,
}

impl SessionRef {
    /// Key under which a topic stores this session. Proxied sessions
    /// collapse onto their multiplexing session so a broadcast crosses the
    /// wire once per (topic, node).
    pub fn effective_sid(&self) -> &str {
        self.multi_sid.as_deref().unwrap_or(&self.sid)
    }

    /// Enqueue a message, serializing for the transport. Returns false if
    /// the queue stayed full past the timeout and the message was dropped.
    pub async fn queue_out(&self, msg: &ServerMessage) -> bool {
        let out = match self.proto {
            SessionProto::Cluster => {
                let mut m = msg.clone();
                m.sess = Some(self.clone());
                Outbound::Message(Box::new(m))
            }
            _ => match serde_json::to_string(msg) {
                Ok(s) => Outbound::Serialized(Arc::new(s)),
                Err(err) => {
                    tracing::error!(?err, sid = %self.sid, "failed to serialize message");
                    return false;
                }
            },
        };
        self.queue_raw(out).await
    }

    /// Enqueue pre-serialized bytes (the fan-out fast path).
    pub async fn queue_out_bytes(&self, data: Arc<String>) -> bool {
        self.queue_raw(Outbound::Serialized(data)).await
    }

    async fn queue_raw(&self, out: Outbound) -> bool {
        match self.send.send_timeout(out, QUEUE_OUT_TIMEOUT).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(sid = %self.sid, "session send queue timeout, message dropped");
                false
            }
        }
    }

    /// Ask the session to drop its link to a topic.
    pub async fn detach(&self, topic: &str) {
        let _ = self
            .ctl
            .send(SessionCtl::Detach {
                topic: topic.to_string(),
            })
            .await;
    }
}

/// Process-wide registry of live sessions, multiplexing ones included.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<String, SessionRef>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sess: SessionRef) {
        self.inner.insert(sess.sid.clone(), sess);
    }

    pub fn get(&self, sid: &str) -> Option<SessionRef> {
        self.inner.get(sid).map(|e| e.clone())
    }

    pub fn delete(&self, sid: &str) {
        self.inner.remove(sid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Terminate all sessions of a user, e.g. when the account is deleted.
    pub async fn evict_user(&self, uid: Uid, skip_sid: &str) {
        let victims: Vec<SessionRef> = self
            .inner
            .iter()
            .filter(|e| e.uid == uid && e.sid != skip_sid)
            .map(|e| e.clone())
            .collect();
        for sess in victims {
            let _ = sess.ctl.send(SessionCtl::Stop).await;
        }
    }

    /// Broadcast a shutdown notice to every connected session.
    pub async fn shutdown_all(&self) {
        let note = wire::no_err_shutdown(time_now());
        let sessions: Vec<SessionRef> = self.inner.iter().map(|e| e.clone()).collect();
        for sess in sessions {
            let _ = sess.queue_out(&note).await;
            let _ = sess.ctl.send(SessionCtl::Stop).await;
        }
    }
}

/// Per-connection state. Owned and mutated by the connection's read task
/// only.
pub struct Session {
    pub sid: String,
    pub proto: SessionProto,
    pub remote_addr: String,

    /// Protocol version, `((major & 0xff) << 8) | (minor & 0xff)`; zero
    /// until `{hi}` is processed.
    ver: u16,
    uid: Uid,
    auth_lvl: AuthLevel,
    user_agent: String,
    device_id: String,
    lang: String,
    platform: String,
    background: bool,

    /// Topic attachments, keyed by routable name.
    subs: HashMap<String, TopicHandle>,

    send_tx: mpsc::Sender<Outbound>,
    ctl_tx: mpsc::Sender<SessionCtl>,

    globals: Arc<Globals>,
}

impl Session {
    pub fn new(
        globals: Arc<Globals>,
        proto: SessionProto,
        remote_addr: String,
        send_tx: mpsc::Sender<Outbound>,
        ctl_tx: mpsc::Sender<SessionCtl>,
    ) -> Self {
        Self {
            sid: format!("ses_{}", Ulid::new()),
            proto,
            remote_addr,
            ver: 0,
            uid: ZERO_UID,
            auth_lvl: AuthLevel::None,
            user_agent: String::new(),
            device_id: String::new(),
            lang: String::new(),
            platform: String::new(),
            background: false,
            subs: HashMap::new(),
            send_tx,
            ctl_tx,
            globals,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Whether this session holds a live link to the topic.
    pub fn is_attached(&self, expanded: &str) -> bool {
        self.subs.contains_key(expanded)
    }

    pub fn session_ref(&self) -> SessionRef {
        SessionRef {
            sid: self.sid.clone(),
            uid: self.uid,
            auth_lvl: self.auth_lvl,
            user_agent: self.user_agent.clone(),
            remote_addr: self.remote_addr.clone(),
            lang: self.lang.clone(),
            device_id: self.device_id.clone(),
            platform: self.platform.clone(),
            background: self.background,
            proto: self.proto,
            send: self.send_tx.clone(),
            ctl: self.ctl_tx.clone(),
            proxy_req: ProxyReqType::None,
            multi_sid: None,
        }
    }

    async fn queue_out(&self, msg: &ServerMessage) {
        let _ = self.session_ref().queue_out(msg).await;
    }

    /// Decode raw bytes from the transport and dispatch.
    pub async fn dispatch_raw(&mut self, raw: &str) {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(msg) => self.dispatch(msg).await,
            Err(err) => {
                tracing::debug!(sid = %self.sid, ?err, "malformed client packet");
                self.queue_out(&wire::err_malformed("", "", time_now())).await;
            }
        }
    }

    pub async fn dispatch(&mut self, msg: ClientMessage) {
        let mut skip_ua_refresh = msg.leave.is_some();
        if let Some(del) = &msg.del {
            skip_ua_refresh |= del.what == "topic";
        }

        if let Some(hi) = msg.hi {
            self.hello(hi).await;
        } else if let Some(login) = msg.login {
            self.login(login).await;
        } else if let Some(acc) = msg.acc {
            self.account(acc).await;
        } else if let Some(sub) = msg.sub {
            self.subscribe(sub).await;
        } else if let Some(leave) = msg.leave {
            self.leave(leave).await;
        } else if let Some(publish) = msg.publish {
            self.publish(publish).await;
        } else if let Some(get) = msg.get {
            self.get(get).await;
        } else if let Some(set) = msg.set {
            self.set(set).await;
        } else if let Some(del) = msg.del {
            self.del(del).await;
        } else if let Some(note) = msg.note {
            self.note(note).await;
        } else {
            tracing::debug!(sid = %self.sid, "empty client envelope");
            self.queue_out(&wire::err_malformed("", "", time_now())).await;
            return;
        }

        // Let 'me' know this session is active so the user agent stays fresh.
        if !skip_ua_refresh && !self.uid.is_zero() {
            if let Some(sub) = self.subs.get(&self.uid.user_id()) {
                let _ = sub.ua.send(self.user_agent.clone()).await;
            }
        }
    }

    /// React to a control message from a topic.
    pub async fn handle_ctl(&mut self, ctl: SessionCtl) -> bool {
        match ctl {
            SessionCtl::Attached { topic, handle } => {
                self.subs.insert(topic, handle);
                true
            }
            SessionCtl::Detach { topic } => {
                self.subs.remove(&topic);
                true
            }
            SessionCtl::Stop => false,
        }
    }

    /// Leave every attached topic; called when the transport closes.
    pub async fn cleanup(&mut self) {
        let subs: Vec<TopicHandle> = self.subs.drain().map(|(_, h)| h).collect();
        for sub in subs {
            let _ = sub
                .leave
                .send(SessionLeave {
                    sess: self.session_ref(),
                    unsub: false,
                    topic: String::new(),
                    id: String::new(),
                })
                .await;
        }
        self.globals.sessions.delete(&self.sid);
    }

    // -----------------------------------------------------------------
    // Command handlers
    // -----------------------------------------------------------------

    async fn hello(&mut self, hi: wire::ClientHi) {
        let now = time_now();

        if self.ver == 0 {
            if hi.version.is_empty() {
                self.queue_out(&wire::err_malformed(&hi.id, "", now)).await;
                return;
            }
            let ver = wire::parse_version(&hi.version);
            if ver == 0 {
                self.queue_out(&wire::err_malformed(&hi.id, "", now)).await;
                return;
            }
            if ver < wire::parse_version(wire::MIN_SUPPORTED_VERSION) {
                self.queue_out(&wire::err_version_not_supported(&hi.id, now))
                    .await;
                return;
            }
            self.ver = ver;
            self.apply_hi_fields(&hi);
            self.queue_out(&wire::no_err_created_params(
                &hi.id,
                "",
                now,
                json!({"ver": wire::CURRENT_VERSION, "build": self.globals.run.build}),
            ))
            .await;
        } else if hi.version.is_empty() || wire::parse_version(&hi.version) == self.ver {
            // Refresh of device id or language; persist for push routing.
            self.apply_hi_fields(&hi);
            if !self.uid.is_zero() && !self.device_id.is_empty() {
                let dev = DeviceDef {
                    device_id: self.device_id.clone(),
                    platform: self.platform.clone(),
                    last_seen: now,
                    lang: self.lang.clone(),
                };
                if let Err(err) = self.globals.store.device_upsert(self.uid, &dev).await {
                    tracing::warn!(?err, sid = %self.sid, "device update failed");
                    self.queue_out(&wire::err_unknown(&hi.id, "", now)).await;
                    return;
                }
            }
            self.queue_out(&wire::no_err(&hi.id, "", now)).await;
        } else {
            // Version cannot change mid-session.
            self.queue_out(&wire::err_command_out_of_sequence(&hi.id, now))
                .await;
        }
    }

    fn apply_hi_fields(&mut self, hi: &wire::ClientHi) {
        if !hi.user_agent.is_empty() {
            self.user_agent = hi.user_agent.clone();
        }
        if !hi.device_id.is_empty() {
            self.device_id = hi.device_id.clone();
        }
        if !hi.lang.is_empty() {
            self.lang = hi.lang.clone();
        }
        if !hi.platform.is_empty() {
            self.platform = hi.platform.clone();
        }
        self.background = hi.background;
    }

    async fn login(&mut self, login: wire::ClientLogin) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&login.id, now))
                .await;
            return;
        }
        if !self.uid.is_zero() {
            self.queue_out(&wire::err_already_authenticated(&login.id, "", now))
                .await;
            return;
        }

        let Some(handler) = self.globals.auth.get(&login.scheme) else {
            self.queue_out(&wire::err_auth_unknown_scheme(&login.id, "", now))
                .await;
            return;
        };

        let ctx = match handler.authenticate(&login.secret).await {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::debug!(sid = %self.sid, scheme = %login.scheme, ?err, "login failed");
                self.queue_out(&decode_auth_error(&err, &login.id, now)).await;
                return;
            }
        };

        self.uid = ctx.uid;
        self.auth_lvl = ctx.lvl;

        // Regardless of the login scheme the session walks away with a
        // fresh token.
        let Some(token_auth) = self.globals.auth.token() else {
            self.queue_out(&wire::err_unknown(&login.id, "", now)).await;
            return;
        };
        let lifetime = ctx.expires.map(|e| e - now);
        let (token, expires) = match token_auth.gen_secret(ctx.uid, ctx.lvl, lifetime) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(sid = %self.sid, ?err, "token generation failed");
                self.queue_out(&wire::err_auth_failed(&login.id, "", now)).await;
                return;
            }
        };

        if !self.device_id.is_empty() {
            let dev = DeviceDef {
                device_id: self.device_id.clone(),
                platform: self.platform.clone(),
                last_seen: now,
                lang: self.lang.clone(),
            };
            if let Err(err) = self.globals.store.device_upsert(self.uid, &dev).await {
                tracing::warn!(?err, sid = %self.sid, "device record failed");
            }
        }

        tracing::info!(sid = %self.sid, user = %self.uid.user_id(), "session authenticated");
        // The registry's snapshot predates authentication; refresh it.
        self.globals.sessions.insert(self.session_ref());

        self.queue_out(&wire::no_err_params(
            &login.id,
            "",
            now,
            json!({
                "user": self.uid.user_id(),
                "authlvl": ctx.lvl.name(),
                "token": token,
                "expires": expires,
            }),
        ))
        .await;
    }

    async fn account(&mut self, acc: wire::ClientAcc) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&acc.id, now))
                .await;
            return;
        }

        let handler = self.globals.auth.get(&acc.scheme);

        if acc.user.starts_with("new") {
            let Some(handler) = handler else {
                // New accounts must name an authentication scheme.
                self.queue_out(&wire::err_malformed(&acc.id, "", now)).await;
                return;
            };

            if acc.login && !self.uid.is_zero() {
                self.queue_out(&wire::err_already_authenticated(&acc.id, "", now))
                    .await;
                return;
            }

            match handler.is_unique(&acc.secret).await {
                Ok(_) => {}
                Err(AuthError::Duplicate) => {
                    self.queue_out(&wire::err_duplicate_credential(&acc.id, "", now))
                        .await;
                    return;
                }
                Err(err) => {
                    self.queue_out(&decode_auth_error(&err, &acc.id, now)).await;
                    return;
                }
            }

            let user = match build_new_user(&self.globals, &acc) {
                Ok(user) => user,
                Err(reply) => {
                    let mut reply = reply;
                    if let Some(ctrl) = reply.ctrl.as_mut() {
                        ctrl.id = acc.id.clone();
                    }
                    self.queue_out(&reply).await;
                    return;
                }
            };

            if let Err(err) = self.globals.store.user_create(&user).await {
                tracing::warn!(?err, "account creation failed");
                let reply = match err {
                    crate::store::StoreError::Duplicate => {
                        wire::err_duplicate_credential(&acc.id, "", now)
                    }
                    _ => wire::err_unknown(&acc.id, "", now),
                };
                self.queue_out(&reply).await;
                return;
            }

            let auth_lvl = match handler.add_record(user.uid, &acc.secret).await {
                Ok(lvl) => lvl,
                Err(err) => {
                    // Roll back the half-created account.
                    let _ = self.globals.store.user_delete(user.uid, false).await;
                    self.queue_out(&decode_auth_error(&err, &acc.id, now)).await;
                    return;
                }
            };

            let private = acc.desc.as_ref().and_then(|d| {
                if wire::is_null_value(&d.private) {
                    None
                } else {
                    d.private.clone()
                }
            });

            let mut params = json!({
                "user": user.uid.user_id(),
                "desc": {
                    "created": user.times.created_at,
                    "updated": user.times.updated_at,
                    "defacs": {
                        "auth": user.access.auth.to_string(),
                        "anon": user.access.anon.to_string(),
                    },
                    "public": user.public,
                    "private": private,
                },
            });

            if acc.login {
                self.uid = user.uid;
                self.auth_lvl = auth_lvl;
                self.globals.sessions.insert(self.session_ref());

                if let Some(token_auth) = self.globals.auth.token() {
                    if let Ok((token, expires)) =
                        token_auth.gen_secret(self.uid, self.auth_lvl, None)
                    {
                        params["authlvl"] = json!(auth_lvl.name());
                        params["token"] = json!(token);
                        params["expires"] = json!(expires);
                    }
                }
                if !self.device_id.is_empty() {
                    let dev = DeviceDef {
                        device_id: self.device_id.clone(),
                        platform: self.platform.clone(),
                        last_seen: now,
                        lang: self.lang.clone(),
                    };
                    let _ = self.globals.store.device_upsert(self.uid, &dev).await;
                }
            }

            tracing::info!(user = %user.uid.user_id(), "account created");
            self.queue_out(&wire::no_err_created_params(&acc.id, "", now, params))
                .await;
        } else if !self.uid.is_zero() {
            // Update of the current account's credentials.
            if let Some(handler) = handler {
                if let Err(err) = handler.update_record(self.uid, &acc.secret).await {
                    tracing::debug!(?err, "credential update failed");
                    self.queue_out(&decode_auth_error(&err, &acc.id, now)).await;
                    return;
                }
            } else if !acc.scheme.is_empty() {
                self.queue_out(&wire::err_malformed(&acc.id, "", now)).await;
                return;
            }
            self.queue_out(&wire::no_err(&acc.id, "", now)).await;
        } else {
            // Unauthenticated and not creating an account.
            self.queue_out(&wire::err_permission_denied(&acc.id, "", now))
                .await;
        }
    }

    async fn subscribe(&mut self, sub: wire::ClientSub) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&sub.id, now))
                .await;
            return;
        }

        let expanded = if sub.topic.starts_with("new") {
            if self.uid.is_zero() {
                self.queue_out(&wire::err_auth_required(&sub.id, &sub.topic, now))
                    .await;
                return;
            }
            self.globals.gen_local_topic_name()
        } else {
            match self.validate_topic_name(&sub.id, &sub.topic, now) {
                Ok(name) => name,
                Err(reply) => {
                    self.queue_out(&reply).await;
                    return;
                }
            }
        };

        if self.subs.contains_key(&expanded) {
            self.queue_out(&wire::info_already_subscribed(&sub.id, &sub.topic, now))
                .await;
            return;
        }

        let join = SessionJoin {
            topic: expanded,
            pkt: sub,
            sess: self.session_ref(),
            created: false,
            loaded: false,
        };
        if self.globals.hub.join.send(join).await.is_err() {
            self.queue_out(&wire::err_unknown("", "", now)).await;
        }
        // The hub or the topic replies with the appropriate {ctrl}.
    }

    async fn leave(&mut self, leave: wire::ClientLeave) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&leave.id, now))
                .await;
            return;
        }

        let expanded = match self.validate_topic_name(&leave.id, &leave.topic, now) {
            Ok(name) => name,
            Err(reply) => {
                self.queue_out(&reply).await;
                return;
            }
        };

        if let Some(sub) = self.subs.get(&expanded) {
            if (leave.topic == "me" || leave.topic == "fnd") && leave.unsub {
                // 'me' and 'fnd' cannot be unsubscribed, only left.
                self.queue_out(&wire::err_operation_not_allowed(&leave.id, &leave.topic, now))
                    .await;
                return;
            }
            let done = sub.leave.clone();
            self.subs.remove(&expanded);
            let _ = done
                .send(SessionLeave {
                    sess: self.session_ref(),
                    unsub: leave.unsub,
                    topic: leave.topic,
                    id: leave.id,
                })
                .await;
        } else if !leave.unsub {
            // Leaving a topic that was never joined: no change.
            self.queue_out(&wire::info_not_joined(&leave.id, &leave.topic, now))
                .await;
        } else {
            // Unsubscribing without attaching first.
            self.queue_out(&wire::err_attach_first(&leave.id, &leave.topic, now))
                .await;
        }
    }

    async fn publish(&mut self, publish: wire::ClientPub) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&publish.id, now))
                .await;
            return;
        }

        let expanded = match self.validate_topic_name(&publish.id, &publish.topic, now) {
            Ok(name) => name,
            Err(reply) => {
                self.queue_out(&reply).await;
                return;
            }
        };

        let Some(sub) = self.subs.get(&expanded).cloned() else {
            self.queue_out(&wire::err_attach_first(&publish.id, &publish.topic, now))
                .await;
            return;
        };

        let data = ServerMessage {
            data: Some(ServerData {
                topic: publish.topic.clone(),
                from: self.uid.user_id(),
                ts: now,
                seq_id: 0,
                head: publish.head,
                content: publish.content,
            }),
            id: publish.id.clone(),
            rcpt_to: expanded.clone(),
            as_user: self.uid.user_id(),
            skip_sid: if publish.no_echo {
                self.sid.clone()
            } else {
                String::new()
            },
            sess: Some(self.session_ref()),
            ..Default::default()
        };

        self.broadcast_or_detach(&expanded, sub, data, &publish.id, &publish.topic)
            .await;
    }

    async fn get(&mut self, get: wire::ClientGet) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&get.id, now))
                .await;
            return;
        }

        let expanded = match self.validate_topic_name(&get.id, &get.topic, now) {
            Ok(name) => name,
            Err(reply) => {
                self.queue_out(&reply).await;
                return;
            }
        };

        let what = wire::parse_meta_what(&get.query.what);
        if what == 0 {
            self.queue_out(&wire::err_malformed(&get.id, &get.topic, now))
                .await;
            return;
        }

        let req = MetaReq {
            topic: expanded.clone(),
            action: MetaAction::Get(what),
            pkt: ClientMessage {
                get: Some(get.clone()),
                ..Default::default()
            },
            sess: self.session_ref(),
        };

        if let Some(sub) = self.subs.get(&expanded) {
            let _ = sub.meta.send(req).await;
        } else if what & (wire::META_DATA | wire::META_SUB) != 0 {
            // Data and membership need a live attachment.
            self.queue_out(&wire::err_permission_denied(&get.id, &get.topic, now))
                .await;
        } else {
            // Description of a topic not subscribed to; hub answers from
            // the store.
            let _ = self.globals.hub.meta.send(req).await;
        }
    }

    async fn set(&mut self, set: wire::ClientSet) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&set.id, now))
                .await;
            return;
        }

        let expanded = match self.validate_topic_name(&set.id, &set.topic, now) {
            Ok(name) => name,
            Err(reply) => {
                self.queue_out(&reply).await;
                return;
            }
        };

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
            self.queue_out(&wire::err_malformed(&set.id, &set.topic, now))
                .await;
            return;
        }

        if let Some(sub) = self.subs.get(&expanded) {
            let req = MetaReq {
                topic: expanded.clone(),
                action: MetaAction::Set(what),
                pkt: ClientMessage {
                    set: Some(set),
                    ..Default::default()
                },
                sess: self.session_ref(),
            };
            let _ = sub.meta.send(req).await;
        } else {
            self.queue_out(&wire::err_permission_denied(&set.id, &set.topic, now))
                .await;
        }
    }

    async fn del(&mut self, del: wire::ClientDel) {
        let now = time_now();

        if self.ver == 0 {
            self.queue_out(&wire::err_command_out_of_sequence(&del.id, now))
                .await;
            return;
        }

        let expanded = match self.validate_topic_name(&del.id, &del.topic, now) {
            Ok(name) => name,
            Err(reply) => {
                self.queue_out(&reply).await;
                return;
            }
        };

        let Some(what) = wire::parse_del_what(&del.what) else {
            self.queue_out(&wire::err_malformed(&del.id, &del.topic, now))
                .await;
            return;
        };

        match what {
            DelWhat::Msg => {
                if let Some(sub) = self.subs.get(&expanded) {
                    let req = MetaReq {
                        topic: expanded.clone(),
                        action: MetaAction::Del(DelWhat::Msg),
                        pkt: ClientMessage {
                            del: Some(del),
                            ..Default::default()
                        },
                        sess: self.session_ref(),
                    };
                    let _ = sub.meta.send(req).await;
                } else {
                    self.queue_out(&wire::err_attach_first(&del.id, &del.topic, now))
                        .await;
                }
            }
            DelWhat::Topic => {
                // Attached or not, topic deletion goes through the hub.
                let _ = self
                    .globals
                    .hub
                    .unreg
                    .send(TopicUnreg {
                        topic: expanded,
                        sess: Some(self.session_ref()),
                        pkt: Some(del),
                        del: true,
                    })
                    .await;
            }
        }
    }

    async fn note(&mut self, note: wire::ClientNote) {
        if self.ver == 0 {
            return;
        }

        let Ok(expanded) = self.validate_topic_name("", &note.topic, time_now()) else {
            return;
        };

        // Notes are fire-and-forget: malformed ones die silently.
        match note.what.as_str() {
            "kp" => {
                if note.seq != 0 {
                    return;
                }
            }
            "recv" | "read" => {
                if note.seq == 0 {
                    return;
                }
            }
            _ => return,
        }

        let Some(sub) = self.subs.get(&expanded).cloned() else {
            return;
        };

        let info = ServerMessage {
            info: Some(ServerInfo {
                topic: note.topic,
                from: self.uid.user_id(),
                what: note.what,
                seq_id: note.seq,
            }),
            rcpt_to: expanded.clone(),
            as_user: self.uid.user_id(),
            skip_sid: self.sid.clone(),
            ..Default::default()
        };
        self.broadcast_or_detach(&expanded, sub, info, "", "")
            .await;
    }

    /// Push into a topic's broadcast mailbox. That queue must not drop: a
    /// full queue means the topic is stuck, and the session detaches from
    /// it instead.
    async fn broadcast_or_detach(
        &mut self,
        expanded: &str,
        sub: TopicHandle,
        msg: ServerMessage,
        id: &str,
        topic: &str,
    ) {
        use mpsc::error::TrySendError;
        match sub.broadcast.try_send(Box::new(msg)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(sid = %self.sid, topic = %expanded, "broadcast queue full, detaching");
                self.subs.remove(expanded);
                let _ = sub
                    .leave
                    .send(SessionLeave {
                        sess: self.session_ref(),
                        unsub: false,
                        topic: String::new(),
                        id: String::new(),
                    })
                    .await;
                if !id.is_empty() {
                    self.queue_out(&wire::err_unknown(id, topic, time_now())).await;
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.subs.remove(expanded);
                if !id.is_empty() {
                    self.queue_out(&wire::err_unknown(id, topic, time_now())).await;
                }
            }
        }
    }

    /// Expand a session-level topic name into its routable form.
    fn validate_topic_name(
        &self,
        msg_id: &str,
        topic: &str,
        ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<String, ServerMessage> {
        if topic.is_empty() {
            return Err(wire::err_malformed(msg_id, "", ts));
        }

        if !topic.starts_with("grp") && self.uid.is_zero() {
            // me, fnd and p2p topics require authentication.
            return Err(wire::err_auth_required(msg_id, topic, ts));
        }

        let route_to = if topic == "me" {
            self.uid.user_id()
        } else if topic == "fnd" {
            self.uid.fnd_name()
        } else if topic.starts_with("usr") {
            let uid2 = uid::parse_user_id(topic);
            if uid2.is_zero() {
                return Err(wire::err_malformed(msg_id, topic, ts));
            }
            if uid2 == self.uid {
                // Use 'me' to address the self-topic.
                return Err(wire::err_permission_denied(msg_id, topic, ts));
            }
            self.uid.p2p_name(uid2)
        } else if topic.starts_with("p2p") {
            match uid::parse_p2p(topic) {
                Some((u1, u2)) if u1 == self.uid || u2 == self.uid => topic.to_string(),
                Some(_) => return Err(wire::err_permission_denied(msg_id, topic, ts)),
                None => return Err(wire::err_malformed(msg_id, topic, ts)),
            }
        } else {
            topic.to_string()
        };

        Ok(route_to)
    }
}

/// Build a stored user record from an `{acc user="newXXX"}` request.
pub fn build_new_user(
    globals: &Globals,
    acc: &wire::ClientAcc,
) -> Result<crate::store::types::User, ServerMessage> {
    use crate::store::types::{DefaultAccess, ObjTimes, User};

    let now = time_now();

    // Default access to the user's P2P topics.
    let mut access = DefaultAccess {
        auth: AccessMode::P2P,
        anon: AccessMode::NONE,
    };
    let mut public = None;

    if let Some(desc) = &acc.desc {
        if let Some(defacs) = &desc.default_acs {
            if let Some(auth) = &defacs.auth {
                match AccessMode::parse(auth) {
                    // P2P participants never hold more than the P2P set.
                    Ok(mode) => access.auth = mode & AccessMode::P2P,
                    Err(_) => return Err(wire::err_malformed("", "", now)),
                }
            }
            if let Some(anon) = &defacs.anon {
                match AccessMode::parse(anon) {
                    Ok(mode) => access.anon = mode & AccessMode::P2P,
                    Err(_) => return Err(wire::err_malformed("", "", now)),
                }
            }
        }
        if !wire::is_null_value(&desc.public) {
            public = desc.public.clone();
        }
    }

    let tags = acc
        .tags
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|t| !t.is_empty())
        .take(globals.run.max_tag_count)
        .collect();

    Ok(User {
        uid: globals.uid_gen.generate(),
        times: ObjTimes {
            created_at: now,
            updated_at: now,
        },
        access,
        public,
        tags,
        last_seen: None,
        user_agent: String::new(),
    })
}

/// Translate an authentication failure into its wire form. Everything
/// collapses to 401 except duplicates (409) and policy violations (422),
/// by design: failure detail would enable user enumeration.
pub fn decode_auth_error(
    err: &AuthError,
    id: &str,
    ts: chrono::DateTime<chrono::Utc>,
) -> ServerMessage {
    match err {
        AuthError::Internal(msg) => {
            tracing::error!(%msg, "authenticator internal error");
            wire::err_unknown(id, "", ts)
        }
        AuthError::Malformed => wire::err_malformed(id, "", ts),
        AuthError::Duplicate => wire::err_duplicate_credential(id, "", ts),
        AuthError::Unsupported => wire::err_not_implemented(id, "", ts),
        AuthError::Policy => wire::err_policy(id, "", ts),
        AuthError::Failed | AuthError::Expired => wire::err_auth_failed(id, "", ts),
    }
}

/// Pick the default access for a subscriber of the given level.
pub fn select_access_mode(
    lvl: AuthLevel,
    anon: AccessMode,
    auth: AccessMode,
    mask: AccessMode,
) -> AccessMode {
    let mode = match lvl {
        AuthLevel::None => AccessMode::NONE,
        AuthLevel::Anon => anon,
        AuthLevel::Auth | AuthLevel::Root => auth,
    };
    mode & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_access_mode_by_level() {
        let anon = AccessMode::parse("R").unwrap();
        let auth = AccessMode::parse("RWP").unwrap();
        assert_eq!(
            select_access_mode(AuthLevel::Anon, anon, auth, AccessMode::P2P),
            anon
        );
        assert_eq!(
            select_access_mode(AuthLevel::Auth, anon, auth, AccessMode::P2P),
            auth
        );
        assert_eq!(
            select_access_mode(AuthLevel::None, anon, auth, AccessMode::P2P),
            AccessMode::NONE
        );
        // The mask clips bits the category does not support.
        let wide = AccessMode::parse("RWPSDO").unwrap();
        assert_eq!(
            select_access_mode(AuthLevel::Auth, anon, wide, AccessMode::P2P),
            AccessMode::P2P
        );
    }

    #[test]
    fn decode_auth_error_collapses_to_401() {
        let ts = time_now();
        let failed = decode_auth_error(&AuthError::Failed, "1", ts);
        let expired = decode_auth_error(&AuthError::Expired, "1", ts);
        assert_eq!(failed.ctrl.as_ref().unwrap().code, 401);
        assert_eq!(expired.ctrl.as_ref().unwrap().code, 401);

        let dup = decode_auth_error(&AuthError::Duplicate, "1", ts);
        assert_eq!(dup.ctrl.as_ref().unwrap().code, 409);

        let policy = decode_auth_error(&AuthError::Policy, "1", ts);
        assert_eq!(policy.ctrl.as_ref().unwrap().code, 422);
    }
}
