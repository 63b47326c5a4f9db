//! The topic actor: an isolated, server-serialized conversation channel.
//!
//! Every live topic is one task selecting over its mailboxes. All mutation
//! of the topic's per-user cache, seq counter and attached-session set
//! happens inside that loop; that serialization is the concurrency
//! invariant everything else leans on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use palaver_common::uid::{parse_user_id, TopicCat};
use palaver_common::{AccessMode, Uid, ZERO_UID};

use crate::cluster::ClusterResp;
use crate::hub::{
    MetaAction, MetaReq, SessionJoin, SessionLeave, ShutDown, StopReason, TopicHandle, TopicUnreg,
};
use crate::presence::PresParams;
use crate::push::{self, Receipt, Recipient};
use crate::session::{select_access_mode, SessionRef};
use crate::store::types::{time_now, DelMessage, Message, QueryOpt, SubUpdate, Subscription};
use crate::store::StoreError;
use crate::wire::{self, AccessModeMsg, ClientSet, DelWhat, ServerMessage, TopicDesc, TopicSubMsg};
use crate::Globals;

/// Mailbox depths. `broadcast` must not drop: a full queue detaches the
/// producer instead. The rest block the producer.
pub const BROADCAST_QUEUE: usize = 256;
pub const REQUEST_QUEUE: usize = 32;

/// Debounce window for user-agent announcements on `me`.
const UA_TIMER: Duration = Duration::from_secs(5);

/// Invitation kinds delivered as `{data}` on `me`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteAction {
    /// An invitation to subscribe.
    Join,
    /// A request to approve a subscription.
    Appr,
    /// Informational, no action required.
    Info,
}

impl InviteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            InviteAction::Join => "join",
            InviteAction::Appr => "appr",
            InviteAction::Info => "info",
        }
    }
}

/// Cached per-subscriber state.
#[derive(Debug, Clone, Default)]
pub struct PerUserData {
    /// Number of attached sessions of this user.
    pub online: u32,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub private: Option<Value>,
    /// P2P only: the other party's public.
    pub public: Option<Value>,
    /// P2P only: what this user calls the topic (`usr<other>`).
    pub topic_name: String,
    pub clear_id: u64,
    pub recv_id: u64,
    pub read_id: u64,
}

impl PerUserData {
    pub fn effective(&self) -> AccessMode {
        self.mode_want & self.mode_given
    }
}

/// Contact-graph entry on a `me` topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerSubsData {
    pub online: bool,
    /// Presence exchange enabled: `want & given & P` on the subscription.
    pub enabled: bool,
}

pub struct TopicReceivers {
    pub reg: mpsc::Receiver<SessionJoin>,
    pub leave: mpsc::Receiver<SessionLeave>,
    pub broadcast: mpsc::Receiver<Box<ServerMessage>>,
    pub meta: mpsc::Receiver<MetaReq>,
    pub ua: mpsc::Receiver<String>,
    pub exit: mpsc::Receiver<ShutDown>,
}

pub struct Topic {
    pub name: String,
    /// User-visible original name. Empty for P2P: each party has their own
    /// in `PerUserData::topic_name`.
    pub x_original: String,
    pub cat: TopicCat,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// Id of the last data message; assigned only by this actor.
    pub last_id: u64,
    /// Watermark below which messages are erased for everyone.
    pub clear_id: u64,

    /// Group topics only.
    pub owner: Uid,

    pub access_auth: AccessMode,
    pub access_anon: AccessMode,

    pub public: Option<Value>,

    pub per_user: HashMap<Uid, PerUserData>,
    /// Contact graph, `me` only.
    pub per_subs: HashMap<String, PerSubsData>,

    /// Attached sessions keyed by effective sid.
    pub sessions: HashMap<String, SessionRef>,

    pub user_agent: String,

    /// Proxy mode: this topic is a shim for a master on another node.
    pub is_proxy: bool,
    pub master_node: String,

    pub globals: Arc<Globals>,
    pub handle: TopicHandle,
    rx: TopicReceivers,
}

impl Topic {
    /// Allocate the topic shell: channels, handle, empty caches.
    pub fn new(globals: Arc<Globals>, name: &str, original: &str, cat: TopicCat) -> Self {
        let (reg_tx, reg_rx) = mpsc::channel(REQUEST_QUEUE);
        let (leave_tx, leave_rx) = mpsc::channel(REQUEST_QUEUE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);
        let (meta_tx, meta_rx) = mpsc::channel(REQUEST_QUEUE);
        let (ua_tx, ua_rx) = mpsc::channel(REQUEST_QUEUE);
        let (exit_tx, exit_rx) = mpsc::channel(1);

        let handle = TopicHandle {
            name: name.to_string(),
            reg: reg_tx,
            leave: leave_tx,
            broadcast: broadcast_tx,
            meta: meta_tx,
            ua: ua_tx,
            exit: exit_tx,
            is_proxy: false,
            master_node: String::new(),
            proxy: None,
        };

        let now = time_now();
        Self {
            name: name.to_string(),
            x_original: original.to_string(),
            cat,
            created: now,
            updated: now,
            last_id: 0,
            clear_id: 0,
            owner: ZERO_UID,
            access_auth: AccessMode::NONE,
            access_anon: AccessMode::NONE,
            public: None,
            per_user: HashMap::new(),
            per_subs: HashMap::new(),
            sessions: HashMap::new(),
            user_agent: String::new(),
            is_proxy: false,
            master_node: String::new(),
            globals,
            handle,
            rx: TopicReceivers {
                reg: reg_rx,
                leave: leave_rx,
                broadcast: broadcast_rx,
                meta: meta_rx,
                ua: ua_rx,
                exit: exit_rx,
            },
        }
    }

    /// The name this user knows the topic by.
    pub fn original(&self, uid: Uid) -> String {
        if self.cat == TopicCat::P2P {
            if let Some(pud) = self.per_user.get(&uid) {
                return pud.topic_name.clone();
            }
        }
        self.x_original.clone()
    }

    // =================================================================
    // Main loop
    // =================================================================

    pub async fn run(mut self) {
        tracing::debug!(topic = %self.name, "topic started");

        let keep_alive = self.globals.run.topic_timeout;
        let kill_timer = tokio::time::sleep(keep_alive);
        tokio::pin!(kill_timer);
        let mut kill_armed = self.sessions.is_empty();

        let ua_timer = tokio::time::sleep(UA_TIMER);
        tokio::pin!(ua_timer);
        let mut ua_armed = false;
        let mut ua_published = self.user_agent.clone();
        let mut ua_current = self.user_agent.clone();

        loop {
            tokio::select! {
                Some(sreg) = self.rx.reg.recv() => {
                    kill_armed = false;
                    let attached = self.handle_subscription(sreg).await;
                    if !attached && self.sessions.is_empty() {
                        kill_timer.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                        kill_armed = true;
                    }
                }

                Some(leave) = self.rx.leave.recv() => {
                    self.handle_leave(leave).await;
                    if self.sessions.is_empty() {
                        kill_timer.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                        kill_armed = true;
                    }
                }

                Some(msg) = self.rx.broadcast.recv() => {
                    self.handle_broadcast(msg).await;
                }

                Some(meta) = self.rx.meta.recv() => {
                    self.handle_meta(meta).await;
                }

                Some(ua) = self.rx.ua.recv() => {
                    if self.cat == TopicCat::Me && ua != ua_current {
                        ua_current = ua;
                        if !ua_armed {
                            ua_timer.as_mut().reset(tokio::time::Instant::now() + UA_TIMER);
                            ua_armed = true;
                        }
                    }
                }

                Some(sd) = self.rx.exit.recv() => {
                    self.handle_exit(sd).await;
                    return;
                }

                _ = &mut ua_timer, if ua_armed => {
                    ua_armed = false;
                    if ua_current != ua_published {
                        ua_published = ua_current.clone();
                        self.user_agent = ua_current.clone();
                        self.pres_users_of_interest("ua", &ua_current).await;
                    }
                }

                _ = &mut kill_timer, if kill_armed => {
                    tracing::debug!(topic = %self.name, "topic idle timeout");
                    let _ = self.globals.hub.unreg.send(TopicUnreg {
                        topic: self.name.clone(),
                        sess: None,
                        pkt: None,
                        del: false,
                    }).await;
                    match self.cat {
                        TopicCat::Me => {
                            self.pres_users_of_interest("off", &ua_current).await;
                        }
                        TopicCat::Grp => {
                            self.pres_subs_offline("off", &PresParams::default(),
                                AccessMode::NONE, "", false).await;
                        }
                        _ => {} // P2P topics do not announce going offline
                    }
                    return;
                }
            }
        }
    }

    async fn handle_exit(&mut self, sd: ShutDown) {
        match sd.reason {
            StopReason::Deleted => {
                if self.cat == TopicCat::Grp {
                    self.pres_subs_offline(
                        "gone",
                        &PresParams::default(),
                        AccessMode::NONE,
                        "",
                        false,
                    )
                    .await;
                }
            }
            StopReason::Rehashing => {
                // Clients must resubscribe through the new owner.
                self.pres_direct("term").await;
            }
            StopReason::None | StopReason::Shutdown => {}
        }

        let sessions: Vec<SessionRef> = self.sessions.drain().map(|(_, s)| s).collect();
        for sess in sessions {
            sess.detach(&self.name).await;
        }

        if let Some(done) = sd.done {
            let _ = done.send(());
        }
        tracing::debug!(topic = %self.name, reason = ?sd.reason, "topic stopped");
    }

    // =================================================================
    // Subscription join
    // =================================================================

    /// Process a join request end to end. Returns true when the session is
    /// attached.
    async fn handle_subscription(&mut self, sreg: SessionJoin) -> bool {
        let now = time_now();
        let get_what = sreg
            .pkt
            .get
            .as_ref()
            .map(|g| wire::parse_meta_what(&g.what))
            .unwrap_or(0);

        if self.sub_common_reply(&sreg).await.is_err() {
            return false;
        }

        // Attach before acknowledging so follow-up commands route cleanly.
        let sess = sreg.sess.clone();
        self.sessions
            .insert(sess.effective_sid().to_string(), sess.clone());
        let _ = sess
            .ctl
            .send(crate::session::SessionCtl::Attached {
                topic: self.name.clone(),
                handle: self.handle.clone(),
            })
            .await;

        let reply = if sreg.created {
            wire::no_err_created(&sreg.pkt.id, &self.original(sess.uid), now)
        } else {
            wire::no_err(&sreg.pkt.id, &self.original(sess.uid), now)
        };
        let _ = sess.queue_out(&reply).await;

        // A new P2P topic means the other party must be told.
        if sreg.created && self.cat == TopicCat::P2P {
            let inviter = sreg.sess.uid;
            let other = self
                .per_user
                .iter()
                .find(|(uid, _)| **uid != inviter)
                .map(|(uid, pud)| (*uid, pud.clone()));
            if let Some((uid, pud)) = other {
                if !pud.mode_want.is_banned() {
                    let action = if pud.mode_want.is_none() {
                        InviteAction::Join
                    } else {
                        InviteAction::Info
                    };
                    self.route_invite(uid, uid, inviter, action, pud.mode_want, pud.mode_given, None)
                        .await;
                }
            }
        }

        if sreg.loaded {
            match self.cat {
                TopicCat::Me => {
                    if let Err(err) = self.load_contacts(sreg.sess.uid).await {
                        tracing::warn!(topic = %self.name, ?err, "failed to load contacts");
                    }
                    self.pres_users_of_interest("on", &sreg.sess.user_agent).await;
                }
                TopicCat::Grp => {
                    self.pres_subs_offline(
                        "on",
                        &PresParams::default(),
                        AccessMode::NONE,
                        "",
                        false,
                    )
                    .await;
                }
                _ => {}
            }
        }

        if get_what & wire::META_DESC != 0 {
            self.reply_get_desc(&sreg.sess, &sreg.pkt.id, sreg.created).await;
        }
        if get_what & wire::META_SUB != 0 {
            self.reply_get_sub(&sreg.sess, &sreg.pkt.id).await;
        }
        if get_what & wire::META_DATA != 0 {
            let opts = sreg
                .pkt
                .get
                .as_ref()
                .and_then(|g| g.data)
                .unwrap_or_default();
            self.reply_get_data(&sreg.sess, &sreg.pkt.id, opts).await;
        }
        true
    }

    /// Access arbitration and the online bump. The caller acknowledges.
    async fn sub_common_reply(&mut self, sreg: &SessionJoin) -> Result<(), ()> {
        let now = time_now();
        let sess = &sreg.sess;

        let mut mode = String::new();
        let mut info = None;
        if let Some(set) = &sreg.pkt.set {
            if let Some(sub) = &set.sub {
                if !sub.user.is_empty() {
                    let _ = sess
                        .queue_out(&wire::err_malformed(&sreg.pkt.id, &self.original(sess.uid), now))
                        .await;
                    return Err(());
                }
                mode = sub.mode.clone();
                info = sub.info.clone();
            }
        }
        let private = sreg.pkt.set.as_ref().and_then(|s| {
            s.desc
                .as_ref()
                .and_then(|d| if wire::is_null_value(&d.private) { None } else { d.private.clone() })
        });

        self.request_sub(sess, &sreg.pkt.id, &mode, info, private)
            .await?;

        let pud = self.per_user.entry(sess.uid).or_default();
        pud.online += 1;
        let went_online = pud.online == 1;
        if self.cat == TopicCat::Grp && went_online {
            let user = sess.uid.user_id();
            self.pres_subs_online(
                "on",
                &user,
                &PresParams::default(),
                AccessMode::PRES,
                "",
                "",
            )
            .await;
        }

        Ok(())
    }

    /// A user requests or updates their own subscription.
    ///
    /// Cases: first-time subscribe, plain re-join, invite acceptance,
    /// mode change, and ownership-transfer acceptance.
    async fn request_sub(
        &mut self,
        sess: &SessionRef,
        pkt_id: &str,
        want: &str,
        info: Option<Value>,
        private: Option<Value>,
    ) -> Result<(), ()> {
        let now = time_now();
        let original = self.original(sess.uid);

        let mut mode_want = AccessMode::NONE;
        if !want.is_empty() {
            match AccessMode::parse(want) {
                Ok(m) => mode_want = m,
                Err(_) => {
                    let _ = sess.queue_out(&wire::err_malformed(pkt_id, &original, now)).await;
                    return Err(());
                }
            }
            // An explicit subscribe implies the ability to join.
            if !mode_want.is_banned() && !mode_want.is_none() {
                mode_want |= AccessMode::JOIN;
            }
        }
        if mode_want.is_banned() {
            mode_want = AccessMode::BANNED;
        }

        let existing = self.per_user.get(&sess.uid).cloned();
        let user_data = match existing {
            None => {
                // First-time subscription.
                if self.cat == TopicCat::Grp
                    && self.per_user.len() >= self.globals.run.max_subscriber_count
                {
                    let _ = sess.queue_out(&wire::err_policy(pkt_id, &original, now)).await;
                    return Err(());
                }

                let mode_given = select_access_mode(
                    sess.auth_lvl,
                    self.access_anon,
                    self.access_auth,
                    !AccessMode::NONE,
                );
                if mode_want == AccessMode::NONE {
                    mode_want = self.access_auth;
                }

                let user_data = PerUserData {
                    private: private.clone(),
                    mode_given,
                    mode_want,
                    created: Some(now),
                    updated: Some(now),
                    ..Default::default()
                };

                let mut sub = Subscription::new(sess.uid, &self.name, mode_want, mode_given);
                sub.private = private;
                if let Err(err) = self.globals.store.sub_create(&sub).await {
                    if err != StoreError::Duplicate {
                        tracing::warn!(topic = %self.name, ?err, "failed to create subscription");
                        let _ = sess.queue_out(&wire::err_unknown(pkt_id, &original, now)).await;
                        return Err(());
                    }
                }
                user_data
            }
            Some(mut user_data) => {
                let mut upd_want: Option<AccessMode> = None;
                let mut upd_given: Option<AccessMode> = None;
                let mut owner_change = false;

                if mode_want == AccessMode::NONE {
                    mode_want = user_data.mode_want;
                }

                if user_data.mode_given.is_owner() {
                    // The current owner cannot unset ownership or self-ban.
                    if self.owner == sess.uid
                        && (!mode_want.is_owner() || mode_want.is_banned())
                    {
                        let _ = sess.queue_out(&wire::err_malformed(pkt_id, &original, now)).await;
                        return Err(());
                    }

                    // Accepting an ownership transfer.
                    owner_change = mode_want.is_owner() && !user_data.mode_want.is_owner();

                    // The owner may grant themselves anything else.
                    if mode_want.is_owner() && !user_data.mode_given.check(mode_want) {
                        user_data.mode_given |= mode_want;
                        upd_given = Some(user_data.mode_given);
                    }
                } else if mode_want.is_owner() {
                    // Only the owner can initiate a transfer.
                    let _ = sess.queue_out(&wire::err_permission_denied(pkt_id, &original, now)).await;
                    return Err(());
                } else if user_data.mode_given.is_manager() && mode_want.is_manager() {
                    // A sharer may grant themselves anything short of
                    // ownership or a ban.
                    let more = mode_want & !AccessMode::BANNED;
                    if !user_data.mode_given.check(more) {
                        user_data.mode_given |= more;
                        upd_given = Some(user_data.mode_given);
                    }
                }

                // Topic defaults may have changed since the last attempt.
                if user_data.mode_given == AccessMode::NONE
                    && self.access_auth != AccessMode::NONE
                {
                    user_data.mode_given = self.access_auth;
                    upd_given = Some(user_data.mode_given);
                }

                if mode_want == AccessMode::NONE {
                    mode_want = user_data.mode_given;
                }

                if user_data.mode_want != mode_want {
                    user_data.mode_want = mode_want;
                    upd_want = Some(mode_want);
                }

                if upd_want.is_some() || upd_given.is_some() {
                    let upd = SubUpdate {
                        mode_want: upd_want,
                        mode_given: upd_given,
                        ..Default::default()
                    };
                    if let Err(err) = self.globals.store.sub_update(&self.name, sess.uid, upd).await
                    {
                        tracing::warn!(topic = %self.name, ?err, "failed to update subscription");
                        let _ = sess.queue_out(&wire::err_unknown(pkt_id, &original, now)).await;
                        return Err(());
                    }
                }

                if owner_change {
                    let prev = self.owner;
                    if let Some(prev_data) = self.per_user.get_mut(&prev) {
                        prev_data.mode_given &= !AccessMode::OWNER;
                        prev_data.mode_want &= !AccessMode::OWNER;
                        let upd = SubUpdate {
                            mode_want: Some(prev_data.mode_want),
                            mode_given: Some(prev_data.mode_given),
                            ..Default::default()
                        };
                        if let Err(err) = self.globals.store.sub_update(&self.name, prev, upd).await
                        {
                            tracing::warn!(topic = %self.name, ?err, "owner demotion failed");
                            let _ = sess.queue_out(&wire::err_unknown(pkt_id, &original, now)).await;
                            return Err(());
                        }
                    }
                    self.owner = sess.uid;
                }

                user_data
            }
        };

        self.per_user.insert(sess.uid, user_data.clone());

        if mode_want.is_banned() {
            // Self-ban: evict and stop here.
            self.evict_user(sess.uid, false, Some(&sess.sid)).await;
            return Err(());
        }
        if user_data.mode_given.is_banned() {
            let _ = sess.queue_out(&wire::err_permission_denied(pkt_id, &original, now)).await;
            return Err(());
        }

        // Requested more than granted: ask the managers.
        if !user_data.mode_given.check(mode_want) {
            let managers: Vec<Uid> = self
                .per_user
                .iter()
                .filter(|(_, pud)| pud.effective() & AccessMode::SHARE != AccessMode::NONE)
                .map(|(uid, _)| *uid)
                .collect();
            for manager in managers {
                self.route_invite(
                    manager,
                    sess.uid,
                    sess.uid,
                    InviteAction::Appr,
                    mode_want,
                    user_data.mode_given,
                    info.clone(),
                )
                .await;
            }
            let public = self.public.clone();
            self.route_invite(
                sess.uid,
                sess.uid,
                sess.uid,
                InviteAction::Info,
                mode_want,
                user_data.mode_given,
                public,
            )
            .await;
        }

        Ok(())
    }

    /// A manager invites another user or adjusts their granted mode.
    async fn approve_sub(
        &mut self,
        sess: &SessionRef,
        target: Uid,
        set: &ClientSet,
    ) -> Result<(), ()> {
        let now = time_now();
        let original = self.original(sess.uid);

        let requester = self.per_user.get(&sess.uid);
        let is_manager = requester
            .map(|pud| pud.mode_given.is_manager() && pud.mode_want.is_manager())
            .unwrap_or(false);
        if !is_manager {
            let _ = sess.queue_out(&wire::err_permission_denied(&set.id, &original, now)).await;
            return Err(());
        }

        let set_sub = set.query.sub.as_ref().ok_or(())?;
        let mut mode_given = AccessMode::NONE;
        if !set_sub.mode.is_empty() {
            match AccessMode::parse(&set_sub.mode) {
                Ok(m) => mode_given = m,
                Err(_) => {
                    let _ = sess.queue_out(&wire::err_malformed(&set.id, &original, now)).await;
                    return Err(());
                }
            }
        }
        if mode_given.is_banned() {
            mode_given = AccessMode::BANNED;
        }

        // Only the owner hands out ownership.
        if mode_given.is_owner() && self.owner != sess.uid {
            let _ = sess.queue_out(&wire::err_permission_denied(&set.id, &original, now)).await;
            return Err(());
        }

        let mut given_before = AccessMode::NONE;
        let user_data = match self.per_user.get(&target).cloned() {
            None => {
                // Fresh invite; persists as a subscription with want=N.
                if mode_given == AccessMode::NONE {
                    if self.access_auth != AccessMode::NONE {
                        mode_given = self.access_auth;
                    } else {
                        let _ = sess.queue_out(&wire::err_malformed(&set.id, &original, now)).await;
                        return Err(());
                    }
                }
                if self.cat == TopicCat::Grp
                    && self.per_user.len() >= self.globals.run.max_subscriber_count
                {
                    let _ = sess.queue_out(&wire::err_policy(&set.id, &original, now)).await;
                    return Err(());
                }

                let sub = Subscription::new(target, &self.name, AccessMode::NONE, mode_given);
                if let Err(err) = self.globals.store.sub_create(&sub).await {
                    tracing::warn!(topic = %self.name, ?err, "failed to create invite");
                    let _ = sess.queue_out(&wire::err_unknown(&set.id, &original, now)).await;
                    return Err(());
                }

                let user_data = PerUserData {
                    mode_given,
                    mode_want: AccessMode::NONE,
                    created: Some(now),
                    updated: Some(now),
                    ..Default::default()
                };
                self.per_user.insert(target, user_data.clone());
                user_data
            }
            Some(mut user_data) => {
                given_before = user_data.mode_given;
                if mode_given == AccessMode::NONE {
                    // Re-send the invite without changing anything.
                    mode_given = user_data.mode_given;
                } else if mode_given != user_data.mode_given {
                    user_data.mode_given = mode_given;
                    let upd = SubUpdate {
                        mode_given: Some(mode_given),
                        ..Default::default()
                    };
                    if let Err(err) = self.globals.store.sub_update(&self.name, target, upd).await {
                        tracing::warn!(topic = %self.name, ?err, "failed to update invite");
                        let _ = sess.queue_out(&wire::err_unknown(&set.id, &original, now)).await;
                        return Err(());
                    }
                    self.per_user.insert(target, user_data.clone());
                }
                user_data
            }
        };

        if user_data.mode_want.is_banned() {
            // The target does not want to be bothered.
            let _ = sess.queue_out(&wire::err_permission_denied(&set.id, &original, now)).await;
            return Err(());
        }

        if mode_given.is_banned() {
            // A ban also cuts the target loose immediately.
            self.evict_user(target, false, None).await;
        } else if user_data.mode_want.is_none() {
            self.route_invite(
                target,
                target,
                sess.uid,
                InviteAction::Join,
                user_data.mode_want,
                mode_given,
                set_sub.info.clone(),
            )
            .await;
        } else if given_before != mode_given {
            self.route_invite(
                target,
                target,
                sess.uid,
                InviteAction::Info,
                user_data.mode_want,
                mode_given,
                set_sub.info.clone(),
            )
            .await;
        }

        if given_before != mode_given {
            // Tell the requester what changed.
            self.route_invite(
                sess.uid,
                target,
                sess.uid,
                InviteAction::Info,
                user_data.mode_want,
                mode_given,
                Some(json!({"before": given_before.to_string()})),
            )
            .await;
        }

        let _ = sess.queue_out(&wire::no_err(&set.id, &original, now)).await;
        Ok(())
    }

    /// Send an invite/approval/info message to `notify`'s `me` topic.
    async fn route_invite(
        &self,
        notify: Uid,
        target: Uid,
        from: Uid,
        act: InviteAction,
        want: AccessMode,
        given: AccessMode,
        info: Option<Value>,
    ) {
        let content = json!({
            "topic": self.name,
            "user": target.user_id(),
            "action": act.as_str(),
            "acs": {"want": want.to_string(), "given": given.to_string()},
            "info": info,
        });
        let msg = ServerMessage {
            data: Some(wire::ServerData {
                topic: "me".to_string(),
                from: from.user_id(),
                ts: time_now(),
                seq_id: 0,
                head: None,
                content: Some(content),
            }),
            rcpt_to: notify.user_id(),
            as_user: from.user_id(),
            ..Default::default()
        };
        if self.globals.hub.route.send(Box::new(msg)).await.is_err() {
            tracing::warn!(topic = %self.name, "hub route channel closed");
        }
    }

    // =================================================================
    // Leave
    // =================================================================

    async fn handle_leave(&mut self, leave: SessionLeave) {
        let now = time_now();
        let sess = &leave.sess;

        if leave.unsub {
            if let Err(err) = self.globals.store.sub_delete(&self.name, sess.uid).await {
                if err != StoreError::NotFound {
                    tracing::warn!(topic = %self.name, ?err, "failed to delete subscription");
                    if !leave.id.is_empty() {
                        let _ = sess
                            .queue_out(&wire::err_unknown(&leave.id, &leave.topic, now))
                            .await;
                    }
                    return;
                }
            }
            self.evict_user(sess.uid, true, Some(&sess.sid)).await;

            // The user's other sessions learn the subscription is gone.
            crate::presence::pres_single_user_offline_offline(
                &self.globals,
                sess.uid,
                &self.original(sess.uid),
                "gone",
                &PresParams::default(),
                &sess.sid,
            )
            .await;
            if self.cat == TopicCat::P2P {
                if let Some((other, _)) = self.per_user.iter().find(|(uid, _)| **uid != sess.uid) {
                    crate::presence::pres_single_user_offline_offline(
                        &self.globals,
                        *other,
                        &sess.uid.user_id(),
                        "off+rem",
                        &PresParams::default(),
                        "",
                    )
                    .await;
                }
            }
        } else {
            self.sessions.remove(sess.effective_sid());
            let went_offline = {
                let pud = self.per_user.entry(sess.uid).or_default();
                pud.online = pud.online.saturating_sub(1);
                pud.online == 0
            };
            if self.cat == TopicCat::Me {
                // Remember when and from what agent the user was last seen.
                let upd = crate::store::types::UserUpdate {
                    last_seen: Some((now, sess.user_agent.clone())),
                    ..Default::default()
                };
                if let Err(err) = self.globals.store.user_update(sess.uid, upd).await {
                    tracing::warn!(?err, "failed to update last seen");
                }
            } else if self.cat == TopicCat::Grp && went_offline {
                let user = sess.uid.user_id();
                self.pres_subs_online(
                    "off",
                    &user,
                    &PresParams::default(),
                    AccessMode::PRES,
                    "",
                    "",
                )
                .await;
            }
        }

        if !leave.id.is_empty() {
            let _ = sess.queue_out(&wire::no_err(&leave.id, &leave.topic, now)).await;
        }
    }

    /// Detach every session of a user; optionally forget the user entirely.
    pub(crate) async fn evict_user(&mut self, uid: Uid, clear: bool, ignore_sid: Option<&str>) {
        let now = time_now();
        let note = wire::no_err_evicted("", &self.original(uid), now);

        if clear {
            self.per_user.remove(&uid);
        } else if let Some(pud) = self.per_user.get_mut(&uid) {
            pud.online = 0;
        }

        if self.cat == TopicCat::Grp {
            let user = uid.user_id();
            self.pres_subs_online("off", &user, &PresParams::default(), AccessMode::PRES, "", "")
                .await;
        }

        let victims: Vec<SessionRef> = self
            .sessions
            .values()
            .filter(|s| s.uid == uid)
            .cloned()
            .collect();
        for sess in victims {
            self.sessions.remove(sess.effective_sid());
            sess.detach(&self.name).await;
            if Some(sess.sid.as_str()) != ignore_sid {
                let _ = sess.queue_out(&note).await;
            }
        }
    }

    // =================================================================
    // Broadcast: {data}, {pres}, {info}
    // =================================================================

    async fn handle_broadcast(&mut self, msg: Box<ServerMessage>) {
        if msg.data.is_some() {
            self.handle_data(*msg).await;
        } else if msg.pres.is_some() {
            self.handle_pres(*msg).await;
        } else if msg.info.is_some() {
            self.handle_info(*msg).await;
        } else {
            tracing::warn!(topic = %self.name, kind = msg.describe(),
                "wrong message type for broadcasting");
        }
    }

    async fn handle_data(&mut self, mut msg: ServerMessage) {
        let now = time_now();
        let data = msg.data.as_mut().expect("checked by handle_broadcast");
        let from = parse_user_id(&data.from);

        // Client-originated messages must hold the write bit; internal ones
        // (invites) bypass the check.
        if let Some(sess) = &msg.sess {
            let allowed = self
                .per_user
                .get(&from)
                .map(|pud| pud.effective().can_pub())
                .unwrap_or(false);
            if !allowed {
                let _ = sess
                    .queue_out(&wire::err_permission_denied(&msg.id, &self.original(from), now))
                    .await;
                return;
            }
        }

        let seq = self.last_id + 1;
        let stored = Message {
            topic: self.name.clone(),
            seq_id: seq,
            created_at: data.ts,
            from,
            head: data.head.clone(),
            content: data.content.clone(),
        };
        if let Err(err) = self.globals.store.message_save(&stored).await {
            tracing::warn!(topic = %self.name, ?err, "message save failed");
            if let Some(sess) = &msg.sess {
                let _ = sess
                    .queue_out(&wire::err_unknown(&msg.id, &self.original(from), now))
                    .await;
            }
            return;
        }
        if let Err(err) = self.globals.store.topic_update_on_message(&self.name, &stored).await {
            tracing::warn!(topic = %self.name, ?err, "seq bump failed");
        }

        self.last_id = seq;
        data.seq_id = seq;

        if !msg.id.is_empty() {
            if let Some(sess) = &msg.sess {
                let _ = sess
                    .queue_out(&wire::no_err_accepted_params(
                        &msg.id,
                        &self.original(from),
                        now,
                        json!({"seq": seq}),
                    ))
                    .await;
            }
        }

        self.fanout_data(&msg).await;
        self.pres_pub_message_sent(from, seq, &msg.skip_sid).await;
        self.send_push_receipt(&msg, from, seq).await;
    }

    /// Serialize once, deliver to each attached reader except the skipped
    /// session. P2P reserializes per receiver because the topic label
    /// differs.
    async fn fanout_data(&mut self, msg: &ServerMessage) {
        let targets: Vec<SessionRef> = self.sessions.values().cloned().collect();

        let shared = if self.cat == TopicCat::P2P {
            None
        } else {
            match serde_json::to_string(msg) {
                Ok(s) => Some(Arc::new(s)),
                Err(err) => {
                    tracing::error!(topic = %self.name, ?err, "fanout serialization failed");
                    return;
                }
            }
        };

        for sess in targets {
            if !msg.skip_sid.is_empty() && sess.sid == msg.skip_sid {
                continue;
            }
            // Proxied sessions are admitted by the master and filtered at
            // the proxy; local ones must be able to read.
            if sess.proto != crate::session::SessionProto::Cluster {
                let ok = self
                    .per_user
                    .get(&sess.uid)
                    .map(|pud| pud.effective().can_read())
                    .unwrap_or(false);
                if !ok {
                    continue;
                }
            }

            let delivered = match (&shared, self.cat) {
                (Some(bytes), _) if sess.proto != crate::session::SessionProto::Cluster => {
                    sess.queue_out_bytes(bytes.clone()).await
                }
                _ => {
                    let mut per_sess = msg.clone();
                    if let Some(data) = per_sess.data.as_mut() {
                        if self.cat == TopicCat::P2P {
                            data.topic = self.original(sess.uid);
                        }
                    }
                    per_sess.sess = None;
                    sess.queue_out(&per_sess).await
                }
            };
            if !delivered {
                tracing::warn!(topic = %self.name, sid = %sess.sid, "fanout message dropped");
            }
        }
    }

    /// Build and hand off the per-user push receipt for one data message.
    async fn send_push_receipt(&self, msg: &ServerMessage, from: Uid, seq: u64) {
        let recipients: Vec<Uid> = self
            .per_user
            .iter()
            .filter(|(uid, pud)| **uid != from && !pud.effective().is_banned())
            .map(|(uid, _)| *uid)
            .collect();
        if recipients.is_empty() {
            return;
        }

        let devices: HashMap<Uid, Vec<String>> = match self
            .globals
            .store
            .device_get_all(&recipients)
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|(uid, devs)| (uid, devs.into_iter().map(|d| d.device_id).collect()))
                .collect(),
            Err(err) => {
                tracing::warn!(topic = %self.name, ?err, "device lookup failed");
                HashMap::new()
            }
        };

        let mut to = HashMap::new();
        for uid in recipients {
            let pud = &self.per_user[&uid];
            to.insert(
                uid,
                Recipient {
                    delivered: pud.online as usize,
                    devices: devices.get(&uid).cloned().unwrap_or_default(),
                    unread: self.last_id.saturating_sub(pud.recv_id),
                },
            );
        }

        let content = msg.data.as_ref().and_then(|d| d.content.clone());
        self.globals
            .push_receipt(Receipt {
                payload: push::Payload {
                    what: push::ACT_MSG.to_string(),
                    silent: false,
                    topic: self.x_original.clone(),
                    ts: time_now(),
                    from: from.user_id(),
                    seq_id: seq,
                    content,
                },
                to,
            })
            .await;
    }

    async fn handle_pres(&mut self, mut msg: ServerMessage) {
        let (what, src, want_reply) = {
            let pres = msg.pres.as_ref().expect("checked by handle_broadcast");
            (pres.what.clone(), pres.src.clone(), pres.want_reply)
        };

        let base = what.split('+').next().unwrap_or("");
        if matches!(base, "on" | "off" | "gone" | "?unkn") {
            let filtered = self.pres_proc_req(&src, &what, want_reply).await;
            if filtered.is_empty() {
                return;
            }
            if let Some(pres) = msg.pres.as_mut() {
                pres.what = filtered;
            }
        }

        // A status report addressed to this topic but labeled for another
        // surface is consumed, never forwarded.
        let label = msg.pres.as_ref().map(|p| p.topic.clone()).unwrap_or_default();
        if self.cat != TopicCat::Me && label == "me" {
            return;
        }
        if self.cat == TopicCat::Me && label != "me" {
            return;
        }

        self.fanout_pres(&msg).await;
    }

    async fn fanout_pres(&mut self, msg: &ServerMessage) {
        let pres = match msg.pres.as_ref() {
            Some(p) => p,
            None => return,
        };
        let targets: Vec<SessionRef> = self.sessions.values().cloned().collect();

        for sess in targets {
            if !msg.skip_sid.is_empty() && sess.sid == msg.skip_sid {
                continue;
            }
            if pres.skip_sids.iter().any(|sid| *sid == sess.sid) {
                continue;
            }
            if !pres.single_user.is_empty() && sess.uid.user_id() != pres.single_user {
                continue;
            }
            if sess.proto != crate::session::SessionProto::Cluster {
                let mode = self
                    .per_user
                    .get(&sess.uid)
                    .map(|pud| pud.effective())
                    .unwrap_or(AccessMode::NONE);
                if !mode.is_presencer() {
                    continue;
                }
                if pres.filter != AccessMode::NONE && (mode & pres.filter) == AccessMode::NONE {
                    continue;
                }
            }

            let mut per_sess = msg.clone();
            if self.cat == TopicCat::P2P {
                if let Some(p) = per_sess.pres.as_mut() {
                    p.topic = self.original(sess.uid);
                }
            }
            per_sess.sess = None;
            let _ = sess.queue_out(&per_sess).await;
        }
    }

    async fn handle_info(&mut self, msg: ServerMessage) {
        let info = msg.info.as_ref().expect("checked by handle_broadcast");
        let from = parse_user_id(&info.from);

        match info.what.as_str() {
            "kp" => {}
            "recv" | "read" => {
                // Reports above the watermark are garbage; stale ones are
                // idempotent no-ops.
                if info.seq_id > self.last_id {
                    return;
                }
                let Some(pud) = self.per_user.get_mut(&from) else {
                    return;
                };

                let mut upd = SubUpdate::default();
                if info.what == "read" {
                    if info.seq_id <= pud.read_id {
                        return;
                    }
                    pud.read_id = info.seq_id;
                    upd.read_seq_id = Some(pud.read_id);
                    if pud.recv_id < pud.read_id {
                        pud.recv_id = pud.read_id;
                        upd.recv_seq_id = Some(pud.recv_id);
                    }
                } else {
                    if info.seq_id <= pud.recv_id {
                        return;
                    }
                    pud.recv_id = info.seq_id;
                    upd.recv_seq_id = Some(pud.recv_id);
                }

                if let Err(err) = self.globals.store.sub_update(&self.name, from, upd).await {
                    tracing::warn!(topic = %self.name, ?err, "failed to persist read state");
                    return;
                }

                // Mirror to the user's other sessions through 'me'.
                self.pres_pub_message_count(from, &info.what, info.seq_id, &msg.skip_sid)
                    .await;
            }
            _ => return,
        }

        let targets: Vec<SessionRef> = self.sessions.values().cloned().collect();
        for sess in targets {
            if !msg.skip_sid.is_empty() && sess.sid == msg.skip_sid {
                continue;
            }
            if sess.proto != crate::session::SessionProto::Cluster {
                let ok = self
                    .per_user
                    .get(&sess.uid)
                    .map(|pud| pud.effective().can_read())
                    .unwrap_or(false);
                if !ok {
                    continue;
                }
            }
            let mut per_sess = msg.clone();
            if let Some(i) = per_sess.info.as_mut() {
                i.topic = self.original(sess.uid);
            }
            per_sess.sess = None;
            let _ = sess.queue_out(&per_sess).await;
        }
    }

    // =================================================================
    // Meta: {get}, {set}, {del}
    // =================================================================

    async fn handle_meta(&mut self, meta: MetaReq) {
        match meta.action {
            MetaAction::Get(what) => {
                let get = meta.pkt.get.clone().unwrap_or_default();
                if what & wire::META_DESC != 0 {
                    self.reply_get_desc(&meta.sess, &get.id, false).await;
                }
                if what & wire::META_SUB != 0 {
                    self.reply_get_sub(&meta.sess, &get.id).await;
                }
                if what & wire::META_DATA != 0 {
                    let opts = get.query.data.unwrap_or_default();
                    self.reply_get_data(&meta.sess, &get.id, opts).await;
                }
            }
            MetaAction::Set(what) => {
                let Some(set) = meta.pkt.set.clone() else { return };
                if what & (wire::META_DESC | wire::META_TAGS) != 0 {
                    self.reply_set_desc(&meta.sess, &set).await;
                }
                if what & wire::META_SUB != 0 {
                    self.reply_set_sub(&meta.sess, &set).await;
                }
            }
            MetaAction::Del(DelWhat::Msg) => {
                let Some(del) = meta.pkt.del.clone() else { return };
                self.reply_del_msg(&meta.sess, &del).await;
            }
            MetaAction::Del(DelWhat::Topic) => {
                let Some(del) = meta.pkt.del.clone() else { return };
                self.reply_del_topic(&meta.sess, &del).await;
            }
        }
    }

    async fn reply_get_desc(&mut self, sess: &SessionRef, id: &str, created: bool) {
        let now = time_now();
        let pud = self.per_user.get(&sess.uid);

        let mut desc = TopicDesc {
            created: Some(self.created),
            updated: Some(self.updated),
            ..Default::default()
        };

        desc.public = match (&self.public, pud) {
            (Some(public), _) => Some(public.clone()),
            (None, Some(pud)) => pud.public.clone(),
            _ => None,
        };

        if let Some(pud) = pud {
            if pud.effective() & AccessMode::SHARE != AccessMode::NONE {
                desc.default_acs = Some(wire::DefaultAcsMode {
                    auth: Some(self.access_auth.to_string()),
                    anon: Some(self.access_anon.to_string()),
                });
            }
            desc.acs = Some(AccessModeMsg {
                want: pud.mode_want.to_string(),
                given: pud.mode_given.to_string(),
                mode: pud.effective().to_string(),
            });
            desc.seq_id = self.last_id;
            desc.read_seq_id = pud.read_id.max(self.clear_id);
            desc.recv_seq_id = pud.recv_id.max(pud.read_id);
            desc.clear_id = pud.clear_id.max(self.clear_id);
            desc.private = pud.private.clone();
            if created {
                desc.name = self.name.clone();
            }
        }

        let reply = ServerMessage {
            meta: Some(wire::ServerMeta {
                id: id.to_string(),
                topic: self.original(sess.uid),
                ts: Some(now),
                desc: Some(desc),
                sub: None,
                tags: None,
            }),
            ..Default::default()
        };
        let _ = sess.queue_out(&reply).await;
    }

    async fn reply_get_sub(&mut self, sess: &SessionRef, id: &str) {
        let now = time_now();
        let original = self.original(sess.uid);

        let mut rows: Vec<TopicSubMsg> = Vec::new();

        if self.cat == TopicCat::Me {
            let subs = match self.globals.store.subs_for_user(sess.uid, QueryOpt::default()).await {
                Ok(subs) => subs,
                Err(err) => {
                    tracing::warn!(topic = %self.name, ?err, "failed to load subscriptions");
                    let _ = sess.queue_out(&wire::err_unknown(id, &original, now)).await;
                    return;
                }
            };
            for sub in subs {
                if sub.topic == self.name {
                    continue;
                }
                let mut row = TopicSubMsg {
                    topic: sub.topic.clone(),
                    updated: Some(sub.times.updated_at),
                    acs: AccessModeMsg {
                        mode: sub.effective().to_string(),
                        want: sub.mode_want.to_string(),
                        given: sub.mode_given.to_string(),
                    },
                    read_seq_id: sub.read_seq_id,
                    recv_seq_id: sub.recv_seq_id,
                    clear_id: sub.clear_id,
                    private: sub.private.clone(),
                    ..Default::default()
                };
                if let Ok(Some(topic)) = self.globals.store.topic_get(&sub.topic).await {
                    row.seq_id = topic.seq_id;
                }
                // P2P rows carry the other party's last-seen info.
                if let Some((u1, u2)) = palaver_common::uid::parse_p2p(&sub.topic) {
                    let other = if u1 == sess.uid { u2 } else { u1 };
                    if let Ok(Some(user)) = self.globals.store.user_get(other).await {
                        row.public = user.public.clone();
                        if let Some(when) = user.last_seen {
                            row.last_seen = Some(wire::LastSeenInfo {
                                when: Some(when),
                                user_agent: user.user_agent.clone(),
                            });
                        }
                    }
                }
                rows.push(row);
            }
        } else {
            let is_sharer = self
                .per_user
                .get(&sess.uid)
                .map(|pud| pud.effective().is_manager())
                .unwrap_or(false);
            for (uid, pud) in &self.per_user {
                let mut row = TopicSubMsg {
                    user: uid.user_id(),
                    updated: pud.updated,
                    acs: AccessModeMsg {
                        mode: pud.effective().to_string(),
                        ..Default::default()
                    },
                    read_seq_id: pud.read_id,
                    recv_seq_id: pud.recv_id,
                    public: pud.public.clone(),
                    ..Default::default()
                };
                if is_sharer {
                    row.acs.want = pud.mode_want.to_string();
                    row.acs.given = pud.mode_given.to_string();
                }
                if self.cat == TopicCat::Grp {
                    row.online = if pud.online > 0 { "on" } else { "off" }.to_string();
                }
                if *uid == sess.uid {
                    row.private = pud.private.clone();
                }
                rows.push(row);
            }
            rows.sort_by(|a, b| a.user.cmp(&b.user));
        }

        let reply = ServerMessage {
            meta: Some(wire::ServerMeta {
                id: id.to_string(),
                topic: original,
                ts: Some(now),
                desc: None,
                sub: if rows.is_empty() { None } else { Some(rows) },
                tags: None,
            }),
            ..Default::default()
        };
        let _ = sess.queue_out(&reply).await;
    }

    async fn reply_get_data(&mut self, sess: &SessionRef, id: &str, opts: wire::GetOpts) {
        let now = time_now();
        let original = self.original(sess.uid);

        let can_read = self
            .per_user
            .get(&sess.uid)
            .map(|pud| pud.effective().can_read())
            .unwrap_or(false);
        if !can_read {
            let _ = sess.queue_out(&wire::err_permission_denied(id, &original, now)).await;
            return;
        }

        let query = QueryOpt {
            since: opts.since,
            before: opts.before,
            limit: opts.limit,
        };
        let messages = match self.globals.store.message_get_all(&self.name, sess.uid, query).await
        {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(topic = %self.name, ?err, "failed to load messages");
                let _ = sess.queue_out(&wire::err_unknown(id, &original, now)).await;
                return;
            }
        };

        let count = messages.len();
        for mm in messages {
            let reply = ServerMessage {
                data: Some(wire::ServerData {
                    topic: original.clone(),
                    from: mm.from.user_id(),
                    ts: mm.created_at,
                    seq_id: mm.seq_id,
                    head: mm.head,
                    content: mm.content,
                }),
                ..Default::default()
            };
            let _ = sess.queue_out(&reply).await;
        }

        let _ = sess
            .queue_out(&wire::no_err_params(id, &original, now, json!({"count": count})))
            .await;
    }

    async fn reply_set_desc(&mut self, sess: &SessionRef, set: &ClientSet) {
        let now = time_now();
        let original = self.original(sess.uid);
        let mut changes = 0usize;

        if let Some(desc) = set.query.desc.as_ref() {
            match self.cat {
                TopicCat::Me => {
                    let mut upd = crate::store::types::UserUpdate::default();
                    if let Some(defacs) = &desc.default_acs {
                        match parse_default_access(defacs, AccessMode::P2P) {
                            Ok(access) => upd.access = Some(access),
                            Err(()) => {
                                let _ = sess
                                    .queue_out(&wire::err_malformed(&set.id, &original, now))
                                    .await;
                                return;
                            }
                        }
                    }
                    if desc.public.is_some() {
                        let value = if wire::is_null_value(&desc.public) {
                            None
                        } else {
                            desc.public.clone()
                        };
                        self.public = value.clone();
                        upd.public = Some(value);
                    }
                    if upd.access.is_some() || upd.public.is_some() {
                        if let Err(err) = self.globals.store.user_update(sess.uid, upd).await {
                            tracing::warn!(?err, "user update failed");
                            let _ = sess.queue_out(&wire::err_unknown(&set.id, &original, now)).await;
                            return;
                        }
                        changes += 1;
                    }
                }
                TopicCat::Fnd => {
                    // 'fnd' treats public as the user's discovery tags.
                    if let Some(Value::Array(tags)) = &desc.public {
                        let tags: Vec<String> = tags
                            .iter()
                            .filter_map(|t| t.as_str().map(str::to_string))
                            .take(self.globals.run.max_tag_count)
                            .collect();
                        let upd = crate::store::types::UserUpdate {
                            tags: Some(tags),
                            ..Default::default()
                        };
                        if let Err(err) = self.globals.store.user_update(sess.uid, upd).await {
                            tracing::warn!(?err, "tag update failed");
                            let _ = sess.queue_out(&wire::err_unknown(&set.id, &original, now)).await;
                            return;
                        }
                        changes += 1;
                    }
                }
                TopicCat::Grp if self.owner == sess.uid => {
                    let mut upd = crate::store::types::TopicUpdate::default();
                    if let Some(defacs) = &desc.default_acs {
                        match parse_default_access(defacs, !AccessMode::OWNER) {
                            Ok(access) => {
                                self.access_auth = access.auth;
                                self.access_anon = access.anon;
                                upd.access = Some(access);
                            }
                            Err(()) => {
                                let _ = sess
                                    .queue_out(&wire::err_malformed(&set.id, &original, now))
                                    .await;
                                return;
                            }
                        }
                    }
                    if desc.public.is_some() {
                        let value = if wire::is_null_value(&desc.public) {
                            None
                        } else {
                            desc.public.clone()
                        };
                        self.public = value.clone();
                        upd.public = Some(value);
                    }
                    if upd.access.is_some() || upd.public.is_some() {
                        if let Err(err) = self.globals.store.topic_update(&self.name, upd).await {
                            tracing::warn!(?err, "topic update failed");
                            let _ = sess.queue_out(&wire::err_unknown(&set.id, &original, now)).await;
                            return;
                        }
                        changes += 1;
                    }
                }
                _ => {}
            }

            if desc.private.is_some() {
                let value = if wire::is_null_value(&desc.private) {
                    None
                } else {
                    desc.private.clone()
                };
                let upd = SubUpdate {
                    private: Some(value.clone().unwrap_or(Value::Null)),
                    ..Default::default()
                };
                if let Err(err) = self.globals.store.sub_update(&self.name, sess.uid, upd).await {
                    tracing::warn!(?err, "private update failed");
                    let _ = sess.queue_out(&wire::err_unknown(&set.id, &original, now)).await;
                    return;
                }
                if let Some(pud) = self.per_user.get_mut(&sess.uid) {
                    pud.private = value;
                }
                changes += 1;
            }
        }

        if let Some(tags) = set.query.tags.as_ref() {
            let tags: Vec<String> = tags
                .iter()
                .filter(|t| !t.is_empty())
                .take(self.globals.run.max_tag_count)
                .cloned()
                .collect();
            let applied = match self.cat {
                TopicCat::Me | TopicCat::Fnd => {
                    let upd = crate::store::types::UserUpdate {
                        tags: Some(tags),
                        ..Default::default()
                    };
                    self.globals.store.user_update(sess.uid, upd).await
                }
                TopicCat::Grp if self.owner == sess.uid => {
                    let upd = crate::store::types::TopicUpdate {
                        tags: Some(tags),
                        ..Default::default()
                    };
                    self.globals.store.topic_update(&self.name, upd).await
                }
                _ => Err(StoreError::NotFound),
            };
            match applied {
                Ok(()) => changes += 1,
                Err(err) => {
                    tracing::debug!(?err, "tag update rejected");
                }
            }
        }

        if changes == 0 {
            let _ = sess.queue_out(&wire::err_malformed(&set.id, &original, now)).await;
            return;
        }

        self.updated = now;
        let _ = sess.queue_out(&wire::no_err(&set.id, &original, now)).await;
    }

    async fn reply_set_sub(&mut self, sess: &SessionRef, set: &ClientSet) {
        let now = time_now();
        let Some(set_sub) = set.query.sub.as_ref() else {
            return;
        };

        let target = if set_sub.user.is_empty() {
            sess.uid
        } else {
            let uid = parse_user_id(&set_sub.user);
            if uid.is_zero() {
                let _ = sess
                    .queue_out(&wire::err_malformed(&set.id, &self.original(sess.uid), now))
                    .await;
                return;
            }
            uid
        };

        if target == sess.uid {
            if self
                .request_sub(sess, &set.id, &set_sub.mode, set_sub.info.clone(), None)
                .await
                .is_ok()
            {
                let _ = sess
                    .queue_out(&wire::no_err(&set.id, &self.original(sess.uid), now))
                    .await;
            }
        } else {
            let _ = self.approve_sub(sess, target, set).await;
        }
    }

    async fn reply_del_msg(&mut self, sess: &SessionRef, del: &wire::ClientDel) {
        let now = time_now();
        let original = self.original(sess.uid);

        let before = del.before.unwrap_or(0).min(self.last_id);
        if before == 0 {
            let _ = sess.queue_out(&wire::err_malformed(&del.id, &original, now)).await;
            return;
        }

        let mode = self
            .per_user
            .get(&sess.uid)
            .map(|pud| pud.effective())
            .unwrap_or(AccessMode::NONE);

        if del.hard {
            if !mode.can_delete() {
                let _ = sess
                    .queue_out(&wire::err_permission_denied(&del.id, &original, now))
                    .await;
                return;
            }
            let req = DelMessage {
                topic: self.name.clone(),
                for_user: ZERO_UID,
                before,
            };
            if let Err(err) = self.globals.store.message_delete_list(&req).await {
                tracing::warn!(topic = %self.name, ?err, "hard delete failed");
                let _ = sess.queue_out(&wire::err_unknown(&del.id, &original, now)).await;
                return;
            }
            self.clear_id = self.clear_id.max(before);

            let params = PresParams {
                clear_id: before,
                actor: sess.uid.user_id(),
                ..Default::default()
            };
            let src = sess.uid.user_id();
            self.pres_subs_online("del", &src, &params, AccessMode::READ, &sess.sid, "")
                .await;
            self.pres_subs_offline("del", &params, AccessMode::READ, &sess.sid, true)
                .await;
        } else {
            let req = DelMessage {
                topic: self.name.clone(),
                for_user: sess.uid,
                before,
            };
            if let Err(err) = self.globals.store.message_delete_list(&req).await {
                tracing::warn!(topic = %self.name, ?err, "soft delete failed");
                let _ = sess.queue_out(&wire::err_unknown(&del.id, &original, now)).await;
                return;
            }
            if let Some(pud) = self.per_user.get_mut(&sess.uid) {
                pud.clear_id = pud.clear_id.max(before);
            }
            let params = PresParams {
                clear_id: before,
                ..Default::default()
            };
            self.pres_single_user_offline(sess.uid, "del", &params, &sess.sid, true)
                .await;
        }

        let _ = sess.queue_out(&wire::no_err(&del.id, &original, now)).await;
    }

    /// Online topic deletion. The hub already verified nothing; ownership
    /// is checked here where it is known.
    async fn reply_del_topic(&mut self, sess: &SessionRef, del: &wire::ClientDel) {
        let now = time_now();
        let original = self.original(sess.uid);

        let is_owner = self.owner == sess.uid;
        let last_p2p_sub = self.cat == TopicCat::P2P && self.per_user.len() < 2;

        if is_owner || last_p2p_sub {
            if let Err(err) = self.globals.store.topic_delete(&self.name).await {
                tracing::warn!(topic = %self.name, ?err, "topic delete failed");
                let _ = sess.queue_out(&wire::err_unknown(&del.id, &original, now)).await;
                return;
            }
            let _ = sess.queue_out(&wire::no_err(&del.id, &original, now)).await;

            if self.cat == TopicCat::Grp {
                self.pres_subs_offline(
                    "gone",
                    &PresParams::default(),
                    AccessMode::NONE,
                    &sess.sid,
                    false,
                )
                .await;
            }

            let uids: Vec<Uid> = self.per_user.keys().copied().collect();
            for uid in uids {
                self.evict_user(uid, true, Some(&sess.sid)).await;
            }

            // Ask the hub to forget this topic; the exit signal follows.
            let _ = self
                .globals
                .hub
                .unreg
                .send(TopicUnreg {
                    topic: self.name.clone(),
                    sess: None,
                    pkt: None,
                    del: false,
                })
                .await;
        } else {
            // Not the owner: degrade to "leave with unsubscribe".
            if let Err(err) = self.globals.store.sub_delete(&self.name, sess.uid).await {
                if err != StoreError::NotFound {
                    tracing::warn!(topic = %self.name, ?err, "unsubscribe failed");
                    let _ = sess.queue_out(&wire::err_unknown(&del.id, &original, now)).await;
                    return;
                }
            }
            self.evict_user(sess.uid, true, Some(&sess.sid)).await;
            let _ = sess.queue_out(&wire::no_err(&del.id, &original, now)).await;
        }
    }
}

/// Parse a client-supplied default-access pair, clipping to `mask`.
/// Owner bits in defaults are rejected upstream by passing a mask without O.
pub fn parse_default_access(
    acs: &wire::DefaultAcsMode,
    mask: AccessMode,
) -> Result<crate::store::types::DefaultAccess, ()> {
    let mut access = crate::store::types::DefaultAccess::default();
    if let Some(auth) = &acs.auth {
        access.auth = AccessMode::parse(auth).map_err(|_| ())? & mask;
    }
    if let Some(anon) = &acs.anon {
        access.anon = AccessMode::parse(anon).map_err(|_| ())? & mask;
    }
    Ok(access)
}

// ---------------------------------------------------------------------------
// Proxy topic: a thin shim forwarding everything to the master node
// ---------------------------------------------------------------------------

impl Topic {
    /// Run loop of a proxy topic. All state lives at the master; this loop
    /// forwards requests and delivers responses to local sessions.
    pub async fn run_proxy(mut self, mut proxy_rx: mpsc::Receiver<ClusterResp>) {
        tracing::debug!(topic = %self.name, master = %self.master_node, "proxy topic started");

        let keep_alive = self.globals.run.topic_timeout;
        let kill_timer = tokio::time::sleep(keep_alive);
        tokio::pin!(kill_timer);
        let mut kill_armed = true;

        loop {
            tokio::select! {
                Some(sreg) = self.rx.reg.recv() => {
                    kill_armed = false;
                    let sess = sreg.sess.clone();
                    self.sessions.insert(sess.sid.clone(), sess.clone());
                    let _ = sess.ctl.send(crate::session::SessionCtl::Attached {
                        topic: self.name.clone(),
                        handle: self.handle.clone(),
                    }).await;

                    if let Err(err) = self.globals.forward_join_to_master(&self.name, &sreg).await {
                        tracing::warn!(topic = %self.name, ?err, "join forward failed");
                        let _ = sess.queue_out(&wire::err_cluster_unreachable(
                            &sreg.pkt.id, &sreg.pkt.topic, time_now())).await;
                        self.sessions.remove(&sess.sid);
                        sess.detach(&self.name).await;
                        if self.sessions.is_empty() {
                            kill_timer.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                            kill_armed = true;
                        }
                    }
                }

                Some(leave) = self.rx.leave.recv() => {
                    self.sessions.remove(&leave.sess.sid);
                    if let Err(err) = self.globals.forward_leave_to_master(&self.name, &leave).await {
                        tracing::warn!(topic = %self.name, ?err, "leave forward failed");
                        if !leave.id.is_empty() {
                            let _ = leave.sess.queue_out(&wire::err_cluster_unreachable(
                                &leave.id, &leave.topic, time_now())).await;
                        }
                    }
                    if self.sessions.is_empty() {
                        kill_timer.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                        kill_armed = true;
                    }
                }

                Some(msg) = self.rx.broadcast.recv() => {
                    if let Err(err) = self.globals.forward_broadcast_to_master(&self.name, *msg).await {
                        tracing::warn!(topic = %self.name, ?err, "broadcast forward failed");
                    }
                }

                Some(meta) = self.rx.meta.recv() => {
                    if let Err(err) = self.globals.forward_meta_to_master(&self.name, &meta).await {
                        tracing::warn!(topic = %self.name, ?err, "meta forward failed");
                        let _ = meta.sess.queue_out(&wire::err_cluster_unreachable(
                            "", &self.name, time_now())).await;
                    }
                }

                Some(resp) = proxy_rx.recv() => {
                    self.deliver_proxy_response(resp).await;
                }

                Some(sd) = self.rx.exit.recv() => {
                    if sd.reason == StopReason::Rehashing {
                        self.pres_direct("term").await;
                    }
                    let _ = self.globals.notify_proxy_gone(&self.name).await;
                    let sessions: Vec<SessionRef> =
                        self.sessions.drain().map(|(_, s)| s).collect();
                    for sess in sessions {
                        sess.detach(&self.name).await;
                    }
                    if let Some(done) = sd.done {
                        let _ = done.send(());
                    }
                    return;
                }

                _ = &mut kill_timer, if kill_armed => {
                    let _ = self.globals.notify_proxy_gone(&self.name).await;
                    let _ = self.globals.hub.unreg.send(TopicUnreg {
                        topic: self.name.clone(),
                        sess: None,
                        pkt: None,
                        del: false,
                    }).await;
                    return;
                }
            }
        }
    }

    /// Hand a master response to the session(s) it addresses.
    async fn deliver_proxy_response(&mut self, resp: ClusterResp) {
        if resp.orig_sid == "*" {
            let targets: Vec<SessionRef> = self.sessions.values().cloned().collect();
            for sess in targets {
                if !resp.skip_sid.is_empty() && sess.sid == resp.skip_sid {
                    continue;
                }
                let _ = sess.queue_out(&resp.srv_msg).await;
            }
        } else if let Some(sess) = self.sessions.get(&resp.orig_sid).cloned() {
            let _ = sess.queue_out(&resp.srv_msg).await;
        } else {
            tracing::debug!(topic = %self.name, sid = %resp.orig_sid,
                "master response for a session no longer attached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_action_labels() {
        assert_eq!(InviteAction::Join.as_str(), "join");
        assert_eq!(InviteAction::Appr.as_str(), "appr");
        assert_eq!(InviteAction::Info.as_str(), "info");
    }

    #[test]
    fn per_user_effective_mode() {
        let pud = PerUserData {
            mode_want: AccessMode::parse("RWPS").unwrap(),
            mode_given: AccessMode::parse("RWP").unwrap(),
            ..Default::default()
        };
        assert_eq!(pud.effective().to_string(), "RWP");
    }

    #[test]
    fn default_access_parse_masks_owner() {
        let acs = wire::DefaultAcsMode {
            auth: Some("RWPO".into()),
            anon: Some("R".into()),
        };
        let parsed = parse_default_access(&acs, !AccessMode::OWNER).unwrap();
        assert!(!parsed.auth.is_owner());
        assert_eq!(parsed.anon.to_string(), "R");

        let bad = wire::DefaultAcsMode {
            auth: Some("RQ".into()),
            anon: None,
        };
        assert!(parse_default_access(&bad, !AccessMode::OWNER).is_err());
    }
}
