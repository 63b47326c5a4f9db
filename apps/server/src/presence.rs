//! Presence: the contact graph on `me` topics and the notification fan-out
//! paths.
//!
//! Two delivery paths coexist. The online path routes a `{pres}` to a
//! topic's own mailbox so it reaches subscribers attached right now. The
//! offline path addresses each subscriber's `me` topic instead, reaching
//! the user's other sessions; when even `me` is offline the `*_offline_offline`
//! variants read subscribers straight from the store.

use palaver_common::uid::{parse_p2p, TopicCat};
use palaver_common::{AccessMode, Uid};

use crate::store::types::Subscription;
use crate::store::StoreResult;
use crate::topic::{PerSubsData, Topic};
use crate::wire::{AccessModeMsg, ServerMessage, ServerPres};
use crate::Globals;

/// Parameters of a presence notification.
#[derive(Debug, Clone, Default)]
pub struct PresParams {
    pub user_agent: String,
    pub seq_id: u64,
    pub clear_id: u64,
    /// Who performed the action.
    pub actor: String,
    /// Who the action affects.
    pub target: String,
    pub d_want: String,
    pub d_given: String,
}

impl PresParams {
    fn pack_acs(&self) -> Option<AccessModeMsg> {
        if self.d_want.is_empty() && self.d_given.is_empty() {
            return None;
        }
        Some(AccessModeMsg {
            want: self.d_want.clone(),
            given: self.d_given.clone(),
            mode: String::new(),
        })
    }
}

/// Offline-path delivery filter: the subscriber must be a presencer and,
/// when a filter is set, hold at least one of its bits.
fn pres_offline_filter(mode: AccessMode, filter: AccessMode) -> bool {
    mode.is_presencer() && (filter == AccessMode::NONE || (mode & filter) != AccessMode::NONE)
}

fn pres_envelope(topic: &str, what: &str, src: &str, params: &PresParams) -> ServerPres {
    let mut actor = params.actor.clone();
    let mut target = params.target.clone();
    // The user does not need to be told about themselves.
    if actor == src {
        actor = String::new();
    }
    if target == src {
        target = String::new();
    }
    ServerPres {
        topic: topic.to_string(),
        src: src.to_string(),
        what: what.to_string(),
        user_agent: params.user_agent.clone(),
        seq_id: params.seq_id,
        clear_id: params.clear_id,
        acs_actor: actor,
        acs_target: target,
        acs: params.pack_acs(),
        ..Default::default()
    }
}

impl Topic {
    /// Record another party in the contact list. P2P topics are indexed by
    /// the other user's id so status reports can be matched to them.
    pub(crate) fn add_to_per_subs(&mut self, topic: &str, online: bool, enabled: bool) {
        if topic == self.name {
            // No need to push updates to self.
            return;
        }

        let key = match parse_p2p(topic) {
            Some((u1, u2)) => {
                if u1.user_id() == self.name {
                    u2.user_id()
                } else {
                    u1.user_id()
                }
            }
            None => topic.to_string(),
        };

        self.per_subs.insert(key, PerSubsData { online, enabled });
    }

    /// Initialize the contact graph from the user's subscriptions: topics
    /// the user notifies and topics that notify the user.
    pub(crate) async fn load_contacts(&mut self, uid: Uid) -> StoreResult<()> {
        let subs = self
            .globals
            .store
            .subs_for_user(uid, Default::default())
            .await?;
        self.per_subs = std::collections::HashMap::with_capacity(subs.len());
        for sub in subs {
            let enabled = sub.effective().is_presencer();
            self.add_to_per_subs(&sub.topic, false, enabled);
        }
        Ok(())
    }

    /// Process a status request from another topic. `what` is one of
    /// `on`, `off`, `gone`, `?unkn`, optionally suffixed `+en`, `+dis` or
    /// `+rem`. Returns the (possibly blanked) `what` to forward to this
    /// topic's sessions; an empty string means "do not forward".
    pub(crate) async fn pres_proc_req(
        &mut self,
        from_user: &str,
        what: &str,
        want_reply: bool,
    ) -> String {
        let mut parts = what.splitn(2, '+');
        let mut base = parts.next().unwrap_or("").to_string();
        let mut cmd = parts.next().unwrap_or("").to_string();

        let mut req_reply = false;
        let mut online = false;
        let reply_as;

        match base.as_str() {
            "on" => online = true,
            "off" => {}
            "gone" => cmd = "rem".to_string(),
            "?unkn" => {
                req_reply = true;
                base.clear();
            }
            _ => return what.to_string(), // not a status verb, pass through
        }

        if self.cat == TopicCat::Me {
            match self.per_subs.get(from_user).copied() {
                Some(mut psd) => {
                    if cmd == "rem" {
                        reply_as = "off+rem";
                        if !psd.enabled {
                            // Was disabled: a removal changes nothing visible.
                            base.clear();
                        }
                        self.per_subs.remove(from_user);
                    } else {
                        reply_as = "on";
                        match cmd.as_str() {
                            "" => {
                                if psd.online == online || !psd.enabled {
                                    base.clear();
                                }
                            }
                            "en" => {
                                if psd.enabled && psd.online == online {
                                    base.clear();
                                }
                                psd.enabled = true;
                            }
                            "dis" => {
                                if psd.enabled {
                                    psd.enabled = false;
                                    if !psd.online {
                                        base.clear();
                                    }
                                } else {
                                    base.clear();
                                }
                            }
                            other => {
                                tracing::warn!(topic = %self.name, cmd = other,
                                    "unknown presence command");
                                return String::new();
                            }
                        }
                        psd.online = online;
                        self.per_subs.insert(from_user.to_string(), psd);
                    }
                }
                None if cmd != "rem" => {
                    // A topic this user has not seen yet: record it.
                    reply_as = "on";
                    self.add_to_per_subs(from_user, online, cmd == "en");
                    if cmd != "en" {
                        base.clear();
                    }
                }
                None => {
                    // Not listed and asked to be removed: nothing to do.
                    return String::new();
                }
            }
        } else {
            reply_as = "on";
        }

        // Reply only when asked, and never ask back on the reply itself:
        // two sides probing each other forever is the failure mode here.
        if (online || req_reply) && want_reply {
            let msg = ServerMessage {
                pres: Some(ServerPres {
                    topic: "me".to_string(),
                    what: reply_as.to_string(),
                    src: self.name.clone(),
                    want_reply: req_reply,
                    ..Default::default()
                }),
                rcpt_to: from_user.to_string(),
                ..Default::default()
            };
            let _ = self.globals.hub.route.send(Box::new(msg)).await;
        }

        base
    }

    /// Announce this user's status to everyone in the contact graph.
    /// `me` topics only. `what`: `on`, `off`, `ua`, `upd`.
    pub(crate) async fn pres_users_of_interest(&self, what: &str, ua: &str) {
        for contact in self.per_subs.keys() {
            let msg = ServerMessage {
                pres: Some(ServerPres {
                    topic: "me".to_string(),
                    what: what.to_string(),
                    src: self.name.clone(),
                    user_agent: ua.to_string(),
                    want_reply: what == "on",
                    ..Default::default()
                }),
                rcpt_to: contact.clone(),
                ..Default::default()
            };
            let _ = self.globals.hub.route.send(Box::new(msg)).await;
        }
    }

    /// Online path: notify subscribers currently attached to this topic by
    /// routing the event through the topic's own mailbox.
    pub(crate) async fn pres_subs_online(
        &self,
        what: &str,
        src: &str,
        params: &PresParams,
        filter: AccessMode,
        skip_sid: &str,
        single_user: &str,
    ) {
        let mut pres = pres_envelope(&self.x_original, what, src, params);
        pres.filter = filter;
        pres.single_user = single_user.to_string();

        let msg = ServerMessage {
            pres: Some(pres),
            rcpt_to: self.name.clone(),
            skip_sid: skip_sid.to_string(),
            ..Default::default()
        };
        let _ = self.globals.hub.route.send(Box::new(msg)).await;
    }

    /// Deliver a bare `{pres}` straight to attached presencers, without the
    /// hub round trip. Used for `term` where the mailbox may be gone.
    pub(crate) async fn pres_direct(&self, what: &str) {
        for sess in self.sessions.values() {
            // Proxy topics hold no per-user cache; the master filtered.
            if !self.is_proxy && sess.proto != crate::session::SessionProto::Cluster {
                let ok = self
                    .per_user
                    .get(&sess.uid)
                    .map(|pud| pud.effective().is_presencer())
                    .unwrap_or(false);
                if !ok {
                    continue;
                }
            }
            let msg = ServerMessage {
                pres: Some(ServerPres {
                    topic: self.original(sess.uid),
                    what: what.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let _ = sess.queue_out(&msg).await;
        }
    }

    /// Offline path: notify each subscriber on their `me` topic. With
    /// `offline_only`, sessions attached right here are skipped: they
    /// already saw the event.
    pub(crate) async fn pres_subs_offline(
        &self,
        what: &str,
        params: &PresParams,
        filter: AccessMode,
        skip_sid: &str,
        offline_only: bool,
    ) {
        for (uid, pud) in &self.per_user {
            if !pres_offline_filter(pud.effective(), filter) {
                continue;
            }
            let user = uid.user_id();
            let mut pres = pres_envelope("me", what, &self.original(*uid), params);
            if pres.acs_actor == user {
                pres.acs_actor = String::new();
            }
            if pres.acs_target == user {
                pres.acs_target = String::new();
            }
            if offline_only {
                pres.skip_sids = self.sids_of_user(*uid);
            }
            let msg = ServerMessage {
                pres: Some(pres),
                rcpt_to: user,
                skip_sid: skip_sid.to_string(),
                ..Default::default()
            };
            let _ = self.globals.hub.route.send(Box::new(msg)).await;
        }
    }

    /// Offline path for a single user.
    pub(crate) async fn pres_single_user_offline(
        &self,
        uid: Uid,
        what: &str,
        params: &PresParams,
        skip_sid: &str,
        offline_only: bool,
    ) {
        let Some(pud) = self.per_user.get(&uid) else {
            return;
        };
        if !pres_offline_filter(pud.effective(), AccessMode::NONE) {
            return;
        }

        let user = uid.user_id();
        let mut pres = pres_envelope("me", what, &self.original(uid), params);
        pres.want_reply = what.starts_with("?unkn");
        if pres.acs_actor == user {
            pres.acs_actor = String::new();
        }
        if pres.acs_target == user {
            pres.acs_target = String::new();
        }
        if offline_only {
            pres.skip_sids = self.sids_of_user(uid);
        }

        let msg = ServerMessage {
            pres: Some(pres),
            rcpt_to: user,
            skip_sid: skip_sid.to_string(),
            ..Default::default()
        };
        let _ = self.globals.hub.route.send(Box::new(msg)).await;
    }

    /// A message was stored: tell offline readers on their `me`.
    pub(crate) async fn pres_pub_message_sent(&self, from: Uid, seq: u64, skip_sid: &str) {
        let params = PresParams {
            seq_id: seq,
            actor: from.user_id(),
            ..Default::default()
        };
        self.pres_subs_offline("msg", &params, AccessMode::READ, skip_sid, true)
            .await;
    }

    /// A read/recv pointer moved: tell the user's other sessions.
    pub(crate) async fn pres_pub_message_count(
        &self,
        uid: Uid,
        what: &str,
        seq: u64,
        skip_sid: &str,
    ) {
        if seq == 0 {
            tracing::warn!(topic = %self.name, "read-state notification without a payload");
            return;
        }
        let params = PresParams {
            seq_id: seq,
            ..Default::default()
        };
        self.pres_single_user_offline(uid, what, &params, skip_sid, true)
            .await;
    }

    fn sids_of_user(&self, uid: Uid) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.uid == uid)
            .map(|s| s.sid.clone())
            .collect()
    }
}

/// Offline path when the topic itself is not loaded: read the subscribers
/// from the store and address each `me` directly.
pub async fn pres_subs_offline_offline(
    globals: &Globals,
    topic: &str,
    cat: TopicCat,
    subs: &[Subscription],
    what: &str,
    params: &PresParams,
    skip_sid: &str,
) {
    for sub in subs {
        if !pres_offline_filter(sub.effective(), AccessMode::NONE) {
            continue;
        }

        // Each P2P party knows the topic by the other party's name.
        let original = if cat == TopicCat::P2P {
            match parse_p2p(topic) {
                Some((u1, u2)) => {
                    if u1 == sub.user {
                        u2.user_id()
                    } else {
                        u1.user_id()
                    }
                }
                None => topic.to_string(),
            }
        } else {
            topic.to_string()
        };

        pres_single_user_offline_offline(globals, sub.user, &original, what, params, skip_sid)
            .await;
    }
}

/// Notify one user on `me` about a topic that is not loaded.
pub async fn pres_single_user_offline_offline(
    globals: &Globals,
    uid: Uid,
    original: &str,
    what: &str,
    params: &PresParams,
    skip_sid: &str,
) {
    let user = uid.user_id();
    let mut pres = pres_envelope("me", what, original, params);
    if pres.acs_actor == user {
        pres.acs_actor = String::new();
    }
    if pres.acs_target == user {
        pres.acs_target = String::new();
    }

    let msg = ServerMessage {
        pres: Some(pres),
        rcpt_to: user,
        skip_sid: skip_sid.to_string(),
        ..Default::default()
    };
    let _ = globals.hub.route.send(Box::new(msg)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::auth::AuthRegistry;
    use crate::hub::HubReceivers;
    use crate::push::Push;
    use crate::store::mem::MemAdapter;
    use crate::store::Store;
    use crate::{Globals, RuntimeConfig};

    fn test_globals() -> (Arc<Globals>, HubReceivers) {
        Globals::new(
            Store::new(Arc::new(MemAdapter::new())),
            AuthRegistry::new(),
            Push::new(),
            None,
            1,
            RuntimeConfig::default(),
        )
    }

    fn me_topic(globals: Arc<Globals>) -> Topic {
        let name = Uid(42).user_id();
        Topic::new(globals, &name, "me", TopicCat::Me)
    }

    #[tokio::test]
    async fn status_exchange_reaches_quiescence() {
        let (globals, mut rx) = test_globals();
        let mut me = me_topic(globals);
        me.add_to_per_subs("usrContact", false, true);
        let contact = me
            .per_subs
            .keys()
            .next()
            .cloned()
            .expect("contact recorded");

        // The contact announces itself online and asks for a reply.
        let fwd = me.pres_proc_req(&contact, "on", true).await;
        assert_eq!(fwd, "on", "enabled contact changes are forwarded");
        assert!(me.per_subs[&contact].online);

        // A reply went out, and it must not ask for a reply back.
        let reply = rx.route.try_recv().expect("status reply expected");
        let pres = reply.pres.as_ref().unwrap();
        assert_eq!(pres.what, "on");
        assert!(!pres.want_reply, "a reply asking for a reply oscillates");

        // The same announcement again changes nothing and stays silent.
        let fwd = me.pres_proc_req(&contact, "on", false).await;
        assert_eq!(fwd, "", "no visible change, nothing to forward");
        assert!(rx.route.try_recv().is_err(), "no reply without want_reply");
    }

    #[tokio::test]
    async fn unknown_status_probe_is_answered() {
        let (globals, mut rx) = test_globals();
        let mut me = me_topic(globals);

        let fwd = me.pres_proc_req("usrStranger", "?unkn", true).await;
        assert_eq!(fwd, "", "probes are never forwarded to sessions");

        let reply = rx.route.try_recv().expect("probe must be answered");
        let pres = reply.pres.as_ref().unwrap();
        assert_eq!(pres.what, "on");
        assert_eq!(reply.rcpt_to, "usrStranger");
    }

    #[tokio::test]
    async fn enable_disable_and_remove_commands() {
        let (globals, _rx) = test_globals();
        let mut me = me_topic(globals);

        // A new topic enabling itself gets recorded and forwarded.
        let fwd = me.pres_proc_req("grpRoom", "on+en", false).await;
        assert_eq!(fwd, "on");
        assert!(me.per_subs["grpRoom"].enabled);
        assert!(me.per_subs["grpRoom"].online);

        // Disabling keeps the entry but mutes it.
        let fwd = me.pres_proc_req("grpRoom", "off+dis", false).await;
        assert_eq!(fwd, "off", "was online, going dark is still visible");
        assert!(!me.per_subs["grpRoom"].enabled);

        // Gone removes the contact entirely.
        let fwd = me.pres_proc_req("grpRoom", "gone", false).await;
        assert_eq!(fwd, "", "removal of a disabled contact is silent");
        assert!(!me.per_subs.contains_key("grpRoom"));

        // Removing an unknown contact is a no-op.
        let fwd = me.pres_proc_req("grpRoom", "gone", false).await;
        assert_eq!(fwd, "");
    }

    #[test]
    fn p2p_contacts_are_indexed_by_the_other_user() {
        let (globals, _rx) = test_globals();
        let mut me = me_topic(globals);

        let other = Uid(7);
        let p2p = Uid(42).p2p_name(other);
        me.add_to_per_subs(&p2p, true, true);

        assert!(me.per_subs.contains_key(&other.user_id()));
        assert!(!me.per_subs.contains_key(&p2p));
    }

    #[test]
    fn offline_filter_requires_presence_bit() {
        let rwp = AccessMode::parse("RWP").unwrap();
        let rw = AccessMode::parse("RW").unwrap();
        assert!(pres_offline_filter(rwp, AccessMode::NONE));
        assert!(!pres_offline_filter(rw, AccessMode::NONE));
        // With a filter both conditions must hold.
        assert!(pres_offline_filter(rwp, AccessMode::READ));
        assert!(!pres_offline_filter(rwp, AccessMode::DELETE));
    }

    #[test]
    fn envelope_clears_self_references() {
        let params = PresParams {
            actor: "usrABC".into(),
            target: "usrABC".into(),
            ..Default::default()
        };
        let pres = pres_envelope("grpX", "acs", "usrABC", &params);
        assert!(pres.acs_actor.is_empty());
        assert!(pres.acs_target.is_empty());

        let params = PresParams {
            actor: "usrOther".into(),
            ..Default::default()
        };
        let pres = pres_envelope("grpX", "acs", "usrABC", &params);
        assert_eq!(pres.acs_actor, "usrOther");
    }

    #[test]
    fn pack_acs_only_when_modes_present() {
        let empty = PresParams::default();
        assert!(empty.pack_acs().is_none());

        let with_want = PresParams {
            d_want: "RW".into(),
            ..Default::default()
        };
        let acs = with_want.pack_acs().unwrap();
        assert_eq!(acs.want, "RW");
        assert!(acs.given.is_empty());
    }
}
