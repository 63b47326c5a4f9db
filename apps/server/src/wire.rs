//! Wire protocol: single-envelope client messages, server messages, and the
//! `{ctrl}` constructors for the full status taxonomy.
//!
//! A client packet sets exactly one of the envelope fields; a server packet
//! likewise. Everything is JSON on the wire; opaque payloads stay
//! `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use palaver_common::AccessMode;

use crate::session::SessionRef;

/// Delete sentinel: assigning this string to `public`/`private` clears the
/// stored value.
pub const NULL_VALUE: &str = "\u{2421}";

/// True if the payload is the delete sentinel.
pub fn is_null_value(v: &Option<Value>) -> bool {
    matches!(v, Some(Value::String(s)) if s == NULL_VALUE)
}

// ---------------------------------------------------------------------------
// Protocol version
// ---------------------------------------------------------------------------

/// Current protocol version, reported in the `{hi}` response.
pub const CURRENT_VERSION: &str = "0.13";
/// Oldest protocol version the server still accepts.
pub const MIN_SUPPORTED_VERSION: &str = "0.13";

/// Pack "major.minor" into `((major & 0xff) << 8) | (minor & 0xff)`.
/// Returns 0 for anything unparsable.
pub fn parse_version(s: &str) -> u16 {
    let mut parts = s.splitn(2, '.');
    let major: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    if major > 0xff || minor > 0xff {
        return 0;
    }
    (major << 8) | minor
}

// ---------------------------------------------------------------------------
// Shared sub-objects
// ---------------------------------------------------------------------------

/// Browse options of a `{get}` request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GetOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Query part shared by `{get}` and `{sub}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub what: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<GetOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<GetOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<GetOpts>,
}

/// Topic default access mode, string form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultAcsMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anon: Option<String>,
}

/// Payload of `set.desc` (also used at account/topic creation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetDesc {
    #[serde(default, rename = "defacs", skip_serializing_if = "Option::is_none")]
    pub default_acs: Option<DefaultAcsMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Payload of `set.sub`: update own subscription or invite/approve another
/// user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetSub {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

/// Update part shared by `{set}` and `{sub}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<SetSub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Client-to-server envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientHi {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, rename = "ua", skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, rename = "ver", skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, rename = "dev", skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lang: String,
    #[serde(default, rename = "platf", skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, rename = "bkg", skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAcc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// `newXXX` to create an account, otherwise the affected user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub login: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientLogin {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSub {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<SetQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<GetQuery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientLeave {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsub: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientPub {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(default, rename = "noecho", skip_serializing_if = "std::ops::Not::not")]
    pub no_echo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientGet {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(flatten)]
    pub query: GetQuery,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSet {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(flatten)]
    pub query: SetQuery,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientDel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// `msg` (default) or `topic`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub what: String,
    /// Delete messages with ids at or below this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hard: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientNote {
    // No id: notes are fire-and-forget, the server never acknowledges them.
    pub topic: String,
    /// `kp`, `recv` or `read`.
    pub what: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub unread: u64,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Wrapper for client messages; exactly one field is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hi: Option<ClientHi>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<ClientAcc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<ClientLogin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<ClientSub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave: Option<ClientLeave>,
    #[serde(default, rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publish: Option<ClientPub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<ClientGet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<ClientSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del: Option<ClientDel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<ClientNote>,
}

// ---------------------------------------------------------------------------
// Meta / del selectors
// ---------------------------------------------------------------------------

pub const META_DESC: u8 = 1 << 0;
pub const META_SUB: u8 = 1 << 1;
pub const META_DATA: u8 = 1 << 2;
pub const META_TAGS: u8 = 1 << 3;

/// Parse the space-separated `what` of a `{get}` into selector bits.
pub fn parse_meta_what(what: &str) -> u8 {
    let mut bits = 0;
    for part in what.split_whitespace() {
        match part {
            "desc" => bits |= META_DESC,
            "sub" => bits |= META_SUB,
            "data" => bits |= META_DATA,
            "tags" => bits |= META_TAGS,
            _ => {} // unknown selectors are ignored
        }
    }
    bits
}

/// What a `{del}` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelWhat {
    Msg,
    Topic,
}

pub fn parse_del_what(what: &str) -> Option<DelWhat> {
    match what {
        "" | "msg" => Some(DelWhat::Msg),
        "topic" => Some(DelWhat::Topic),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Server-to-client envelopes
// ---------------------------------------------------------------------------

/// Access mode triple as reported to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessModeMsg {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub want: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub given: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastSeenInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<DateTime<Utc>>,
    #[serde(default, rename = "ua", skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
}

/// Topic description, part of `{meta}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicDesc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, rename = "defacs", skip_serializing_if = "Option::is_none")]
    pub default_acs: Option<DefaultAcsMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessModeMsg>,
    #[serde(default, rename = "seq", skip_serializing_if = "is_zero_u64")]
    pub seq_id: u64,
    #[serde(default, rename = "read", skip_serializing_if = "is_zero_u64")]
    pub read_seq_id: u64,
    #[serde(default, rename = "recv", skip_serializing_if = "is_zero_u64")]
    pub recv_seq_id: u64,
    #[serde(default, rename = "clear", skip_serializing_if = "is_zero_u64")]
    pub clear_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    /// Reported when a `new…` request assigned the final name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// One subscription row of a `{meta sub=…}` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicSubMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub online: String,
    #[serde(default, skip_serializing_if = "acs_is_empty")]
    pub acs: AccessModeMsg,
    #[serde(default, rename = "read", skip_serializing_if = "is_zero_u64")]
    pub read_seq_id: u64,
    #[serde(default, rename = "recv", skip_serializing_if = "is_zero_u64")]
    pub recv_seq_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    /// Subscribed user, non-`me` responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Subscription's topic, `me` responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, rename = "seq", skip_serializing_if = "is_zero_u64")]
    pub seq_id: u64,
    #[serde(default, rename = "clear", skip_serializing_if = "is_zero_u64")]
    pub clear_id: u64,
    #[serde(default, rename = "seen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<LastSeenInfo>,
}

fn acs_is_empty(acs: &AccessModeMsg) -> bool {
    acs.want.is_empty() && acs.given.is_empty() && acs.mode.is_empty()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCtrl {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerData {
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    pub ts: DateTime<Utc>,
    #[serde(default, rename = "seq", skip_serializing_if = "is_zero_u64")]
    pub seq_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerPres {
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,
    pub what: String,
    #[serde(default, rename = "ua", skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, rename = "seq", skip_serializing_if = "is_zero_u64")]
    pub seq_id: u64,
    #[serde(default, rename = "clear", skip_serializing_if = "is_zero_u64")]
    pub clear_id: u64,
    #[serde(default, rename = "act", skip_serializing_if = "String::is_empty")]
    pub acs_actor: String,
    #[serde(default, rename = "tgt", skip_serializing_if = "String::is_empty")]
    pub acs_target: String,
    #[serde(default, rename = "dacs", skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessModeMsg>,

    // Routing directives, never serialized to clients. Carried explicitly in
    // cluster frames when the notification crosses nodes.

    /// Set on a status probe so the receiver replies; must stay unset on the
    /// reply itself or two nodes ping-pong forever.
    #[serde(skip)]
    pub want_reply: bool,
    /// Deliver only to subscribers holding these mode bits.
    #[serde(skip)]
    pub filter: AccessMode,
    /// Skip these sessions: they already saw the event in the source topic.
    #[serde(skip)]
    pub skip_sids: Vec<String>,
    /// Deliver to sessions of this user only.
    #[serde(skip)]
    pub single_user: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<TopicDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<TopicSubMsg>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub topic: String,
    pub from: String,
    pub what: String,
    #[serde(default, rename = "seq", skip_serializing_if = "is_zero_u64")]
    pub seq_id: u64,
}

/// Wrapper for server messages plus in-process routing metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctrl: Option<ServerCtrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ServerData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ServerMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pres: Option<ServerPres>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ServerInfo>,

    /// Message id copied out for `{ctrl}` acknowledgements.
    #[serde(skip)]
    pub id: String,
    /// Routable (expanded) name of the recipient topic.
    #[serde(skip)]
    pub rcpt_to: String,
    /// Sender's user id as a string.
    #[serde(skip)]
    pub as_user: String,
    /// Session to skip when fanning out (the originator).
    #[serde(skip)]
    pub skip_sid: String,
    /// Originating session, for acknowledgements. Never crosses nodes.
    #[serde(skip)]
    pub sess: Option<SessionRef>,
}

impl ServerMessage {
    pub fn describe(&self) -> &'static str {
        if self.ctrl.is_some() {
            "ctrl"
        } else if self.data.is_some() {
            "data"
        } else if self.meta.is_some() {
            "meta"
        } else if self.pres.is_some() {
            "pres"
        } else if self.info.is_some() {
            "info"
        } else {
            "empty"
        }
    }
}

// ---------------------------------------------------------------------------
// {ctrl} constructors
// ---------------------------------------------------------------------------

fn ctrl(id: &str, topic: &str, code: u16, text: &str, ts: DateTime<Utc>) -> ServerMessage {
    ServerMessage {
        ctrl: Some(ServerCtrl {
            id: id.to_string(),
            topic: topic.to_string(),
            params: None,
            code,
            text: text.to_string(),
            ts,
        }),
        id: id.to_string(),
        ..Default::default()
    }
}

/// 200 ok
pub fn no_err(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 200, "ok", ts)
}

/// 200 ok with params
pub fn no_err_params(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMessage {
    let mut msg = ctrl(id, topic, 200, "ok", ts);
    msg.ctrl.as_mut().unwrap().params = Some(params);
    msg
}

/// 201 created
pub fn no_err_created(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 201, "created", ts)
}

/// 201 created with additional parameters
pub fn no_err_created_params(
    id: &str,
    topic: &str,
    ts: DateTime<Utc>,
    params: Value,
) -> ServerMessage {
    let mut msg = ctrl(id, topic, 201, "created", ts);
    msg.ctrl.as_mut().unwrap().params = Some(params);
    msg
}

/// 202 accepted
pub fn no_err_accepted(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 202, "accepted", ts)
}

/// 202 accepted with additional parameters
pub fn no_err_accepted_params(
    id: &str,
    topic: &str,
    ts: DateTime<Utc>,
    params: Value,
) -> ServerMessage {
    let mut msg = ctrl(id, topic, 202, "accepted", ts);
    msg.ctrl.as_mut().unwrap().params = Some(params);
    msg
}

/// 205 evicted: disconnected from topic through no fault of the session
pub fn no_err_evicted(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 205, "evicted", ts)
}

/// 205 server shutdown
pub fn no_err_shutdown(ts: DateTime<Utc>) -> ServerMessage {
    ctrl("", "", 205, "server shutdown", ts)
}

/// 300 credential validation required
pub fn info_validate_credentials(id: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, "", 300, "validate credentials", ts)
}

/// 304 already subscribed
pub fn info_already_subscribed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 304, "already subscribed", ts)
}

/// 304 not joined
pub fn info_not_joined(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 304, "not joined", ts)
}

/// 304 no action: object already in the requested state
pub fn info_no_action(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 304, "no action", ts)
}

/// 304 not modified
pub fn info_not_modified(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 304, "not modified", ts)
}

/// 307 redirect
pub fn info_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 307, "found", ts)
}

/// 400 malformed
pub fn err_malformed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 400, "malformed", ts)
}

/// 401 authentication required
pub fn err_auth_required(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 401, "authentication required", ts)
}

/// 401 authentication failed
pub fn err_auth_failed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 401, "authentication failed", ts)
}

/// 401 unknown authentication scheme
pub fn err_auth_unknown_scheme(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 401, "unknown authentication scheme", ts)
}

/// 403 permission denied
pub fn err_permission_denied(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 403, "permission denied", ts)
}

/// 403 valid API key required
pub fn err_api_key_required(ts: DateTime<Utc>) -> ServerMessage {
    ctrl("", "", 403, "valid API key required", ts)
}

/// 404 topic not found
pub fn err_topic_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 404, "topic not found", ts)
}

/// 404 user not found
pub fn err_user_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 404, "user not found", ts)
}

/// 404 not found
pub fn err_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 404, "not found", ts)
}

/// 405 operation not allowed in this context
pub fn err_operation_not_allowed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 405, "operation or method not allowed", ts)
}

/// 406 invalid response
pub fn err_invalid_response(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 406, "invalid response", ts)
}

/// 409 already authenticated
pub fn err_already_authenticated(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 409, "already authenticated", ts)
}

/// 409 duplicate credential
pub fn err_duplicate_credential(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 409, "duplicate credential", ts)
}

/// 409 must attach first
pub fn err_attach_first(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 409, "must attach first", ts)
}

/// 409 already exists
pub fn err_already_exists(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 409, "already exists", ts)
}

/// 409 command out of sequence
pub fn err_command_out_of_sequence(id: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, "", 409, "command out of sequence", ts)
}

/// 410 gone: deleted topic or banned user
pub fn err_gone(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 410, "gone", ts)
}

/// 413 too large
pub fn err_too_large(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 413, "too large", ts)
}

/// 422 policy violation
pub fn err_policy(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 422, "policy violation", ts)
}

/// 423 locked: topic is being deleted
pub fn err_locked(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 423, "locked", ts)
}

/// 500 internal error
pub fn err_unknown(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 500, "internal error", ts)
}

/// 501 not implemented
pub fn err_not_implemented(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 501, "not implemented", ts)
}

/// 502 cluster unreachable
pub fn err_cluster_unreachable(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, topic, 502, "cluster unreachable", ts)
}

/// 505 version not supported
pub fn err_version_not_supported(id: &str, ts: DateTime<Utc>) -> ServerMessage {
    ctrl(id, "", 505, "version not supported", ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_packs_major_minor() {
        assert_eq!(parse_version("0.13"), 13);
        assert_eq!(parse_version("1.2"), (1 << 8) | 2);
        assert_eq!(parse_version("garbage"), 0);
        assert_eq!(parse_version(""), 0);
    }

    #[test]
    fn client_message_is_single_envelope() {
        let raw = r#"{"pub":{"topic":"grpTest","content":"hi"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.publish.is_some());
        assert!(msg.hi.is_none());
        assert_eq!(msg.publish.unwrap().topic, "grpTest");
    }

    #[test]
    fn ctrl_serializes_expected_fields() {
        let ts = crate::store::types::time_now();
        let msg = no_err_params("42", "me", ts, serde_json::json!({"seq": 8}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["ctrl"]["code"], 200);
        assert_eq!(json["ctrl"]["id"], "42");
        assert_eq!(json["ctrl"]["params"]["seq"], 8);
        // Routing metadata never reaches the wire.
        assert!(json.get("rcpt_to").is_none());
        assert!(json.get("skip_sid").is_none());
    }

    #[test]
    fn meta_what_parses_space_separated_selectors() {
        assert_eq!(parse_meta_what("desc"), META_DESC);
        assert_eq!(
            parse_meta_what("desc sub data"),
            META_DESC | META_SUB | META_DATA
        );
        assert_eq!(parse_meta_what("bogus"), 0);
    }

    #[test]
    fn del_what_defaults_to_msg() {
        assert_eq!(parse_del_what(""), Some(DelWhat::Msg));
        assert_eq!(parse_del_what("msg"), Some(DelWhat::Msg));
        assert_eq!(parse_del_what("topic"), Some(DelWhat::Topic));
        assert_eq!(parse_del_what("user"), None);
    }

    #[test]
    fn null_value_sentinel_detection() {
        assert!(is_null_value(&Some(Value::String(NULL_VALUE.into()))));
        assert!(!is_null_value(&Some(Value::String("x".into()))));
        assert!(!is_null_value(&None));
    }

    #[test]
    fn pres_routing_fields_do_not_serialize() {
        let pres = ServerPres {
            topic: "me".into(),
            what: "on".into(),
            src: "grpX".into(),
            want_reply: true,
            filter: AccessMode::PRES,
            skip_sids: vec!["sessA".into()],
            ..Default::default()
        };
        let json = serde_json::to_value(&pres).unwrap();
        assert!(json.get("want_reply").is_none());
        assert!(json.get("filter").is_none());
        assert!(json.get("skip_sids").is_none());
        assert_eq!(json["what"], "on");
    }
}
