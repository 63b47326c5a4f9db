//! Objects persisted through the storage adapter.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use palaver_common::{AccessMode, Uid};

/// Millisecond-rounded current time, the resolution every stored timestamp
/// uses.
pub fn time_now() -> DateTime<Utc> {
    Utc::now().round_subsecs(3)
}

/// Creation/update times shared by all stored objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjTimes {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjTimes {
    pub fn new() -> Self {
        let now = time_now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for ObjTimes {
    fn default() -> Self {
        Self::new()
    }
}

/// Default access granted to new subscribers, by authentication level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

/// Stored user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: Uid,
    #[serde(flatten)]
    pub times: ObjTimes,
    /// Default access to this user's P2P topics.
    pub access: DefaultAccess,
    pub public: Option<Value>,
    /// Indexed discovery tags (email, phone, free-form).
    pub tags: Vec<String>,
    /// Last online timestamp and the user agent that reported it.
    pub last_seen: Option<DateTime<Utc>>,
    pub user_agent: String,
}

/// Stored topic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    /// Routable name; doubles as the primary key.
    pub name: String,
    #[serde(flatten)]
    pub times: ObjTimes,
    pub access: DefaultAccess,
    /// Server-issued id of the last message.
    pub seq_id: u64,
    /// Messages at or below this id are erased for every subscriber.
    pub clear_id: u64,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

/// Stored subscription: the (user, topic) relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user: Uid,
    pub topic: String,
    #[serde(flatten)]
    pub times: ObjTimes,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    /// Opaque per-subscription payload, owned by the subscriber.
    pub private: Option<Value>,
    /// Soft-delete watermark private to this subscriber.
    pub clear_id: u64,
    pub recv_seq_id: u64,
    pub read_seq_id: u64,
}

impl Subscription {
    pub fn new(user: Uid, topic: &str, want: AccessMode, given: AccessMode) -> Self {
        Self {
            user,
            topic: topic.to_string(),
            times: ObjTimes::new(),
            mode_want: want,
            mode_given: given,
            private: None,
            clear_id: 0,
            recv_seq_id: 0,
            read_seq_id: 0,
        }
    }

    pub fn effective(&self) -> AccessMode {
        self.mode_want & self.mode_given
    }
}

/// Stored `{data}` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub seq_id: u64,
    pub created_at: DateTime<Utc>,
    /// Sender; zero for server-generated messages.
    pub from: Uid,
    pub head: Option<Value>,
    pub content: Option<Value>,
}

/// Fields a subscription update may touch. `None` leaves the field as is.
#[derive(Debug, Clone, Default)]
pub struct SubUpdate {
    pub mode_want: Option<AccessMode>,
    pub mode_given: Option<AccessMode>,
    pub private: Option<Value>,
    pub clear_id: Option<u64>,
    pub recv_seq_id: Option<u64>,
    pub read_seq_id: Option<u64>,
}

/// Fields a topic update may touch.
#[derive(Debug, Clone, Default)]
pub struct TopicUpdate {
    pub access: Option<DefaultAccess>,
    pub public: Option<Option<Value>>,
    pub tags: Option<Vec<String>>,
    pub clear_id: Option<u64>,
}

/// Fields a user update may touch.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub access: Option<DefaultAccess>,
    pub public: Option<Option<Value>>,
    pub tags: Option<Vec<String>>,
    pub last_seen: Option<(DateTime<Utc>, String)>,
}

/// Message/subscription browse options.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOpt {
    /// Ids equal or greater than this (closed end).
    pub since: Option<u64>,
    /// Ids strictly lower than this (open end).
    pub before: Option<u64>,
    pub limit: Option<usize>,
}

/// A message-deletion request as seen by the adapter. A zero `for_user`
/// means hard deletion for everyone.
#[derive(Debug, Clone)]
pub struct DelMessage {
    pub topic: String,
    pub for_user: Uid,
    pub before: u64,
}

/// A device registered for push notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDef {
    pub device_id: String,
    pub platform: String,
    pub last_seen: DateTime<Utc>,
    pub lang: String,
}

/// Stored authentication record for a (user, scheme) pair.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub user: Uid,
    pub scheme: String,
    /// Login or other unique handle, `scheme:handle` uniqueness enforced.
    pub unique: String,
    pub auth_lvl: u16,
    pub secret: Vec<u8>,
    pub expires: Option<DateTime<Utc>>,
}

/// File-upload bookkeeping record. The bytes live outside the store.
#[derive(Debug, Clone)]
pub struct FileDef {
    pub id: String,
    pub user: Uid,
    pub status: i32,
    pub mime_type: String,
    pub size: i64,
    pub location: String,
}
