//! Storage seam: the `Adapter` trait every backend implements, and the
//! `Store` facade handed around the server.
//!
//! The server distinguishes exactly two adapter failures: a duplicate
//! unique value (409 to the client) and everything else (500).

pub mod mem;
pub mod types;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use palaver_common::Uid;

use types::{
    AuthRecord, DelMessage, DeviceDef, FileDef, Message, QueryOpt, SubUpdate, Subscription, Topic,
    TopicUpdate, User, UserUpdate,
};

/// Adapter failure, collapsed to what the wire protocol can express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique value (credential, topic name) already exists.
    Duplicate,
    /// The object addressed by the call does not exist.
    NotFound,
    /// Anything else: connectivity, corruption, backend bug.
    Internal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Duplicate => f.write_str("duplicate value"),
            StoreError::NotFound => f.write_str("not found"),
            StoreError::Internal(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Interface implemented by a database adapter. All calls must be safe for
/// concurrent use; the topic actor model guarantees per-topic writes are
/// already serialized.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    // Users.
    async fn user_create(&self, user: &User) -> StoreResult<()>;
    async fn user_get(&self, uid: Uid) -> StoreResult<Option<User>>;
    async fn user_get_all(&self, uids: &[Uid]) -> StoreResult<Vec<User>>;
    async fn user_update(&self, uid: Uid, upd: UserUpdate) -> StoreResult<()>;
    async fn user_delete(&self, uid: Uid, soft: bool) -> StoreResult<()>;

    // Authentication records.
    async fn auth_add_record(&self, rec: &AuthRecord) -> StoreResult<()>;
    async fn auth_get_unique(&self, unique: &str) -> StoreResult<Option<AuthRecord>>;
    async fn auth_upd_record(&self, rec: &AuthRecord) -> StoreResult<()>;
    async fn auth_del_records(&self, uid: Uid) -> StoreResult<usize>;

    // Topics.
    async fn topic_create(&self, topic: &Topic, owner_sub: &Subscription) -> StoreResult<()>;
    async fn topic_create_p2p(&self, sub1: &Subscription, sub2: &Subscription) -> StoreResult<()>;
    async fn topic_get(&self, name: &str) -> StoreResult<Option<Topic>>;
    async fn topic_update(&self, name: &str, upd: TopicUpdate) -> StoreResult<()>;
    /// Atomic seqId bump + touched-at update issued on every stored message.
    async fn topic_update_on_message(&self, name: &str, msg: &Message) -> StoreResult<()>;
    async fn topic_delete(&self, name: &str) -> StoreResult<()>;

    // Subscriptions.
    async fn sub_create(&self, sub: &Subscription) -> StoreResult<()>;
    async fn sub_get(&self, topic: &str, user: Uid) -> StoreResult<Option<Subscription>>;
    /// Subscriptions of one user across topics.
    async fn subs_for_user(&self, user: Uid, opts: QueryOpt) -> StoreResult<Vec<Subscription>>;
    /// Subscriptions of all users of one topic.
    async fn subs_for_topic(&self, topic: &str, opts: QueryOpt) -> StoreResult<Vec<Subscription>>;
    async fn sub_update(&self, topic: &str, user: Uid, upd: SubUpdate) -> StoreResult<()>;
    async fn sub_delete(&self, topic: &str, user: Uid) -> StoreResult<()>;

    // Messages.
    async fn message_save(&self, msg: &Message) -> StoreResult<()>;
    async fn message_get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: QueryOpt,
    ) -> StoreResult<Vec<Message>>;
    async fn message_delete_list(&self, del: &DelMessage) -> StoreResult<()>;

    // Devices.
    async fn device_upsert(&self, uid: Uid, dev: &DeviceDef) -> StoreResult<()>;
    async fn device_get_all(&self, uids: &[Uid]) -> StoreResult<Vec<(Uid, Vec<DeviceDef>)>>;
    async fn device_delete(&self, uid: Uid, device_id: &str) -> StoreResult<()>;

    // Discovery.
    async fn find_users(&self, tags: &[String]) -> StoreResult<Vec<User>>;
    async fn find_topics(&self, tags: &[String]) -> StoreResult<Vec<Topic>>;

    // File-upload records. Bytes live outside the store.
    async fn file_start_upload(&self, fd: &FileDef) -> StoreResult<()>;
    async fn file_finish_upload(&self, id: &str, status: i32, size: i64) -> StoreResult<()>;
    async fn file_get(&self, id: &str) -> StoreResult<Option<FileDef>>;
}

/// Shared handle to the configured adapter.
#[derive(Clone)]
pub struct Store {
    adapter: Arc<dyn Adapter>,
}

impl Store {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }
}

impl std::ops::Deref for Store {
    type Target = dyn Adapter;

    fn deref(&self) -> &Self::Target {
        self.adapter.as_ref()
    }
}
