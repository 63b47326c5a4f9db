//! In-memory adapter. The default backend for tests and single-node
//! development runs; everything lives in a handful of locked maps.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use palaver_common::Uid;

use super::types::{
    time_now, AuthRecord, DelMessage, DeviceDef, FileDef, Message, QueryOpt, SubUpdate,
    Subscription, Topic, TopicUpdate, User, UserUpdate,
};
use super::{Adapter, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    users: HashMap<Uid, User>,
    topics: HashMap<String, Topic>,
    // Keyed by (topic, user).
    subs: HashMap<(String, Uid), Subscription>,
    // Messages per topic, seq-ordered by construction.
    messages: HashMap<String, Vec<Message>>,
    // Keyed by `scheme:unique`.
    auth: HashMap<String, AuthRecord>,
    devices: HashMap<Uid, Vec<DeviceDef>>,
    files: HashMap<String, FileDef>,
}

pub struct MemAdapter {
    tables: Mutex<Tables>,
}

impl MemAdapter {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl Default for MemAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn auth_key(rec: &AuthRecord) -> String {
    format!("{}:{}", rec.scheme, rec.unique)
}

fn apply_query(msgs: &[Message], clear_id: u64, opts: QueryOpt) -> Vec<Message> {
    let since = opts.since.unwrap_or(0).max(clear_id + 1);
    let mut out: Vec<Message> = msgs
        .iter()
        .filter(|m| m.seq_id >= since && opts.before.map_or(true, |b| m.seq_id < b))
        .cloned()
        .collect();
    if let Some(limit) = opts.limit {
        // Newest messages win when the window is clipped.
        if out.len() > limit {
            out = out.split_off(out.len() - limit);
        }
    }
    out
}

#[async_trait]
impl Adapter for MemAdapter {
    fn name(&self) -> &'static str {
        "mem"
    }

    async fn user_create(&self, user: &User) -> StoreResult<()> {
        let mut t = self.tables.lock();
        if t.users.contains_key(&user.uid) {
            return Err(StoreError::Duplicate);
        }
        t.users.insert(user.uid, user.clone());
        Ok(())
    }

    async fn user_get(&self, uid: Uid) -> StoreResult<Option<User>> {
        Ok(self.tables.lock().users.get(&uid).cloned())
    }

    async fn user_get_all(&self, uids: &[Uid]) -> StoreResult<Vec<User>> {
        let t = self.tables.lock();
        Ok(uids.iter().filter_map(|u| t.users.get(u).cloned()).collect())
    }

    async fn user_update(&self, uid: Uid, upd: UserUpdate) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let user = t.users.get_mut(&uid).ok_or(StoreError::NotFound)?;
        if let Some(access) = upd.access {
            user.access = access;
        }
        if let Some(public) = upd.public {
            user.public = public;
        }
        if let Some(tags) = upd.tags {
            user.tags = tags;
        }
        if let Some((when, ua)) = upd.last_seen {
            user.last_seen = Some(when);
            user.user_agent = ua;
        }
        user.times.updated_at = time_now();
        Ok(())
    }

    async fn user_delete(&self, uid: Uid, _soft: bool) -> StoreResult<()> {
        let mut t = self.tables.lock();
        t.users.remove(&uid);
        t.subs.retain(|(_, u), _| *u != uid);
        t.auth.retain(|_, rec| rec.user != uid);
        t.devices.remove(&uid);
        Ok(())
    }

    async fn auth_add_record(&self, rec: &AuthRecord) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let key = auth_key(rec);
        if t.auth.contains_key(&key) {
            return Err(StoreError::Duplicate);
        }
        t.auth.insert(key, rec.clone());
        Ok(())
    }

    async fn auth_get_unique(&self, unique: &str) -> StoreResult<Option<AuthRecord>> {
        Ok(self.tables.lock().auth.get(unique).cloned())
    }

    async fn auth_upd_record(&self, rec: &AuthRecord) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let key = auth_key(rec);
        match t.auth.get_mut(&key) {
            Some(existing) if existing.user == rec.user => {
                *existing = rec.clone();
                Ok(())
            }
            Some(_) => Err(StoreError::Duplicate),
            None => {
                t.auth.insert(key, rec.clone());
                Ok(())
            }
        }
    }

    async fn auth_del_records(&self, uid: Uid) -> StoreResult<usize> {
        let mut t = self.tables.lock();
        let before = t.auth.len();
        t.auth.retain(|_, rec| rec.user != uid);
        Ok(before - t.auth.len())
    }

    async fn topic_create(&self, topic: &Topic, owner_sub: &Subscription) -> StoreResult<()> {
        let mut t = self.tables.lock();
        if t.topics.contains_key(&topic.name) {
            return Err(StoreError::Duplicate);
        }
        t.topics.insert(topic.name.clone(), topic.clone());
        t.subs.insert(
            (owner_sub.topic.clone(), owner_sub.user),
            owner_sub.clone(),
        );
        Ok(())
    }

    async fn topic_create_p2p(&self, sub1: &Subscription, sub2: &Subscription) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let name = sub1.topic.clone();
        if t.topics.contains_key(&name) {
            return Err(StoreError::Duplicate);
        }
        t.topics.insert(
            name.clone(),
            Topic {
                name: name.clone(),
                times: sub1.times.clone(),
                access: Default::default(),
                seq_id: 0,
                clear_id: 0,
                public: None,
                tags: Vec::new(),
            },
        );
        t.subs.insert((name.clone(), sub1.user), sub1.clone());
        t.subs.insert((name, sub2.user), sub2.clone());
        Ok(())
    }

    async fn topic_get(&self, name: &str) -> StoreResult<Option<Topic>> {
        Ok(self.tables.lock().topics.get(name).cloned())
    }

    async fn topic_update(&self, name: &str, upd: TopicUpdate) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let topic = t.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        if let Some(access) = upd.access {
            topic.access = access;
        }
        if let Some(public) = upd.public {
            topic.public = public;
        }
        if let Some(tags) = upd.tags {
            topic.tags = tags;
        }
        if let Some(clear_id) = upd.clear_id {
            topic.clear_id = topic.clear_id.max(clear_id);
        }
        topic.times.updated_at = time_now();
        Ok(())
    }

    async fn topic_update_on_message(&self, name: &str, msg: &Message) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let topic = t.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        topic.seq_id = topic.seq_id.max(msg.seq_id);
        topic.times.updated_at = msg.created_at;
        Ok(())
    }

    async fn topic_delete(&self, name: &str) -> StoreResult<()> {
        let mut t = self.tables.lock();
        t.topics.remove(name);
        t.subs.retain(|(topic, _), _| topic != name);
        t.messages.remove(name);
        Ok(())
    }

    async fn sub_create(&self, sub: &Subscription) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let key = (sub.topic.clone(), sub.user);
        if t.subs.contains_key(&key) {
            return Err(StoreError::Duplicate);
        }
        t.subs.insert(key, sub.clone());
        Ok(())
    }

    async fn sub_get(&self, topic: &str, user: Uid) -> StoreResult<Option<Subscription>> {
        Ok(self
            .tables
            .lock()
            .subs
            .get(&(topic.to_string(), user))
            .cloned())
    }

    async fn subs_for_user(&self, user: Uid, opts: QueryOpt) -> StoreResult<Vec<Subscription>> {
        let t = self.tables.lock();
        let mut out: Vec<Subscription> = t
            .subs
            .values()
            .filter(|s| s.user == user)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn subs_for_topic(&self, topic: &str, opts: QueryOpt) -> StoreResult<Vec<Subscription>> {
        let t = self.tables.lock();
        let mut out: Vec<Subscription> = t
            .subs
            .values()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.user);
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn sub_update(&self, topic: &str, user: Uid, upd: SubUpdate) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let sub = t
            .subs
            .get_mut(&(topic.to_string(), user))
            .ok_or(StoreError::NotFound)?;
        if let Some(want) = upd.mode_want {
            sub.mode_want = want;
        }
        if let Some(given) = upd.mode_given {
            sub.mode_given = given;
        }
        if let Some(private) = upd.private {
            sub.private = Some(private);
        }
        if let Some(clear_id) = upd.clear_id {
            sub.clear_id = sub.clear_id.max(clear_id);
        }
        if let Some(recv) = upd.recv_seq_id {
            sub.recv_seq_id = sub.recv_seq_id.max(recv);
        }
        if let Some(read) = upd.read_seq_id {
            sub.read_seq_id = sub.read_seq_id.max(read);
        }
        sub.times.updated_at = time_now();
        Ok(())
    }

    async fn sub_delete(&self, topic: &str, user: Uid) -> StoreResult<()> {
        self.tables
            .lock()
            .subs
            .remove(&(topic.to_string(), user))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn message_save(&self, msg: &Message) -> StoreResult<()> {
        let mut t = self.tables.lock();
        t.messages
            .entry(msg.topic.clone())
            .or_default()
            .push(msg.clone());
        Ok(())
    }

    async fn message_get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: QueryOpt,
    ) -> StoreResult<Vec<Message>> {
        let t = self.tables.lock();
        let hard_clear = t.topics.get(topic).map_or(0, |tp| tp.clear_id);
        let soft_clear = t
            .subs
            .get(&(topic.to_string(), for_user))
            .map_or(0, |s| s.clear_id);
        let msgs = t.messages.get(topic).map(Vec::as_slice).unwrap_or(&[]);
        Ok(apply_query(msgs, hard_clear.max(soft_clear), opts))
    }

    async fn message_delete_list(&self, del: &DelMessage) -> StoreResult<()> {
        let mut t = self.tables.lock();
        if del.for_user.is_zero() {
            // Hard delete: erase for everyone and advance the watermark.
            if let Some(msgs) = t.messages.get_mut(&del.topic) {
                msgs.retain(|m| m.seq_id > del.before);
            }
            if let Some(topic) = t.topics.get_mut(&del.topic) {
                topic.clear_id = topic.clear_id.max(del.before);
            }
        } else if let Some(sub) = t.subs.get_mut(&(del.topic.clone(), del.for_user)) {
            sub.clear_id = sub.clear_id.max(del.before);
        } else {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn device_upsert(&self, uid: Uid, dev: &DeviceDef) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let devices = t.devices.entry(uid).or_default();
        match devices.iter_mut().find(|d| d.device_id == dev.device_id) {
            Some(existing) => *existing = dev.clone(),
            None => devices.push(dev.clone()),
        }
        Ok(())
    }

    async fn device_get_all(&self, uids: &[Uid]) -> StoreResult<Vec<(Uid, Vec<DeviceDef>)>> {
        let t = self.tables.lock();
        Ok(uids
            .iter()
            .filter_map(|u| t.devices.get(u).map(|d| (*u, d.clone())))
            .collect())
    }

    async fn device_delete(&self, uid: Uid, device_id: &str) -> StoreResult<()> {
        let mut t = self.tables.lock();
        if let Some(devices) = t.devices.get_mut(&uid) {
            devices.retain(|d| d.device_id != device_id);
        }
        Ok(())
    }

    async fn find_users(&self, tags: &[String]) -> StoreResult<Vec<User>> {
        let t = self.tables.lock();
        Ok(t.users
            .values()
            .filter(|u| u.tags.iter().any(|tag| tags.contains(tag)))
            .cloned()
            .collect())
    }

    async fn find_topics(&self, tags: &[String]) -> StoreResult<Vec<Topic>> {
        let t = self.tables.lock();
        Ok(t.topics
            .values()
            .filter(|tp| tp.tags.iter().any(|tag| tags.contains(tag)))
            .cloned()
            .collect())
    }

    async fn file_start_upload(&self, fd: &FileDef) -> StoreResult<()> {
        self.tables.lock().files.insert(fd.id.clone(), fd.clone());
        Ok(())
    }

    async fn file_finish_upload(&self, id: &str, status: i32, size: i64) -> StoreResult<()> {
        let mut t = self.tables.lock();
        let fd = t.files.get_mut(id).ok_or(StoreError::NotFound)?;
        fd.status = status;
        fd.size = size;
        Ok(())
    }

    async fn file_get(&self, id: &str) -> StoreResult<Option<FileDef>> {
        Ok(self.tables.lock().files.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::ObjTimes;
    use palaver_common::AccessMode;

    fn user(uid: u64) -> User {
        User {
            uid: Uid(uid),
            times: ObjTimes::new(),
            access: Default::default(),
            public: None,
            tags: Vec::new(),
            last_seen: None,
            user_agent: String::new(),
        }
    }

    fn message(topic: &str, seq: u64) -> Message {
        Message {
            topic: topic.to_string(),
            seq_id: seq,
            created_at: time_now(),
            from: Uid(1),
            head: None,
            content: Some(serde_json::json!(format!("m{seq}"))),
        }
    }

    #[tokio::test]
    async fn user_create_rejects_duplicates() {
        let db = MemAdapter::new();
        db.user_create(&user(1)).await.unwrap();
        assert_eq!(db.user_create(&user(1)).await, Err(StoreError::Duplicate));
    }

    #[tokio::test]
    async fn hard_delete_erases_and_advances_watermark() {
        let db = MemAdapter::new();
        let topic = Topic {
            name: "grpTest".into(),
            times: ObjTimes::new(),
            access: Default::default(),
            seq_id: 0,
            clear_id: 0,
            public: None,
            tags: Vec::new(),
        };
        let sub = Subscription::new(Uid(1), "grpTest", AccessMode::FULL, AccessMode::FULL);
        db.topic_create(&topic, &sub).await.unwrap();
        for seq in 1..=9 {
            db.message_save(&message("grpTest", seq)).await.unwrap();
        }

        db.message_delete_list(&DelMessage {
            topic: "grpTest".into(),
            for_user: Uid(0),
            before: 5,
        })
        .await
        .unwrap();

        let msgs = db
            .message_get_all("grpTest", Uid(1), QueryOpt::default())
            .await
            .unwrap();
        let seqs: Vec<u64> = msgs.iter().map(|m| m.seq_id).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9]);
        assert_eq!(db.topic_get("grpTest").await.unwrap().unwrap().clear_id, 5);
    }

    #[tokio::test]
    async fn soft_delete_is_per_user() {
        let db = MemAdapter::new();
        let topic = Topic {
            name: "grpTest".into(),
            times: ObjTimes::new(),
            access: Default::default(),
            seq_id: 0,
            clear_id: 0,
            public: None,
            tags: Vec::new(),
        };
        let sub1 = Subscription::new(Uid(1), "grpTest", AccessMode::P2P, AccessMode::P2P);
        db.topic_create(&topic, &sub1).await.unwrap();
        let sub2 = Subscription::new(Uid(2), "grpTest", AccessMode::P2P, AccessMode::P2P);
        db.sub_create(&sub2).await.unwrap();
        for seq in 1..=4 {
            db.message_save(&message("grpTest", seq)).await.unwrap();
        }

        db.message_delete_list(&DelMessage {
            topic: "grpTest".into(),
            for_user: Uid(1),
            before: 3,
        })
        .await
        .unwrap();

        let for_u1 = db
            .message_get_all("grpTest", Uid(1), QueryOpt::default())
            .await
            .unwrap();
        let for_u2 = db
            .message_get_all("grpTest", Uid(2), QueryOpt::default())
            .await
            .unwrap();
        assert_eq!(for_u1.len(), 1);
        assert_eq!(for_u2.len(), 4);
    }

    #[tokio::test]
    async fn sub_update_counters_are_monotonic() {
        let db = MemAdapter::new();
        let sub = Subscription::new(Uid(1), "grpTest", AccessMode::P2P, AccessMode::P2P);
        db.sub_create(&sub).await.unwrap();

        let upd = SubUpdate {
            read_seq_id: Some(5),
            recv_seq_id: Some(7),
            ..Default::default()
        };
        db.sub_update("grpTest", Uid(1), upd).await.unwrap();

        // A stale report must not rewind the counters.
        let stale = SubUpdate {
            read_seq_id: Some(3),
            recv_seq_id: Some(2),
            ..Default::default()
        };
        db.sub_update("grpTest", Uid(1), stale).await.unwrap();

        let sub = db.sub_get("grpTest", Uid(1)).await.unwrap().unwrap();
        assert_eq!(sub.read_seq_id, 5);
        assert_eq!(sub.recv_seq_id, 7);
    }

    #[tokio::test]
    async fn message_query_honors_limit_and_window() {
        let db = MemAdapter::new();
        for seq in 1..=10 {
            db.message_save(&message("grpQ", seq)).await.unwrap();
        }
        let opts = QueryOpt {
            since: Some(3),
            before: Some(9),
            limit: Some(4),
        };
        let msgs = db.message_get_all("grpQ", Uid(1), opts).await.unwrap();
        let seqs: Vec<u64> = msgs.iter().map(|m| m.seq_id).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8]);
    }
}
