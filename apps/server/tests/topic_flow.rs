//! End-to-end flows over the in-memory adapter: accounts, P2P creation,
//! publish fan-out, watermarks, ownership transfer and rehash teardown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use palaver_common::uid::parse_user_id;
use palaver_common::Uid;

use palaver_server::auth::basic::BasicAuth;
use palaver_server::auth::token::TokenAuth;
use palaver_server::auth::AuthRegistry;
use palaver_server::cluster::Cluster;
use palaver_server::config::{ClusterConfig, ClusterNodeConfig};
use palaver_server::push::{Handler, Push, Receipt};
use palaver_server::store::mem::MemAdapter;
use palaver_server::store::types::QueryOpt;
use palaver_server::store::Store;
use palaver_server::wire::{
    ClientAcc, ClientDel, ClientGet, ClientHi, ClientLeave, ClientMessage, ClientNote, ClientPub,
    ClientSet, ClientSub, GetQuery, SetQuery, SetSub,
};
use palaver_server::{hub, Globals, Outbound, RuntimeConfig, Session, SessionCtl, SessionProto};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Push handler that parks receipts for inspection.
struct CapturePush {
    tx: mpsc::Sender<Receipt>,
    received: Arc<Mutex<Vec<Receipt>>>,
}

impl CapturePush {
    fn new() -> (Arc<Self>, Arc<Mutex<Vec<Receipt>>>) {
        let (tx, mut rx) = mpsc::channel::<Receipt>(64);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        tokio::spawn(async move {
            while let Some(rcpt) = rx.recv().await {
                sink.lock().push(rcpt);
            }
        });
        (
            Arc::new(Self {
                tx,
                received: received.clone(),
            }),
            received,
        )
    }
}

impl Handler for CapturePush {
    fn is_ready(&self) -> bool {
        true
    }
    fn sender(&self) -> mpsc::Sender<Receipt> {
        self.tx.clone()
    }
    fn stop(&self) {}
}

struct TestServer {
    globals: Arc<Globals>,
    receipts: Arc<Mutex<Vec<Receipt>>>,
}

impl TestServer {
    fn new() -> Self {
        Self::with_cluster(None)
    }

    fn with_cluster(cluster: Option<Arc<Cluster>>) -> Self {
        let store = Store::new(Arc::new(MemAdapter::new()));

        let mut auth = AuthRegistry::new();
        auth.register(
            "token",
            Arc::new(TokenAuth::new(vec![9u8; 32], 3600, 1).unwrap()),
        );
        auth.register("basic", Arc::new(BasicAuth::new(store.clone())));

        let (capture, receipts) = CapturePush::new();
        let mut push = Push::new();
        push.register(capture);

        let run = RuntimeConfig {
            topic_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let (globals, hub_rx) = Globals::new(store, auth, push, cluster, 1, run);
        tokio::spawn(hub::run(globals.clone(), hub_rx));

        Self { globals, receipts }
    }

    fn client(&self) -> Client {
        Client::new(self.globals.clone())
    }

    /// Run the full signup dance: {hi}, {acc new... login:true}.
    async fn signup(&self, login: &str) -> (Client, Uid) {
        let mut client = self.client();
        let ctrl = client.request(hi()).await;
        assert_eq!(ctrl["ctrl"]["code"], Value::from(201));

        let ctrl = client
            .request(ClientMessage {
                acc: Some(ClientAcc {
                    id: "acc1".into(),
                    user: "new".into(),
                    scheme: "basic".into(),
                    secret: format!("{login}:secret99"),
                    login: true,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await;
        assert_eq!(ctrl["ctrl"]["code"], Value::from(201), "signup failed: {ctrl}");
        let uid = parse_user_id(ctrl["ctrl"]["params"]["user"].as_str().unwrap());
        assert!(!uid.is_zero());
        (client, uid)
    }
}

/// A client driven directly through the session dispatcher, reading the
/// outbound queue like a transport would.
struct Client {
    session: Session,
    send_rx: mpsc::Receiver<Outbound>,
    ctl_rx: mpsc::Receiver<SessionCtl>,
}

impl Client {
    fn new(globals: Arc<Globals>) -> Self {
        let (send_tx, send_rx) = mpsc::channel(128);
        let (ctl_tx, ctl_rx) = mpsc::channel(32);
        let session = Session::new(
            globals.clone(),
            SessionProto::Websocket,
            "127.0.0.1:1".into(),
            send_tx,
            ctl_tx,
        );
        globals.sessions.insert(session.session_ref());
        Self {
            session,
            send_rx,
            ctl_rx,
        }
    }

    async fn pump_ctl(&mut self) {
        while let Ok(ctl) = self.ctl_rx.try_recv() {
            self.session.handle_ctl(ctl).await;
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        self.session.dispatch(msg).await;
        self.pump_ctl().await;
    }

    /// Next server message, as JSON.
    async fn recv(&mut self) -> Value {
        let out = timeout(RECV_TIMEOUT, self.send_rx.recv())
            .await
            .expect("timed out waiting for a server message")
            .expect("session send channel closed");
        self.pump_ctl().await;
        match out {
            Outbound::Serialized(s) => serde_json::from_str(&s).unwrap(),
            Outbound::Message(msg) => serde_json::to_value(&*msg).unwrap(),
        }
    }

    /// Send and return the first response.
    async fn request(&mut self, msg: ClientMessage) -> Value {
        self.send(msg).await;
        self.recv().await
    }

    /// Wait until the session holds a link to the topic.
    async fn wait_attached(&mut self, expanded: &str) {
        for _ in 0..200 {
            self.pump_ctl().await;
            if self.session.is_attached(expanded) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never attached to {expanded}");
    }

    /// Drain messages until one matches; panics on timeout.
    async fn recv_until(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..50 {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
        panic!("expected message never arrived");
    }
}

fn hi() -> ClientMessage {
    ClientMessage {
        hi: Some(ClientHi {
            id: "hi1".into(),
            user_agent: "palaver-test/0.1".into(),
            version: "0.13".into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sub(topic: &str) -> ClientMessage {
    ClientMessage {
        sub: Some(ClientSub {
            id: format!("sub-{topic}"),
            topic: topic.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn publish(topic: &str, content: &str) -> ClientMessage {
    ClientMessage {
        publish: Some(ClientPub {
            id: format!("pub-{content}"),
            topic: topic.into(),
            content: Some(json!(content)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// hi without a prior version must be rejected with 409.
#[tokio::test]
async fn commands_require_hi_first() {
    let server = TestServer::new();
    let mut client = server.client();

    let reply = client
        .request(ClientMessage {
            login: Some(Default::default()),
            ..Default::default()
        })
        .await;
    assert_eq!(reply["ctrl"]["code"], Value::from(409));

    // Changing the version mid-session is also out of sequence.
    client.request(hi()).await;
    let mut second = hi();
    second.hi.as_mut().unwrap().version = "1.0".into();
    let reply = client.request(second).await;
    assert_eq!(reply["ctrl"]["code"], Value::from(409));
}

#[tokio::test]
async fn p2p_creation_invites_the_other_party() {
    let server = TestServer::new();
    let (mut alice, alice_uid) = server.signup("alice").await;
    let (_bob, bob_uid) = server.signup("bob").await;

    let ctrl = alice.request(sub(&bob_uid.user_id())).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(201), "expected created: {ctrl}");

    let p2p_name = alice_uid.p2p_name(bob_uid);
    alice.wait_attached(&p2p_name).await;

    // Both subscriptions must exist in the store with mirrored access.
    let store = &server.globals.store;
    let alice_sub = store.sub_get(&p2p_name, alice_uid).await.unwrap().unwrap();
    let bob_sub = store.sub_get(&p2p_name, bob_uid).await.unwrap().unwrap();
    assert_eq!(alice_sub.mode_want, alice_sub.mode_given);
    assert_eq!(bob_sub.mode_want.to_string(), "N");
    assert_eq!(bob_sub.mode_given.to_string(), "RWPD");

    // Bob is offline, so the invite lands in his 'me' mailbox.
    let invites = store
        .message_get_all(&bob_uid.user_id(), bob_uid, QueryOpt::default())
        .await
        .unwrap();
    assert_eq!(invites.len(), 1);
    let content = invites[0].content.as_ref().unwrap();
    assert_eq!(content["action"], "join");
    assert_eq!(content["topic"], p2p_name.as_str());
}

#[tokio::test]
async fn publish_fans_out_and_builds_receipts() {
    let server = TestServer::new();
    let (mut alice, alice_uid) = server.signup("alice").await;
    let (mut bob, _bob_uid) = server.signup("bob").await;
    let (mut carol, _carol_uid) = server.signup("carol").await;

    // Alice creates a group; the assigned name comes back in the ack.
    let ctrl = alice.request(sub("new")).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(201));
    let grp = ctrl["ctrl"]["topic"].as_str().unwrap().to_string();
    assert!(grp.starts_with("grp"));
    alice.wait_attached(&grp).await;

    // Bob joins and stays; carol joins, then leaves but keeps the
    // subscription and sits on her 'me' topic.
    let ctrl = bob.request(sub(&grp)).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    bob.wait_attached(&grp).await;

    let ctrl = carol.request(sub(&grp)).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    carol.wait_attached(&grp).await;
    let ctrl = carol
        .request(ClientMessage {
            leave: Some(ClientLeave {
                id: "lv1".into(),
                topic: grp.clone(),
                unsub: false,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    let ctrl = carol.request(sub("me")).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));

    // Publish.
    alice.send(publish(&grp, "hello")).await;
    let ack = alice
        .recv_until(|m| m.get("ctrl").is_some())
        .await;
    assert_eq!(ack["ctrl"]["code"], Value::from(202));
    assert_eq!(ack["ctrl"]["params"]["seq"], Value::from(1));

    // Bob, attached, receives the data message.
    let data = bob.recv_until(|m| m.get("data").is_some()).await;
    assert_eq!(data["data"]["seq"], Value::from(1));
    assert_eq!(data["data"]["content"], "hello");
    assert_eq!(data["data"]["from"], alice_uid.user_id().as_str());

    // Carol, away from the topic but online on 'me', gets the presence nudge.
    let pres = carol
        .recv_until(|m| m.get("pres").map_or(false, |p| p["what"] == "msg"))
        .await;
    assert_eq!(pres["pres"]["topic"], "me");
    assert_eq!(pres["pres"]["src"], grp.as_str());
    assert_eq!(pres["pres"]["what"], "msg");
    assert_eq!(pres["pres"]["seq"], Value::from(1));

    // The push receipt covers both recipients with delivery counts.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let receipts = server.receipts.lock();
    let rcpt = receipts
        .iter()
        .find(|r| r.payload.what == "msg")
        .expect("no push receipt");
    assert_eq!(rcpt.payload.seq_id, 1);
    assert_eq!(rcpt.to.len(), 2); // bob and carol, not the sender
}

#[tokio::test]
async fn hard_delete_advances_the_watermark() {
    let server = TestServer::new();
    let (mut alice, _alice_uid) = server.signup("alice").await;

    let ctrl = alice.request(sub("new")).await;
    let grp = ctrl["ctrl"]["topic"].as_str().unwrap().to_string();
    alice.wait_attached(&grp).await;

    for i in 1..=9 {
        alice.send(publish(&grp, &format!("m{i}"))).await;
        let ack = alice.recv_until(|m| m.get("ctrl").is_some()).await;
        assert_eq!(ack["ctrl"]["params"]["seq"], Value::from(i));
    }

    let ctrl = alice
        .request(ClientMessage {
            del: Some(ClientDel {
                id: "del1".into(),
                topic: grp.clone(),
                what: "msg".into(),
                before: Some(5),
                hard: true,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));

    let stored = server.globals.store.topic_get(&grp).await.unwrap().unwrap();
    assert_eq!(stored.clear_id, 5);

    // Replay only returns messages above the watermark.
    alice
        .send(ClientMessage {
            get: Some(ClientGet {
                id: "get1".into(),
                topic: grp.clone(),
                query: GetQuery {
                    what: "data".into(),
                    ..Default::default()
                },
            }),
            ..Default::default()
        })
        .await;
    let mut seqs = Vec::new();
    loop {
        let msg = alice.recv().await;
        if let Some(data) = msg.get("data") {
            seqs.push(data["seq"].as_u64().unwrap());
            continue;
        }
        assert_eq!(msg["ctrl"]["params"]["count"], Value::from(4));
        break;
    }
    assert_eq!(seqs, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn ownership_transfer_is_atomic() {
    let server = TestServer::new();
    let (mut alice, alice_uid) = server.signup("alice").await;
    let (mut bob, bob_uid) = server.signup("bob").await;

    let ctrl = alice.request(sub("new")).await;
    let grp = ctrl["ctrl"]["topic"].as_str().unwrap().to_string();
    alice.wait_attached(&grp).await;

    let ctrl = bob.request(sub(&grp)).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    bob.wait_attached(&grp).await;

    // Step 1: the owner grants bob the full mode including O.
    let ctrl = alice
        .request(ClientMessage {
            set: Some(ClientSet {
                id: "set1".into(),
                topic: grp.clone(),
                query: SetQuery {
                    sub: Some(SetSub {
                        user: bob_uid.user_id(),
                        mode: "RWPSDO".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200), "grant failed: {ctrl}");

    // Step 2: bob accepts by raising his own want to include O.
    bob.send(ClientMessage {
        set: Some(ClientSet {
            id: "set2".into(),
            topic: grp.clone(),
            query: SetQuery {
                sub: Some(SetSub {
                    mode: "RWPSDO".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }),
        ..Default::default()
    })
    .await;
    let ctrl = bob.recv_until(|m| m.get("ctrl").is_some()).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200), "accept failed: {ctrl}");

    let store = &server.globals.store;
    let alice_sub = store.sub_get(&grp, alice_uid).await.unwrap().unwrap();
    let bob_sub = store.sub_get(&grp, bob_uid).await.unwrap().unwrap();
    assert!(bob_sub.effective().is_owner(), "bob must own the topic");
    assert!(
        !alice_sub.mode_want.is_owner() && !alice_sub.mode_given.is_owner(),
        "the previous owner must lose O atomically: {alice_sub:?}"
    );
}

#[tokio::test]
async fn read_notes_move_counters_monotonically() {
    let server = TestServer::new();
    let (mut alice, _) = server.signup("alice").await;
    let (mut bob, bob_uid) = server.signup("bob").await;

    let ctrl = alice.request(sub("new")).await;
    let grp = ctrl["ctrl"]["topic"].as_str().unwrap().to_string();
    alice.wait_attached(&grp).await;
    bob.request(sub(&grp)).await;
    bob.wait_attached(&grp).await;

    for i in 1..=3 {
        alice.send(publish(&grp, &format!("m{i}"))).await;
        alice.recv_until(|m| m.get("ctrl").is_some()).await;
    }

    // Bob reports read=2, then a stale read=1 which must be ignored.
    for seq in [2u64, 1] {
        bob.send(ClientMessage {
            note: Some(ClientNote {
                topic: grp.clone(),
                what: "read".into(),
                seq,
                unread: 0,
            }),
            ..Default::default()
        })
        .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sub_row = server
        .globals
        .store
        .sub_get(&grp, bob_uid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub_row.read_seq_id, 2);
    // read implies recv.
    assert!(sub_row.recv_seq_id >= sub_row.read_seq_id);
}

#[tokio::test]
async fn leave_and_unsub_tie_breaks() {
    let server = TestServer::new();
    let (mut alice, _) = server.signup("alice").await;

    // Leaving a never-joined topic without unsub: no-op 304.
    let ctrl = alice
        .request(ClientMessage {
            leave: Some(ClientLeave {
                id: "lv1".into(),
                topic: "grpNoSuchTopicA".into(),
                unsub: false,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(304));

    // Unsubscribing without attaching first: 409.
    let ctrl = alice
        .request(ClientMessage {
            leave: Some(ClientLeave {
                id: "lv2".into(),
                topic: "grpNoSuchTopicA".into(),
                unsub: true,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(409));

    // 'me' cannot be unsubscribed, only left.
    let ctrl = alice.request(sub("me")).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    let ctrl = alice
        .request(ClientMessage {
            leave: Some(ClientLeave {
                id: "lv3".into(),
                topic: "me".into(),
                unsub: true,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(405));

    // Subscribing twice is a no-op 304.
    let ctrl = alice.request(sub("me")).await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(304));
}

#[tokio::test]
async fn duplicate_account_is_409() {
    let server = TestServer::new();
    let (_alice, _) = server.signup("alice").await;

    let mut imposter = server.client();
    imposter.request(hi()).await;
    let ctrl = imposter
        .request(ClientMessage {
            acc: Some(ClientAcc {
                id: "acc2".into(),
                user: "new".into(),
                scheme: "basic".into(),
                secret: "alice:other00".into(),
                login: true,
                ..Default::default()
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(409));
    assert_eq!(ctrl["ctrl"]["text"], "duplicate credential");
}

#[tokio::test]
async fn login_returns_a_usable_token() {
    let server = TestServer::new();
    let (client, uid) = server.signup("alice").await;
    drop(client);

    let mut again = server.client();
    again.request(hi()).await;
    let ctrl = again
        .request(ClientMessage {
            login: Some(palaver_server::wire::ClientLogin {
                id: "lg1".into(),
                scheme: "basic".into(),
                secret: "alice:secret99".into(),
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    let token = ctrl["ctrl"]["params"]["token"].as_str().unwrap().to_string();

    // The issued token logs in a third session by itself.
    let mut third = server.client();
    third.request(hi()).await;
    let ctrl = third
        .request(ClientMessage {
            login: Some(palaver_server::wire::ClientLogin {
                id: "lg2".into(),
                scheme: "token".into(),
                secret: token,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ctrl["ctrl"]["code"], Value::from(200));
    assert_eq!(
        ctrl["ctrl"]["params"]["user"].as_str().unwrap(),
        uid.user_id()
    );
}

#[tokio::test]
async fn rehash_tears_down_moved_proxies() {
    // Three configured nodes; no real peers are running, which is fine:
    // the proxy forward fails with 502 but the registry behavior is real.
    let cfg = ClusterConfig {
        this_name: "one".into(),
        nodes: vec![
            ClusterNodeConfig {
                name: "one".into(),
                addr: "127.0.0.1:18881".into(),
            },
            ClusterNodeConfig {
                name: "two".into(),
                addr: "127.0.0.1:18882".into(),
            },
            ClusterNodeConfig {
                name: "three".into(),
                addr: "127.0.0.1:18883".into(),
            },
        ],
        failover: None,
    };
    let cluster = Cluster::from_config(&cfg, "").unwrap();

    // Find a group name owned by a remote node.
    let remote_grp = (0..10_000)
        .map(|i| format!("grpRehash{i}"))
        .find(|name| cluster.is_remote_topic(name))
        .unwrap();

    let server = TestServer::with_cluster(Some(cluster.clone()));
    let (mut alice, _) = server.signup("alice").await;

    // Subscribing creates a proxy topic; the master is unreachable so the
    // session is told the cluster is down, but the proxy exists.
    alice.send(sub(&remote_grp)).await;
    let reply = alice.recv_until(|m| m.get("ctrl").is_some()).await;
    assert_eq!(reply["ctrl"]["code"], Value::from(502));

    // Wait for the proxy registration to settle.
    let mut registered = false;
    for _ in 0..100 {
        if let Some(handle) = server.globals.hub.topic_get(&remote_grp) {
            assert!(handle.is_proxy);
            assert_ne!(handle.master_node, "one");
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(registered, "proxy topic never registered");

    // Shrink the ring to this node only: every remote topic moves.
    cluster.rehash(Some(vec!["one".into()]));
    server.globals.hub.rehash.send(()).await.unwrap();

    for _ in 0..100 {
        if server.globals.hub.topic_get(&remote_grp).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("proxy topic survived the rehash");
}
