pub mod auth;
pub mod cluster;
pub mod config;
pub mod hub;
pub mod presence;
pub mod push;
pub mod session;
pub mod store;
pub mod topic;
pub mod wire;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;

use palaver_common::UidGenerator;

use auth::AuthRegistry;
use cluster::{Cluster, ClusterError, UserCacheReq};
use hub::{Hub, HubReceivers, MetaReq, SessionJoin, SessionLeave};
use push::{Push, Receipt};
use session::SessionStore;
use store::Store;
use wire::ServerMessage;

/// Knobs every component reads at runtime.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Build tag reported in the `{hi}` response.
    pub build: String,
    /// Decoded API-key salt; empty disables the handshake check.
    pub api_key_salt: Vec<u8>,
    pub max_subscriber_count: usize,
    pub max_tag_count: usize,
    /// Quiet window before an idle topic unloads.
    pub topic_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            build: env!("CARGO_PKG_VERSION").to_string(),
            api_key_salt: Vec::new(),
            max_subscriber_count: 32,
            max_tag_count: 16,
            topic_timeout: Duration::from_secs(240),
        }
    }
}

/// Shared server state, assembled once in `main` and injected everywhere.
pub struct Globals {
    pub hub: Hub,
    pub store: Store,
    pub push: Push,
    pub auth: AuthRegistry,
    pub cluster: Option<Arc<Cluster>>,
    pub sessions: SessionStore,
    pub uid_gen: UidGenerator,
    pub run: RuntimeConfig,
}

impl Globals {
    /// Assemble the shared state. The caller must spawn `hub::run` with the
    /// returned receivers, and `Cluster::start` if clustered.
    pub fn new(
        store: Store,
        auth: AuthRegistry,
        push: Push,
        cluster: Option<Arc<Cluster>>,
        worker_id: u16,
        run: RuntimeConfig,
    ) -> (Arc<Globals>, HubReceivers) {
        let (hub, receivers) = Hub::new();
        let globals = Arc::new(Globals {
            hub,
            store,
            push,
            auth,
            cluster,
            sessions: SessionStore::new(),
            uid_gen: UidGenerator::new(worker_id),
            run,
        });
        (globals, receivers)
    }

    /// True when the ring maps the topic to another node.
    pub fn is_remote_topic(&self, topic: &str) -> bool {
        self.cluster
            .as_ref()
            .map(|c| c.is_remote_topic(topic))
            .unwrap_or(false)
    }

    /// Generate a fresh group-topic name owned by this node.
    pub fn gen_local_topic_name(&self) -> String {
        loop {
            let mut raw = [0u8; 8];
            rand::thread_rng().fill(&mut raw);
            let name = format!("grp{}", URL_SAFE_NO_PAD.encode(raw));
            if !self.is_remote_topic(&name) {
                return name;
            }
        }
    }

    // -----------------------------------------------------------------
    // Cluster forwarding. All of these are no-ops-with-errors on a
    // standalone server; proxy topics only exist when clustered.
    // -----------------------------------------------------------------

    fn cluster_or_err(&self) -> Result<&Arc<Cluster>, ClusterError> {
        self.cluster
            .as_ref()
            .ok_or_else(|| ClusterError::Internal("cluster not initialized".into()))
    }

    pub async fn forward_join_to_master(
        &self,
        topic: &str,
        sreg: &SessionJoin,
    ) -> Result<(), ClusterError> {
        self.cluster_or_err()?.forward_join(topic, sreg).await
    }

    pub async fn forward_leave_to_master(
        &self,
        topic: &str,
        leave: &SessionLeave,
    ) -> Result<(), ClusterError> {
        self.cluster_or_err()?.forward_leave(topic, leave).await
    }

    pub async fn forward_meta_to_master(
        &self,
        topic: &str,
        meta: &MetaReq,
    ) -> Result<(), ClusterError> {
        self.cluster_or_err()?.forward_meta(topic, meta).await
    }

    pub async fn forward_broadcast_to_master(
        &self,
        topic: &str,
        msg: ServerMessage,
    ) -> Result<(), ClusterError> {
        self.cluster_or_err()?.forward_broadcast(topic, msg).await
    }

    pub async fn notify_proxy_gone(&self, topic: &str) -> Result<(), ClusterError> {
        self.cluster_or_err()?.proxy_gone(topic).await
    }

    pub async fn route_to_remote(&self, msg: ServerMessage) -> Result<(), ClusterError> {
        self.cluster_or_err()?.route(msg).await
    }

    /// Deliver a push receipt, splitting it by which node owns each
    /// recipient's `me` topic.
    pub async fn push_receipt(&self, rcpt: Receipt) {
        let Some(cluster) = &self.cluster else {
            self.push.push(rcpt);
            return;
        };

        let mut local = Receipt {
            payload: rcpt.payload.clone(),
            to: Default::default(),
        };
        let mut remote: std::collections::HashMap<String, Receipt> = Default::default();

        for (uid, recipient) in rcpt.to {
            let me = uid.user_id();
            if cluster.is_remote_topic(&me) {
                let owner = cluster.node_for(&me);
                remote
                    .entry(owner)
                    .or_insert_with(|| Receipt {
                        payload: rcpt.payload.clone(),
                        to: Default::default(),
                    })
                    .to
                    .insert(uid, recipient);
            } else {
                local.to.insert(uid, recipient);
            }
        }

        if !local.to.is_empty() {
            self.push.push(local);
        }
        for (node, receipt) in remote {
            let user_id = receipt
                .to
                .keys()
                .next()
                .copied()
                .expect("non-empty by construction");
            let req = UserCacheReq {
                node: String::new(),
                user_id,
                gone: false,
                push_rcpt: Some(receipt),
            };
            if let Err(err) = cluster.user_cache_update(req).await {
                tracing::warn!(%node, ?err, "remote push receipt failed");
            }
        }
    }
}

// Re-exported for integration tests and the binary.
pub use session::{Outbound, Session, SessionCtl, SessionProto, SessionRef};
