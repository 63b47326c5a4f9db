use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use rand::Rng;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use palaver_server::auth::basic::BasicAuth;
use palaver_server::auth::token::TokenAuth;
use palaver_server::auth::AuthRegistry;
use palaver_server::cluster::Cluster;
use palaver_server::config::Config;
use palaver_server::push::{LogHandler, Push};
use palaver_server::store::mem::MemAdapter;
use palaver_server::store::Store;
use palaver_server::{hub, ws, Globals, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "palaver-server", about = "Palaver instant-messaging server")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "palaver.conf")]
    config: PathBuf,
    /// Override the listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
    /// Override the cluster node name from the config file.
    #[arg(long = "cluster-self")]
    cluster_self: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "configuration error");
            std::process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    // Storage adapter. Only the in-memory adapter ships in-tree; anything
    // else is a packaging problem, not a runtime one.
    if config.store_config.adapter != "mem" {
        tracing::error!(adapter = %config.store_config.adapter, "unknown storage adapter");
        std::process::exit(1);
    }
    let store = Store::new(Arc::new(MemAdapter::new()));
    tracing::info!(adapter = store.adapter().name(), "store opened");

    // Authenticators.
    let token_key = if config.auth_token.key.is_empty() {
        tracing::warn!("auth_token.key not configured, generating an ephemeral one");
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill(&mut key[..]);
        key
    } else {
        match STANDARD.decode(&config.auth_token.key) {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(?err, "auth_token.key is not valid base64");
                std::process::exit(1);
            }
        }
    };
    let token_auth = match TokenAuth::new(
        token_key,
        config.auth_token.expire_in,
        config.auth_token.serial_num,
    ) {
        Ok(auth) => auth,
        Err(err) => {
            tracing::error!(?err, "token authenticator init failed");
            std::process::exit(1);
        }
    };
    let mut auth = AuthRegistry::new();
    auth.register("token", Arc::new(token_auth));
    auth.register("basic", Arc::new(BasicAuth::new(store.clone())));

    // Push backends.
    let mut push = Push::new();
    for backend in &config.push {
        match backend.name.as_str() {
            "log" => push.register(LogHandler::spawn()),
            other => tracing::warn!(name = other, "unknown push backend skipped"),
        }
    }

    // Cluster; `None` means standalone.
    let cluster = Cluster::from_config(
        &config.cluster,
        args.cluster_self.as_deref().unwrap_or(""),
    );
    let worker_id = cluster.as_ref().map(|c| worker_ordinal(c)).unwrap_or(1);

    let api_key_salt = if config.api_key_salt.is_empty() {
        Vec::new()
    } else {
        match STANDARD.decode(&config.api_key_salt) {
            Ok(salt) => salt,
            Err(err) => {
                tracing::error!(?err, "api_key_salt is not valid base64");
                std::process::exit(1);
            }
        }
    };

    let run = RuntimeConfig {
        build: env!("CARGO_PKG_VERSION").to_string(),
        api_key_salt,
        max_subscriber_count: config.max_subscriber_count,
        max_tag_count: config.max_tag_count,
        topic_timeout: Duration::from_secs(config.topic_timeout_secs),
    };

    let (globals, hub_rx) = Globals::new(store, auth, push, cluster.clone(), worker_id, run);
    tokio::spawn(hub::run(globals.clone(), hub_rx));

    if let Some(cluster) = &cluster {
        cluster.start(globals.clone());
    }

    let app = axum::Router::new()
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .with_state(globals.clone());

    let addr: SocketAddr = match config.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(listen = %config.listen, ?err, "invalid listen address");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, ?err, "failed to bind");
            std::process::exit(1);
        }
    };

    let shutdown_globals = globals.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");

        // Stop topics first so storage writes finish, then the sessions.
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if shutdown_globals.hub.shutdown.send(done_tx).await.is_ok() {
            match done_rx.await {
                Ok(count) => tracing::info!(topics = count, "topics drained"),
                Err(_) => tracing::warn!("hub exited without reporting"),
            }
        }
        shutdown_globals.sessions.shutdown_all().await;
        shutdown_globals.push.stop_all();
    });

    if let Err(err) = server.await {
        tracing::error!(?err, "server error");
    }
}

/// Stable worker ordinal of this node: its position in the sorted node
/// list, for snowflake uniqueness across the cluster.
fn worker_ordinal(cluster: &Arc<Cluster>) -> u16 {
    let mut names = cluster.node_names();
    names.push(cluster.this_node());
    names.sort();
    names
        .iter()
        .position(|n| *n == cluster.this_node())
        .map(|p| (p + 1) as u16)
        .unwrap_or(1)
}
