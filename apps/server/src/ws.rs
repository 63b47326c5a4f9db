//! WebSocket transport: upgrade handler and the per-connection read/write
//! tasks feeding a `Session`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::auth::apikey::check_api_key;
use crate::session::{Outbound, Session, SessionCtl, SessionProto, SEND_QUEUE_DEPTH};
use crate::Globals;

pub fn router() -> Router<Arc<Globals>> {
    Router::new()
        .route("/v0/channels", get(ws_upgrade))
        .route("/health", get(health))
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(globals): State<Arc<Globals>>,
) -> impl IntoResponse {
    if !globals.run.api_key_salt.is_empty() {
        let apikey = params.get("apikey").map(String::as_str).unwrap_or("");
        let (valid, _is_root) = check_api_key(&globals.run.api_key_salt, apikey);
        if !valid {
            tracing::debug!(%remote, "connection rejected: invalid api key");
            return (StatusCode::FORBIDDEN, "valid API key required").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_connection(socket, globals, remote))
        .into_response()
}

async fn handle_connection(socket: WebSocket, globals: Arc<Globals>, remote: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(SEND_QUEUE_DEPTH);
    let (ctl_tx, mut ctl_rx) = mpsc::channel::<SessionCtl>(32);

    let mut session = Session::new(
        globals.clone(),
        SessionProto::Websocket,
        remote.to_string(),
        send_tx,
        ctl_tx,
    );
    globals.sessions.insert(session.session_ref());

    tracing::info!(sid = %session.sid, %remote, "session started");

    // Writer: drain the outbound queue onto the socket.
    let write_task = tokio::spawn(async move {
        while let Some(out) = send_rx.recv().await {
            let text = match out {
                Outbound::Serialized(s) => s.as_ref().clone(),
                Outbound::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::error!(?err, "outbound serialization failed");
                        continue;
                    }
                },
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader: client packets and topic control messages. Control is
    // drained first so an Attached lands before the next client command.
    loop {
        tokio::select! {
            biased;

            ctl = ctl_rx.recv() => {
                match ctl {
                    Some(ctl) => {
                        if !session.handle_ctl(ctl).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        session.dispatch_raw(&text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(sid = %session.sid, ?err, "ws read error");
                        break;
                    }
                }
            }
        }
    }

    session.cleanup().await;
    write_task.abort();

    tracing::info!(sid = %session.sid, "session ended");
}
