//! Outbound surfaces.
//!
//! Two long-lived channels for downstream consumers:
//!   GET /ws/signals   → WebSocket, one JSON signal per text frame
//!   GET /sse/status   → SSE `status` events (§ status schema), `: ping` keep-alive
//!   GET /sse/snapshot → SSE `snapshot` events for UI observers
//!
//! The administrative API and UI serving live elsewhere; this router only
//! carries the signal and status channels.

use crate::app::Core;
use crate::sse;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/signals", get(ws_signals))
        .route("/sse/status", get(sse_status))
        .route("/sse/snapshot", get(sse_snapshot))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves. A bind failure is fatal and
/// propagates to the caller.
pub async fn serve<F>(state: AppState, bind: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = bind, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ws_signals(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signal_socket(socket, state))
}

/// Forward hub frames to the socket; read inbound frames only to detect a
/// dead peer. Either side failing ends the subscription.
async fn handle_signal_socket(socket: WebSocket, state: AppState) {
    let hub = Arc::clone(state.core.hub());
    let (id, mut rx) = hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // the hub already dropped us (stalled write)
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(_)) => {} // subscribers are push-only; ignore content
                _ => break,
            },
        }
    }

    hub.unsubscribe(id);
    debug!(subscriber = id, "signal socket closed");
}

async fn sse_status(State(state): State<AppState>) -> impl IntoResponse {
    Sse::new(sse::status_stream(state.core.clone())).keep_alive(
        KeepAlive::new()
            .interval(sse::KEEPALIVE_INTERVAL)
            .text("ping"),
    )
}

async fn sse_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Sse::new(sse::snapshot_stream(state.core.clone())).keep_alive(
        KeepAlive::new()
            .interval(sse::KEEPALIVE_INTERVAL)
            .text("ping"),
    )
}
