//! HTTP surface: the WebSocket upgrade endpoint and a health check.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt, future};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::connection;
use crate::identity::AcquireError;
use crate::server::SharedState;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route(&state.config.ws_path, get(ws_upgrade))
        .route("/ping", get(ping))
        // Browser clients connect from arbitrary origins.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── WebSocket handler ──────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Response {
    if state.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, "node is shutting down").into_response();
    }
    let client_ip = forwarded_for(&headers).unwrap_or_else(|| addr.ip().to_string());
    let lease = match state.identities.lease().await {
        Ok(lease) => lease,
        Err(AcquireError::Exhausted) => {
            tracing::warn!(%client_ip, "WebSocket connection rejected: identity pool exhausted");
            return (StatusCode::SERVICE_UNAVAILABLE, "no identities available").into_response();
        }
        Err(e) => {
            tracing::error!(%client_ip, "Identity acquisition failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    // If the upgrade never completes the lease is dropped with the closure
    // and the identity goes back to the pool.
    ws.on_failed_upgrade(|e| tracing::warn!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| {
            let tracker = state.connections.clone();
            tracker.track_future(handle_ws(socket, state, lease, client_ip))
        })
        .into_response()
}

async fn handle_ws(
    socket: WebSocket,
    state: Arc<SharedState>,
    lease: crate::identity::Lease,
    client_ip: String,
) {
    let (sink, stream) = socket.split();
    let writer = sink.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });
    let reader = stream.filter_map(|frame| {
        future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
            // Ping/pong are answered by the socket; a close frame is
            // followed by end of stream.
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });
    connection::serve(state, lease, writer, reader, client_ip).await;
}

/// First address in `X-Forwarded-For`, if any.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    node_id: String,
    connections: usize,
    open_channels: usize,
    draining: bool,
    uptime_secs: u64,
}

async fn ping(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: state.node_id.clone(),
        connections: state.registry.len(),
        open_channels: state.bridge.open_channels().len(),
        draining: state.is_draining(),
        uptime_secs: state.uptime().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers), None);

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(forwarded_for(&headers).as_deref(), Some("203.0.113.9"));

        headers.insert("x-forwarded-for", HeaderValue::from_static(" "));
        assert_eq!(forwarded_for(&headers), None);
    }
}
