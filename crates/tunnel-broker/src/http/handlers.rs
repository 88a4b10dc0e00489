//! Tunnel upgrade and read-only admin endpoints.

use crate::adapters::ws;
use crate::domain::ChannelId;
use crate::http::AppState;
use crate::tunnel::TunnelHandler;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::atomic::Ordering;
use tracing::debug;

/// `GET /tunnel`: upgrade and run one tunnel channel handler
pub async fn tunnel_upgrade(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let ctx = state.tunnel.clone();
    let codec = state.codec;

    upgrade.on_upgrade(move |socket| async move {
        let channel_id = ChannelId::next();
        debug!(channel_id = %channel_id, "Tunnel upgrade accepted");

        let (source, sink) = ws::split(socket, codec);
        TunnelHandler::new(ctx, channel_id).run(source, sink).await;
    })
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tunnel-broker",
        "version": env!("CARGO_PKG_VERSION"),
        "workers": state.registry().len(),
        "pending": state.pending().pending_count(),
    }))
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let pending = state.pending();
    let table = pending.stats();

    let mut body = state.stats.to_json();
    body["workers"] = serde_json::json!(state.registry().len());
    body["pending"] = serde_json::json!({
        "count": pending.pending_count(),
        "max": pending.max_pending(),
        "created": table.total_created.load(Ordering::Relaxed),
        "fulfilled": table.total_fulfilled.load(Ordering::Relaxed),
        "timeouts": table.total_timeouts.load(Ordering::Relaxed),
        "disconnected": table.total_disconnected.load(Ordering::Relaxed),
        "cancelled": table.total_cancelled.load(Ordering::Relaxed),
        "unknown_responses": table.total_unknown.load(Ordering::Relaxed),
        "rejected": table.total_rejected.load(Ordering::Relaxed),
    });

    Json(body)
}

/// `GET /workers`
pub async fn workers(State(state): State<AppState>) -> impl IntoResponse {
    let workers = state.registry().snapshot();
    Json(serde_json::json!({
        "count": workers.len(),
        "workers": workers,
    }))
}
