//! Public HTTP surface.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /tunnel` | WebSocket upgrade for workers |
//! | `ANY /forward/*path` | Forward a request through a worker |
//! | `GET /health` | Liveness plus worker and pending counts |
//! | `GET /stats` | Broker counters |
//! | `GET /workers` | Registry snapshot |
//!
//! Tunnel upgrades and public requests share one listener.

pub mod forward;
pub mod handlers;

use crate::adapters::FrameCodec;
use crate::domain::{BrokerConfig, ConnectionRegistry, PendingRequestTable};
use crate::gateway::InboundGateway;
use crate::stats::BrokerStats;
use crate::tunnel::TunnelContext;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Header selecting the target worker (`latest` or a worker ID)
pub const WORKER_HEADER: &str = "x-tunnel-worker";
/// Header carrying a per-request timeout in milliseconds
pub const TIMEOUT_HEADER: &str = "x-tunnel-timeout-ms";
/// Correlation ID of a forwarded request
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Time the broker spent on a request
pub const RESPONSE_TIME_HEADER: &str = "x-response-time";

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub gateway: InboundGateway,
    pub tunnel: TunnelContext,
    pub codec: FrameCodec,
    pub stats: Arc<BrokerStats>,
}

impl AppState {
    /// Build fresh broker state from configuration
    pub fn new(config: &BrokerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let pending = Arc::new(PendingRequestTable::new(config.dispatch.max_pending));
        let stats = Arc::new(BrokerStats::new());

        let gateway = InboundGateway::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            config.dispatch.clone(),
            Arc::clone(&stats),
        );
        let tunnel = TunnelContext {
            registry,
            pending,
            stats: Arc::clone(&stats),
            config: config.tunnel.clone(),
        };

        Self {
            gateway,
            tunnel,
            codec: FrameCodec::new(config.tunnel.max_frame_size),
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.tunnel.registry
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.tunnel.pending
    }
}

/// Build the broker router
pub fn router(state: AppState, config: &BrokerConfig) -> Router {
    let forward_routes = Router::new()
        .route("/forward", any(forward::forward))
        .route("/forward/*path", any(forward::forward))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.limits.max_body_size));

    let router = Router::new()
        .route("/tunnel", get(handlers::tunnel_upgrade))
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/workers", get(handlers::workers))
        .merge(forward_routes)
        .layer(TraceLayer::new_for_http());

    let router = if config.server.cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    router.with_state(state)
}
