//! Broker service - wires registry, pending table, gateway, sweeper and HTTP.

use crate::domain::{BrokerConfig, BrokerError};
use crate::gateway::InboundGateway;
use crate::http::{self, AppState};
use crate::sweeper::HeartbeatSweeper;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Tunnel broker service
pub struct BrokerService {
    config: BrokerConfig,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerService {
    /// Create a new broker service
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;

        let state = AppState::new(&config);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            state,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Gateway for in-process dispatch
    pub fn gateway(&self) -> &InboundGateway {
        &self.state.gateway
    }

    /// Router serving every broker route
    pub fn router(&self) -> Router {
        http::router(self.state.clone(), &self.config)
    }

    /// Start the heartbeat sweeper; it stops on shutdown
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = HeartbeatSweeper::new(
            Arc::clone(self.state.registry()),
            Arc::clone(self.state.pending()),
            self.config.tunnel.sweep_interval,
            self.config.tunnel.staleness_threshold,
        );
        tokio::spawn(sweeper.run(self.shutdown_tx.subscribe()))
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            max_pending = self.config.dispatch.max_pending,
            staleness_secs = self.config.tunnel.staleness_threshold.as_secs(),
            "Tunnel broker listening"
        );

        let sweeper = self.spawn_sweeper();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let state = self.state.clone();
        let shutdown = async move {
            while !*shutdown_rx.borrow_and_update() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("Received shutdown signal");
            close_all_workers(&state);
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Err(e) = sweeper.await {
            warn!(error = %e, "Sweeper task failed");
        }

        info!("Tunnel broker stopped");
        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Force-close every tunnel; handlers then fail their pending requests
fn close_all_workers(state: &AppState) {
    let registry = state.registry();
    for info in registry.snapshot() {
        if let Some(handle) = registry.get(&info.worker_id) {
            handle.close();
        }
    }
}
