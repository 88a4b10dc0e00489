//! Tunnel Broker - forwards public requests to workers behind NAT.
//!
//! Workers dial out to the broker, register, and keep the channel open. The
//! broker hands every public request to one of them and waits for the
//! correlated reply.
//!
//! # Architecture
//!
//! ```text
//!   external caller                                      private worker
//!        │                                                     ▲
//!        │ ANY /forward/*path                   GET /tunnel    │ register / heartbeat
//!        ▼                                                     │ forward_response
//! ┌──────────────────┐   pick_available   ┌────────────────────┴──┐
//! │  Inbound Gateway │ ─────────────────→ │  Connection Registry  │
//! └───────┬──────────┘                    └────────────▲──────────┘
//!         │ create / await slot                        │ register / touch / remove
//!         ▼                                            │
//! ┌──────────────────┐      fulfill       ┌────────────┴──────────┐
//! │ Pending Request  │ ←───────────────── │ Tunnel Channel Handler│
//! │      Table       │  fail_all_for_...  │  (one per channel)    │
//! └───────▲──────────┘                    └────────────▲──────────┘
//!         │ remove_expired                             │ force close
//!         └──────────────── Heartbeat Sweeper ─────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tunnel_broker::{BrokerConfig, BrokerService};
//!
//! let service = BrokerService::new(BrokerConfig::default())?;
//! service.start().await?;
//! ```
//!
//! Only the registry and the pending table are shared between tasks. Sends
//! to a worker go through its bounded outbound queue, never under a lock.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod gateway;
pub mod http;
pub mod ports;
pub mod service;
pub mod stats;
pub mod sweeper;
pub mod tunnel;

// Re-exports for public API
pub use adapters::FrameCodec;
pub use domain::error::codes;
pub use domain::{
    BrokerConfig, BrokerError, ChannelId, ConnectionRegistry, DispatchError, Frame,
    PendingRequestTable, RequestId, TargetSelector, WorkerId, WorkerMetadata, WorkerReply,
};
pub use gateway::{Dispatched, InboundGateway};
pub use http::AppState;
pub use service::BrokerService;
pub use stats::BrokerStats;
pub use sweeper::{HeartbeatSweeper, SweepReport};
pub use tunnel::{CloseReason, TunnelContext, TunnelHandler};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
