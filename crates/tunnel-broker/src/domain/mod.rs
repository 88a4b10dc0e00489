//! Domain types for the tunnel broker.
//!
//! Identifiers, frames, errors and configuration, plus the two shared
//! structures every task goes through: the connection registry and the
//! pending request table.

pub mod config;
pub mod error;
pub mod frame;
pub mod ids;
pub mod pending;
pub mod registry;
pub mod worker;

// Re-exports for convenience
pub use config::{BrokerConfig, DispatchConfig, LimitsConfig, ServerConfig, TunnelConfig};
pub use error::{
    BrokerError, CodecError, ConfigError, DispatchError, PendingError, ProtocolError,
    RegistryError, Termination, TransportError,
};
pub use frame::{Frame, WorkerMetadata, WorkerReply};
pub use ids::{ChannelId, RequestId, WorkerId};
pub use pending::{PendingRequestTable, PendingStats, SlotResult};
pub use registry::{ConnectionRegistry, TargetSelector};
pub use worker::{WorkerHandle, WorkerInfo};
