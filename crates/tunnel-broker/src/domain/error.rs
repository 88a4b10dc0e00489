//! Broker error types.
//!
//! Internal errors stay inside the layer that raised them. Callers of the
//! gateway only ever see [`DispatchError`], whose `code()` strings are the
//! public failure vocabulary.

use crate::domain::ids::{ChannelId, RequestId, WorkerId};
use std::fmt;
use thiserror::Error;

/// Public failure codes
pub mod codes {
    pub const NO_WORKER_AVAILABLE: &str = "no_worker_available";
    pub const TIMEOUT: &str = "timeout";
    pub const WORKER_DISCONNECTED: &str = "worker_disconnected";
    pub const OVERLOADED: &str = "overloaded";
}

/// Connection registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("channel {0} is already registered")]
    DuplicateChannel(ChannelId),
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),
    #[error("no worker available")]
    NoWorkerAvailable,
}

/// Pending request table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("pending request limit reached ({limit})")]
    Overloaded { limit: usize },
}

/// Terminal error placed into a result slot by the broker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Timeout,
    WorkerDisconnected,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Timeout => f.write_str("timeout"),
            Termination::WorkerDisconnected => f.write_str("worker disconnected"),
        }
    }
}

/// Tunnel protocol violations. Fatal to one channel, never to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("expected register, got {0}")]
    NotRegistered(&'static str),
    #[error("no register frame within {0:?}")]
    RegistrationTimeout(std::time::Duration),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Frame encoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("binary frame is not valid utf-8")]
    NotUtf8,
}

/// Transport-level failures on a tunnel channel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("transport i/o failed: {0}")]
    Io(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Outcome of a failed dispatch, as seen by the external caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no worker available")]
    NoWorkerAvailable,
    #[error("too many pending requests")]
    Overloaded,
    #[error("request {request_id} timed out")]
    Timeout { request_id: RequestId },
    #[error("worker disconnected before answering request {request_id}")]
    WorkerDisconnected { request_id: RequestId },
}

impl DispatchError {
    /// Stable public code
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NoWorkerAvailable => codes::NO_WORKER_AVAILABLE,
            DispatchError::Overloaded => codes::OVERLOADED,
            DispatchError::Timeout { .. } => codes::TIMEOUT,
            DispatchError::WorkerDisconnected { .. } => codes::WORKER_DISCONNECTED,
        }
    }

    /// Correlation ID, when one was allocated before the failure
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            DispatchError::Timeout { request_id }
            | DispatchError::WorkerDisconnected { request_id } => Some(*request_id),
            DispatchError::NoWorkerAvailable | DispatchError::Overloaded => None,
        }
    }

    pub(crate) fn terminated(request_id: RequestId, termination: Termination) -> Self {
        match termination {
            Termination::Timeout => DispatchError::Timeout { request_id },
            Termination::WorkerDisconnected => DispatchError::WorkerDisconnected { request_id },
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(_: RegistryError) -> Self {
        // Every registry failure on the dispatch path means no routable worker.
        DispatchError::NoWorkerAvailable
    }
}

impl From<PendingError> for DispatchError {
    fn from(e: PendingError) -> Self {
        match e {
            PendingError::Overloaded { .. } => DispatchError::Overloaded,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("sweep interval {sweep:?} must be smaller than staleness threshold {staleness:?}")]
    SweepTooSlow {
        sweep: std::time::Duration,
        staleness: std::time::Duration,
    },
    #[error("failed to read config: {0}")]
    Read(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Service-level errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
