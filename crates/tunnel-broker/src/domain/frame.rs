//! Tunnel frames.
//!
//! Wire shape (JSON, internally tagged by `type`):
//!
//! ```text
//! worker -> broker   {"type":"register","metadata":{..}}
//! broker -> worker   {"type":"register_ack","worker_id":"w1"}
//! broker -> worker   {"type":"forward_request","request_id":"..","payload":..}
//! worker -> broker   {"type":"forward_response","request_id":"..","payload":..}
//!                    {"type":"forward_response","request_id":"..","error":".."}
//! worker -> broker   {"type":"heartbeat"}
//! broker -> worker   {"type":"heartbeat_ack"}
//! ```

use crate::domain::ids::{RequestId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque key-value metadata supplied by a worker at registration.
pub type WorkerMetadata = HashMap<String, String>;

/// One discrete message on a tunnel channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register {
        #[serde(default)]
        metadata: WorkerMetadata,
    },
    RegisterAck {
        worker_id: WorkerId,
    },
    ForwardRequest {
        request_id: RequestId,
        payload: serde_json::Value,
    },
    ForwardResponse {
        /// Raw ID as echoed by the worker. An ID the broker never issued,
        /// UUID or not, must reach the unknown-response path, not fail decoding.
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat {},
    HeartbeatAck {},
}

/// A delivered worker response.
///
/// Both variants are responses the worker actually sent; neither is a
/// broker-side failure.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Payload(serde_json::Value),
    Failed(String),
}

impl Frame {
    /// Short frame kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::RegisterAck { .. } => "register_ack",
            Frame::ForwardRequest { .. } => "forward_request",
            Frame::ForwardResponse { .. } => "forward_response",
            Frame::Heartbeat {} => "heartbeat",
            Frame::HeartbeatAck {} => "heartbeat_ack",
        }
    }

    pub fn heartbeat() -> Self {
        Frame::Heartbeat {}
    }

    pub fn heartbeat_ack() -> Self {
        Frame::HeartbeatAck {}
    }

    /// Successful worker response
    pub fn response(request_id: RequestId, payload: serde_json::Value) -> Self {
        Frame::ForwardResponse {
            request_id: request_id.to_string(),
            payload: Some(payload),
            error: None,
        }
    }

    /// Worker-reported failure
    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Frame::ForwardResponse {
            request_id: request_id.to_string(),
            payload: None,
            error: Some(error.into()),
        }
    }
}

impl WorkerReply {
    /// Build from the optional fields of a `forward_response` frame.
    ///
    /// An `error` field wins over `payload`; a response with neither
    /// carries a null payload.
    pub fn from_parts(payload: Option<serde_json::Value>, error: Option<String>) -> Self {
        match error {
            Some(message) => WorkerReply::Failed(message),
            None => WorkerReply::Payload(payload.unwrap_or(serde_json::Value::Null)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerReply::Failed(_))
    }
}
