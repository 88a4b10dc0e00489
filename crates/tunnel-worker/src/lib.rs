//! # Tunnel Worker
//!
//! The reverse side of the tunnel. A worker sits behind NAT or on a
//! changing address, dials out to the broker's `/tunnel` endpoint, and
//! serves whatever the broker forwards over that channel.
//!
//! ```text
//! broker ──forward_request──► WorkerClient ──► RequestHandler
//!        ◄─forward_response──              ◄──
//! ```
//!
//! [`HttpForwardHandler`] replays forwarded HTTP envelopes against a local
//! service. Implement [`RequestHandler`] to serve requests any other way.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod http_forward;

pub use client::{RequestHandler, SessionEnd, WorkerClient, WorkerError, WorkerEvent};
pub use config::WorkerConfig;
pub use http_forward::{HttpForwardHandler, LocalRequest};
