//! Per-channel tunnel protocol.

pub mod handler;

pub use handler::{spawn, ChannelState, CloseReason, TunnelContext, TunnelHandler};
