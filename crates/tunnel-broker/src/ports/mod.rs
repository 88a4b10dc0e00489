//! Ports: the boundary between broker logic and concrete transports.

pub mod transport;

pub use transport::{FrameSink, FrameSource};
