//! # Transport Ports
//!
//! The broker core never sees sockets. A tunnel channel is handed to the
//! handler as a pair of halves: a [`FrameSource`] producing decoded frames in
//! arrival order and a [`FrameSink`] accepting frames to write. WebSocket,
//! in-memory and any future framing all plug in here.
//!
//! # Thread Safety
//!
//! Each half is owned by exactly one task (the reader or the writer), so the
//! traits only require `Send`.

use crate::domain::{Frame, TransportError};
use async_trait::async_trait;

/// Inbound half of a tunnel channel
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame in arrival order.
    ///
    /// `None` means the peer closed the channel cleanly. An `Err` is a read
    /// or decode failure; either way the channel is finished.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Outbound half of a tunnel channel
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the channel. Best effort.
    async fn close(&mut self);
}
