//! In-process tunnel transport.
//!
//! Connects a worker living in the same process (or a test) to a tunnel
//! handler without sockets. Worker-to-broker traffic travels as encoded text
//! so it goes through the same codec path as a real channel.

use crate::adapters::codec::FrameCodec;
use crate::domain::{Frame, TransportError};
use crate::ports::{FrameSink, FrameSource};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Broker-side inbound half
pub struct MemoryFrameSource {
    rx: mpsc::Receiver<String>,
    codec: FrameCodec,
}

/// Broker-side outbound half
pub struct MemoryFrameSink {
    tx: Option<mpsc::Sender<Frame>>,
}

/// Worker-side end of an in-memory channel
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<String>>,
    rx: Option<mpsc::Receiver<Frame>>,
    codec: FrameCodec,
}

/// Create a connected in-memory channel.
///
/// Returns the broker halves and the worker end.
pub fn channel(buffer: usize, codec: FrameCodec) -> (MemoryFrameSource, MemoryFrameSink, MemoryPeer) {
    let (to_broker_tx, to_broker_rx) = mpsc::channel(buffer);
    let (to_worker_tx, to_worker_rx) = mpsc::channel(buffer);

    (
        MemoryFrameSource {
            rx: to_broker_rx,
            codec,
        },
        MemoryFrameSink {
            tx: Some(to_worker_tx),
        },
        MemoryPeer {
            tx: Some(to_broker_tx),
            rx: Some(to_worker_rx),
            codec,
        },
    )
}

#[async_trait]
impl FrameSource for MemoryFrameSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let text = self.rx.recv().await?;
        Some(self.codec.decode(&text).map_err(TransportError::from))
    }
}

#[async_trait]
impl FrameSink for MemoryFrameSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

impl MemoryPeer {
    /// Send a frame to the broker
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let text = self.codec.encode(&frame)?;
        self.send_raw(text).await
    }

    /// Send raw text to the broker, bypassing encoding
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(text.into())
                .await
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// Next frame from the broker; `None` once the broker closed the channel
    pub async fn recv(&mut self) -> Option<Frame> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop sending: the broker observes end-of-stream
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// Stop reading: the broker's next write fails
    pub fn stop_reading(&mut self) {
        self.rx = None;
    }
}
