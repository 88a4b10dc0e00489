//! Worker handles and registry snapshots.

use crate::domain::error::TransportError;
use crate::domain::frame::{Frame, WorkerMetadata};
use crate::domain::ids::{ChannelId, WorkerId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Cloneable sending side of one worker's tunnel.
///
/// Frames are queued for the channel's writer task; nothing here touches the
/// socket. The close signal is shared by the reader, the writer and the
/// sweeper: whoever flips it first starts the teardown.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    outbound: mpsc::Sender<Frame>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    /// Create a handle plus the receivers owned by the channel handler.
    ///
    /// A `buffer` of 0 is treated as 1.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(buffer.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            outbound,
            close_tx: Arc::new(close_tx),
        };
        (handle, outbound_rx, close_rx)
    }

    /// Queue a frame for the worker.
    ///
    /// Fails once the channel has been closed or its writer is gone.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a frame without waiting for room.
    ///
    /// Returns `Ok(false)` if the queue is full and the frame was dropped.
    pub fn try_send(&self, frame: Frame) -> Result<bool, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Force-close the channel. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Another receiver for the close signal
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Read-only view of a registered worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub channel_id: ChannelId,
    pub metadata: WorkerMetadata,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat_secs_ago: f64,
}
