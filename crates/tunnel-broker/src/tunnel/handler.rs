//! Tunnel channel handler - per-worker protocol state machine.
//!
//! ```text
//! AwaitingRegistration ──register──→ Registered ──eof / error / close──→ Closed
//!          │                                                              ↑
//!          └──────────── any other frame / timeout ──────────────────────┘
//! ```
//!
//! One reader (this handler) and one writer task per channel. The writer
//! drains the worker's outbound queue; the reader never writes to the
//! socket itself after registration. Either side failing, or the sweeper
//! force-closing the worker, flips the shared close signal and the reader
//! runs the teardown: registry removal first, then the pending cascade.

use crate::domain::{
    ChannelId, CodecError, ConnectionRegistry, Frame, PendingRequestTable, ProtocolError,
    RequestId, TransportError, TunnelConfig, WorkerHandle, WorkerId, WorkerMetadata, WorkerReply,
};
use crate::ports::{FrameSink, FrameSource};
use crate::stats::BrokerStats;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared state every tunnel handler needs
#[derive(Clone)]
pub struct TunnelContext {
    pub registry: Arc<ConnectionRegistry>,
    pub pending: Arc<PendingRequestTable>,
    pub stats: Arc<BrokerStats>,
    pub config: TunnelConfig,
}

/// Protocol state of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingRegistration,
    Registered(WorkerId),
    Closed,
}

/// Why a channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer ended the stream cleanly
    PeerClosed,
    /// Reading from the channel failed
    ReadFailed(String),
    /// Writing to the channel failed
    WriteFailed(String),
    /// Malformed or out-of-state frame
    ProtocolViolation(ProtocolError),
    /// Force-closed, e.g. evicted for missing heartbeats
    ForceClosed,
    /// The channel was already registered
    DuplicateChannel,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {}", e),
            CloseReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            CloseReason::ForceClosed => f.write_str("force closed"),
            CloseReason::DuplicateChannel => f.write_str("duplicate channel"),
        }
    }
}

/// Handler for one physical tunnel channel
pub struct TunnelHandler {
    ctx: TunnelContext,
    channel_id: ChannelId,
    state: ChannelState,
}

impl TunnelHandler {
    pub fn new(ctx: TunnelContext, channel_id: ChannelId) -> Self {
        Self {
            ctx,
            channel_id,
            state: ChannelState::AwaitingRegistration,
        }
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Drive the channel until it closes.
    pub async fn run<S, K>(mut self, mut source: S, mut sink: K) -> CloseReason
    where
        S: FrameSource,
        K: FrameSink + 'static,
    {
        self.ctx.stats.record_connection();
        debug!(channel_id = %self.channel_id, "Tunnel channel opened");

        let metadata = match self.await_registration(&mut source).await {
            Ok(metadata) => metadata,
            Err(reason) => {
                sink.close().await;
                return self.finish(reason);
            }
        };

        let (handle, outbound_rx, close_rx) =
            WorkerHandle::channel(self.ctx.config.outbound_buffer);

        let worker_id = match self
            .ctx
            .registry
            .register(self.channel_id, handle.clone(), metadata)
        {
            Ok(worker_id) => worker_id,
            Err(e) => {
                warn!(channel_id = %self.channel_id, error = %e, "Registration rejected");
                sink.close().await;
                return self.finish(CloseReason::DuplicateChannel);
            }
        };
        self.ctx.stats.record_registration();
        self.state = ChannelState::Registered(worker_id.clone());

        // The ack goes out before the writer starts, so it precedes any
        // forward_request already queued by the gateway.
        let ack = Frame::RegisterAck {
            worker_id: worker_id.clone(),
        };
        if let Err(e) = sink.send_frame(ack).await {
            self.teardown(&worker_id, &handle);
            sink.close().await;
            return self.finish(CloseReason::WriteFailed(e.to_string()));
        }

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            close_rx,
            handle.clone(),
            worker_id.clone(),
        ));

        let reason = self.read_loop(&mut source, &worker_id, &handle).await;

        self.teardown(&worker_id, &handle);

        let reason = match (reason, writer.await) {
            // A forced close caused by the writer is a write failure
            (CloseReason::ForceClosed, Ok(Err(e))) => CloseReason::WriteFailed(e.to_string()),
            (reason, _) => reason,
        };

        if reason == CloseReason::ForceClosed {
            self.ctx.stats.record_eviction();
        }

        self.finish(reason)
    }

    async fn await_registration<S: FrameSource>(
        &mut self,
        source: &mut S,
    ) -> Result<WorkerMetadata, CloseReason> {
        let window = self.ctx.config.registration_timeout;

        let first = match tokio::time::timeout(window, source.next_frame()).await {
            Ok(first) => first,
            Err(_) => {
                return Err(CloseReason::ProtocolViolation(
                    ProtocolError::RegistrationTimeout(window),
                ))
            }
        };

        match first {
            None => Err(CloseReason::PeerClosed),
            Some(Err(e)) => Err(classify_read_error(e)),
            Some(Ok(Frame::Register { metadata })) => Ok(metadata),
            Some(Ok(other)) => Err(CloseReason::ProtocolViolation(
                ProtocolError::NotRegistered(other.kind()),
            )),
        }
    }

    async fn read_loop<S: FrameSource>(
        &self,
        source: &mut S,
        worker_id: &WorkerId,
        handle: &WorkerHandle,
    ) -> CloseReason {
        let mut closed = handle.closed_signal();

        loop {
            if *closed.borrow_and_update() {
                return CloseReason::ForceClosed;
            }

            tokio::select! {
                _ = closed.changed() => {
                    return CloseReason::ForceClosed;
                }
                next = source.next_frame() => match next {
                    None => return CloseReason::PeerClosed,
                    Some(Err(e)) => return classify_read_error(e),
                    Some(Ok(frame)) => self.on_frame(worker_id, handle, frame),
                },
            }
        }
    }

    fn on_frame(&self, worker_id: &WorkerId, handle: &WorkerHandle, frame: Frame) {
        match frame {
            Frame::ForwardResponse {
                request_id,
                payload,
                error,
            } => {
                let _ = self.ctx.registry.touch(worker_id);
                let reply = WorkerReply::from_parts(payload, error);
                let fulfilled = match RequestId::parse(&request_id) {
                    Ok(id) => self.ctx.pending.fulfill_from(worker_id, &id, reply),
                    Err(_) => self.ctx.pending.record_unknown(&request_id),
                };
                if !fulfilled {
                    debug!(
                        worker_id = %worker_id,
                        request_id = %request_id,
                        "Ignored response without a pending request"
                    );
                }
            }
            Frame::Heartbeat {} => {
                let _ = self.ctx.registry.touch(worker_id);
                // Never wait on the outbound queue here; the reader must keep draining
                match handle.try_send(Frame::heartbeat_ack()) {
                    Ok(true) => {}
                    Ok(false) => debug!(worker_id = %worker_id, "Queue full, heartbeat ack dropped"),
                    Err(_) => debug!(worker_id = %worker_id, "Heartbeat ack dropped, channel closing"),
                }
            }
            other => {
                warn!(
                    worker_id = %worker_id,
                    frame = other.kind(),
                    "Ignoring frame not expected from a worker"
                );
            }
        }
    }

    /// Remove the worker, then fail its pending requests. Order matters:
    /// nothing may route to the worker while its requests are failed.
    fn teardown(&self, worker_id: &WorkerId, handle: &WorkerHandle) {
        handle.close();
        self.ctx.registry.remove(worker_id);
        self.ctx.pending.fail_all_for_worker(worker_id);
    }

    fn finish(&mut self, reason: CloseReason) -> CloseReason {
        if matches!(reason, CloseReason::ProtocolViolation(_)) {
            self.ctx.stats.record_protocol_violation();
        }

        match &self.state {
            ChannelState::Registered(worker_id) => info!(
                channel_id = %self.channel_id,
                worker_id = %worker_id,
                reason = %reason,
                "Tunnel channel closed"
            ),
            _ => info!(
                channel_id = %self.channel_id,
                reason = %reason,
                "Tunnel channel closed before registration"
            ),
        }

        self.state = ChannelState::Closed;
        reason
    }
}

fn classify_read_error(e: TransportError) -> CloseReason {
    match e {
        TransportError::Codec(CodecError::TooLarge { size, max }) => {
            CloseReason::ProtocolViolation(ProtocolError::FrameTooLarge { size, max })
        }
        TransportError::Codec(codec) => {
            CloseReason::ProtocolViolation(ProtocolError::Malformed(codec.to_string()))
        }
        TransportError::Closed => CloseReason::PeerClosed,
        TransportError::Io(e) => CloseReason::ReadFailed(e),
    }
}

/// Drain the outbound queue onto the sink until closed.
///
/// A write failure flips the close signal so the reader tears down.
async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut outbound: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<bool>,
    handle: WorkerHandle,
    worker_id: WorkerId,
) -> Result<(), TransportError> {
    let result = loop {
        if *closed.borrow_and_update() {
            break Ok(());
        }

        tokio::select! {
            biased;
            _ = closed.changed() => break Ok(()),
            next = outbound.recv() => match next {
                Some(frame) => {
                    let kind = frame.kind();
                    if let Err(e) = sink.send_frame(frame).await {
                        warn!(worker_id = %worker_id, frame = kind, error = %e, "Tunnel write failed");
                        handle.close();
                        break Err(e);
                    }
                    debug!(worker_id = %worker_id, frame = kind, "Frame written");
                }
                None => break Ok(()),
            },
        }
    };

    sink.close().await;
    result
}

/// Spawn a handler for a channel on the runtime
pub fn spawn<S, K>(ctx: TunnelContext, source: S, sink: K) -> JoinHandle<CloseReason>
where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    let handler = TunnelHandler::new(ctx, ChannelId::next());
    tokio::spawn(handler.run(source, sink))
}
