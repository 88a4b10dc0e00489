//! Reverse client: dial the broker, register, serve forwarded requests.
//!
//! One session is one WebSocket connection. Inside a session every
//! `forward_request` runs on its own task, and all outbound frames funnel
//! through a single writer task, so replies may leave in any order.

use crate::config::WorkerConfig;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tunnel_broker::domain::CodecError;
use tunnel_broker::{Frame, FrameCodec, RequestId, WorkerId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serves one forwarded request.
///
/// `Ok` becomes the `payload` of the response frame, `Err` its `error`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request_id: RequestId, payload: Value) -> Result<Value, String>;
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Registration acknowledged
    Registered(WorkerId),
    /// Session ended
    Disconnected,
    /// Error occurred
    Error(String),
}

/// Worker client errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("expected register_ack, got {0}")]
    UnexpectedFrame(&'static str),
    #[error("no register_ack within {0:?}")]
    RegistrationTimeout(Duration),
    #[error("broker closed the channel")]
    Closed,
    #[error("giving up after {0} failed attempts")]
    GaveUp(u32),
}

/// How a registered session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested
    Shutdown,
    /// The channel was lost after registration
    Disconnected(String),
}

enum Outgoing {
    Frame(Frame),
    Close,
}

/// Reverse tunnel client
pub struct WorkerClient {
    config: WorkerConfig,
    handler: Arc<dyn RequestHandler>,
    codec: FrameCodec,
    events: Option<mpsc::Sender<WorkerEvent>>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            config,
            handler,
            codec: FrameCodec::default(),
            events: None,
        }
    }

    /// Receive lifecycle events on `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<WorkerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run sessions until shutdown, reconnecting with exponential backoff.
    ///
    /// The failure counter resets after every session that registered.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.config.validate().map_err(WorkerError::Config)?;

        let mut failed_attempts = 0u32;

        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }

            match self.run_session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected(reason)) => {
                    warn!(reason = %reason, "Tunnel session lost");
                    failed_attempts = 0;
                }
                Err(e) => {
                    failed_attempts += 1;
                    warn!(error = %e, attempt = failed_attempts, "Tunnel session failed");
                    self.emit(WorkerEvent::Error(e.to_string())).await;
                }
            }
            self.emit(WorkerEvent::Disconnected).await;

            if let Some(max) = self.config.max_reconnect_attempts {
                if failed_attempts >= max {
                    return Err(WorkerError::GaveUp(failed_attempts));
                }
            }

            let delay = self.config.backoff_delay(failed_attempts);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One connect / register / serve cycle.
    ///
    /// Errors mean the session never registered.
    pub async fn run_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, WorkerError> {
        self.config.validate().map_err(WorkerError::Config)?;

        let (ws, _) = connect_async(self.config.broker_url.as_str())
            .await
            .map_err(|e| WorkerError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let register = Frame::Register {
            metadata: self.config.metadata.clone(),
        };
        write
            .send(Message::Text(self.codec.encode(&register)?))
            .await
            .map_err(|e| WorkerError::Transport(e.to_string()))?;

        let window = self.config.register_timeout;
        let worker_id = tokio::time::timeout(window, self.await_ack(&mut read))
            .await
            .map_err(|_| WorkerError::RegistrationTimeout(window))??;

        info!(worker_id = %worker_id, broker = %self.config.broker_url, "Registered with broker");
        self.emit(WorkerEvent::Registered(worker_id.clone())).await;

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_buffer);
        let writer = tokio::spawn(write_loop(write, out_rx, self.codec));

        let end = self.serve(&mut read, &out_tx, shutdown).await;

        // Stop the writer even while request tasks still hold senders
        let _ = out_tx.send(Outgoing::Close).await;
        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("Writer did not stop in time");
        }

        info!(worker_id = %worker_id, "Tunnel session ended");
        Ok(end)
    }

    async fn await_ack(&self, read: &mut SplitStream<WsStream>) -> Result<WorkerId, WorkerError> {
        loop {
            match self.next_frame(read).await? {
                Some(Frame::RegisterAck { worker_id }) => return Ok(worker_id),
                Some(other) => return Err(WorkerError::UnexpectedFrame(other.kind())),
                None => continue,
            }
        }
    }

    async fn serve(
        &self,
        read: &mut SplitStream<WsStream>,
        out_tx: &mpsc::Sender<Outgoing>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
                _ = heartbeat.tick() => {
                    if out_tx.send(Outgoing::Frame(Frame::heartbeat())).await.is_err() {
                        return SessionEnd::Disconnected("writer stopped".into());
                    }
                }
                next = self.next_frame(read) => match next {
                    Ok(Some(frame)) => self.on_frame(frame, out_tx),
                    Ok(None) => {}
                    Err(WorkerError::Codec(e)) => {
                        warn!(error = %e, "Ignoring undecodable frame");
                    }
                    Err(e) => return SessionEnd::Disconnected(e.to_string()),
                },
            }
        }
    }

    fn on_frame(&self, frame: Frame, out_tx: &mpsc::Sender<Outgoing>) {
        match frame {
            Frame::ForwardRequest {
                request_id,
                payload,
            } => {
                debug!(request_id = %request_id, "Serving forwarded request");
                let handler = Arc::clone(&self.handler);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let reply = match handler.handle(request_id, payload).await {
                        Ok(payload) => Frame::response(request_id, payload),
                        Err(error) => Frame::failure(request_id, error),
                    };
                    if out_tx.send(Outgoing::Frame(reply)).await.is_err() {
                        debug!(request_id = %request_id, "Reply dropped, session closed");
                    }
                });
            }
            Frame::HeartbeatAck {} => {}
            other => {
                debug!(frame = other.kind(), "Ignoring unexpected frame from broker");
            }
        }
    }

    /// Next frame; `Ok(None)` for control messages
    async fn next_frame(
        &self,
        read: &mut SplitStream<WsStream>,
    ) -> Result<Option<Frame>, WorkerError> {
        match read.next().await {
            None => Err(WorkerError::Closed),
            Some(Err(e)) => Err(WorkerError::Transport(e.to_string())),
            Some(Ok(Message::Text(text))) => Ok(Some(self.codec.decode(&text)?)),
            Some(Ok(Message::Binary(data))) => Ok(Some(self.codec.decode_bytes(&data)?)),
            Some(Ok(Message::Close(_))) => Err(WorkerError::Closed),
            Some(Ok(_)) => Ok(None),
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Outgoing>,
    codec: FrameCodec,
) {
    while let Some(outgoing) = rx.recv().await {
        let frame = match outgoing {
            Outgoing::Frame(frame) => frame,
            Outgoing::Close => break,
        };
        let text = match codec.encode(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, frame = frame.kind(), "Failed to encode frame");
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(text)).await {
            warn!(error = %e, "Tunnel write failed");
            break;
        }
    }

    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _request_id: RequestId, payload: Value) -> Result<Value, String> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let client = WorkerClient::new(WorkerConfig::new("http://nope"), Arc::new(Echo));
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(client.run(rx).await, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_session_rejects_zero_buffer() {
        let mut config = WorkerConfig::new("ws://127.0.0.1:1/tunnel");
        config.outbound_buffer = 0;
        let client = WorkerClient::new(config, Arc::new(Echo));
        let (_tx, mut rx) = watch::channel(false);

        assert!(matches!(
            client.run_session(&mut rx).await,
            Err(WorkerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut config = WorkerConfig::new("ws://127.0.0.1:1/tunnel");
        config.max_reconnect_attempts = Some(2);
        config.reconnect_base_delay = Duration::from_millis(1);
        config.reconnect_max_delay = Duration::from_millis(2);

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let client = WorkerClient::new(config, Arc::new(Echo)).with_events(events_tx);
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(client.run(rx).await, Err(WorkerError::GaveUp(2))));
        assert!(matches!(events_rx.recv().await, Some(WorkerEvent::Error(_))));
        assert_eq!(events_rx.recv().await, Some(WorkerEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let mut config = WorkerConfig::new("ws://127.0.0.1:1/tunnel");
        config.reconnect_base_delay = Duration::from_secs(30);
        config.reconnect_max_delay = Duration::from_secs(30);

        let client = WorkerClient::new(config, Arc::new(Echo));
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(async move { client.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        assert!(run.await.unwrap().is_ok());
    }
}
