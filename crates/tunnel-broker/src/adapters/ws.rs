//! WebSocket tunnel transport on top of axum.
//!
//! Frames travel as JSON text messages. Binary messages carrying UTF-8 JSON
//! are accepted too. Control frames never reach the broker core.

use crate::adapters::codec::FrameCodec;
use crate::domain::{Frame, TransportError};
use crate::ports::{FrameSink, FrameSource};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::debug;

/// Inbound half of a WebSocket tunnel
pub struct WsFrameSource {
    stream: SplitStream<WebSocket>,
    codec: FrameCodec,
}

/// Outbound half of a WebSocket tunnel
pub struct WsFrameSink {
    sink: SplitSink<WebSocket, Message>,
    codec: FrameCodec,
}

/// Split an upgraded socket into tunnel halves
pub fn split(socket: WebSocket, codec: FrameCodec) -> (WsFrameSource, WsFrameSink) {
    let (sink, stream) = socket.split();
    (
        WsFrameSource { stream, codec },
        WsFrameSink { sink, codec },
    )
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };

            match message {
                Message::Text(text) => {
                    return Some(self.codec.decode(&text).map_err(TransportError::from));
                }
                Message::Binary(data) => {
                    return Some(self.codec.decode_bytes(&data).map_err(TransportError::from));
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Pongs are answered by the websocket layer itself
                    continue;
                }
                Message::Close(reason) => {
                    debug!(reason = ?reason, "WebSocket close received");
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let text = self.codec.encode(&frame)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}
