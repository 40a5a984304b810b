//! Frame-level transport seam.
//!
//! A connection's transport is split into a read half, owned by the
//! connection's inbound pipeline, and a write half, owned by its registry
//! entry behind the entry's write lock. The relay only ever sees these two
//! traits; the axum WebSocket implementation lives at the bottom of this
//! module.

use std::fmt;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};

/// WebSocket close code sent to a connection that lost session arbitration.
pub const CLOSE_CODE_CONFLICT: u16 = 4409;

#[derive(Debug)]
pub enum TransportError {
    Closed,
    TimedOut,
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::TimedOut => write!(f, "write deadline exceeded"),
            TransportError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one complete message frame.
    async fn send_frame(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Zero-length control write used to check the peer is still reachable.
    async fn send_probe(&mut self) -> Result<(), TransportError>;

    /// Close the transport, optionally telling the peer why.
    async fn close(&mut self, reason: Option<(u16, &str)>) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next data frame. `Ok(None)` is an orderly close.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

/// Split an upgraded axum WebSocket into relay transport halves.
pub fn split_websocket(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsSource { inner: stream })
}

fn io_error(error: axum::Error) -> TransportError {
    TransportError::Io(error.to_string())
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, payload: &str) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(io_error)
    }

    async fn send_probe(&mut self) -> Result<(), TransportError> {
        self.inner
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(io_error)
    }

    async fn close(&mut self, reason: Option<(u16, &str)>) -> Result<(), TransportError> {
        if let Some((code, reason)) = reason {
            let frame = CloseFrame {
                code,
                reason: reason.to_string().into(),
            };
            // The peer may already be gone; closing the sink below still
            // releases our side.
            let _ = self.inner.send(Message::Close(Some(frame))).await;
        }
        self.inner.close().await.map_err(io_error)
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings are answered by the websocket layer itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(io_error(e)),
            }
        }
    }
}
