use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use thiserror::Error;

/// An inbound frame, reduced to what the read loop cares about
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Read half of a duplex connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame from the client (None once the transport is finished)
    async fn next_frame(&mut self) -> Option<Result<Frame, SocketError>>;
}

/// Write half of a duplex connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError>;

    /// Keepalive probe; the peer answers with a pong
    async fn send_ping(&mut self) -> Result<(), SocketError>;

    async fn close(&mut self) -> Result<(), SocketError>;
}

#[async_trait]
impl FrameStream for SplitStream<WebSocket> {
    async fn next_frame(&mut self) -> Option<Result<Frame, SocketError>> {
        let frame = match self.next().await? {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
            Ok(Message::Ping(_)) => Frame::Ping,
            Ok(Message::Pong(_)) => Frame::Pong,
            Ok(Message::Close(_)) => Frame::Close,
            Err(e) => return Some(Err(SocketError::ReceiveFailed(e.to_string()))),
        };
        Some(Ok(frame))
    }
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), SocketError> {
        self.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.send(Message::Close(None))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))?;
        SinkExt::close(self)
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }
}
