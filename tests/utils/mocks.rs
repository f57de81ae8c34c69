#![allow(dead_code)] // Test utilities may not all be used in every test

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use marketplace_realtime::broker::{DeliveryHandler, HandlerError};
use marketplace_realtime::hub::{Frame, FrameSink, FrameStream, SocketError};

use super::assertions::eventually;

// ============================================================================
// Mock Infrastructure
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum HandlerOutcome {
    Succeed,
    AlwaysFail,
    Malformed,
    /// Fail this many times, then succeed
    FailFirst(usize),
}

/// Delivery handler that records every body it sees
#[derive(Clone)]
pub struct RecordingHandler {
    outcome: HandlerOutcome,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingHandler {
    pub fn new(outcome: HandlerOutcome) -> Self {
        Self {
            outcome,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        eventually(&format!("{} handler calls", count), || async move {
            self.calls() == count
        })
        .await;
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let call = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(body.to_vec());
            seen.len()
        };

        match self.outcome {
            HandlerOutcome::Succeed => Ok(()),
            HandlerOutcome::AlwaysFail => Err(HandlerError::failed(format!("attempt {} failed", call))),
            HandlerOutcome::Malformed => Err(HandlerError::malformed("unreadable body")),
            HandlerOutcome::FailFirst(n) if call <= n => {
                Err(HandlerError::failed(format!("attempt {} failed", call)))
            }
            HandlerOutcome::FailFirst(_) => Ok(()),
        }
    }
}

/// Write half handed to a connection; frames land in the paired `ClientEnd`
pub struct ChannelSink {
    written: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.written
            .send(text)
            .map_err(|_| SocketError::ConnectionClosed)
    }

    async fn send_ping(&mut self) -> Result<(), SocketError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        Ok(())
    }
}

/// Read half handed to a connection; fed by the paired `ClientEnd`
pub struct ChannelStream {
    frames: mpsc::UnboundedReceiver<Result<Frame, SocketError>>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, SocketError>> {
        self.frames.recv().await
    }
}

/// The client's side of an in-process duplex connection
pub struct ClientEnd {
    pub inbound: mpsc::UnboundedSender<Result<Frame, SocketError>>,
    pub written: mpsc::UnboundedReceiver<String>,
}

impl ClientEnd {
    pub fn send_chat(&self, content: &str) {
        let frame = json!({"type": "CHAT", "payload": {"content": content}}).to_string();
        self.inbound.send(Ok(Frame::Text(frame))).unwrap();
    }

    pub fn send_raw(&self, text: &str) {
        self.inbound.send(Ok(Frame::Text(text.to_string()))).unwrap();
    }

    pub fn disconnect(&self) {
        let _ = self.inbound.send(Ok(Frame::Close));
    }
}

pub fn client_pair() -> (ChannelSink, ChannelStream, ClientEnd) {
    let (inbound, frames) = mpsc::unbounded_channel();
    let (written_tx, written) = mpsc::unbounded_channel();
    (
        ChannelSink {
            written: written_tx,
        },
        ChannelStream { frames },
        ClientEnd { inbound, written },
    )
}
