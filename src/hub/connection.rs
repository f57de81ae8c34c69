use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use super::service::Hub;
use super::messages::{ChatMessage, ClientMessage, Envelope, RoomId, UserId};
use super::socket::{Frame, FrameSink, FrameStream};
use crate::chat::ChatService;
use crate::config::HubConfig;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct ConnectionShared {
    id: ConnectionId,
    user_id: UserId,
    room_id: Option<RoomId>,
    outbound: mpsc::Sender<String>,
    state: AtomicU8,
    close_once: AtomicBool,
    closed: watch::Sender<bool>,
}

/// Cheap, cloneable reference to one live connection
///
/// The hub keeps these in its registry; the connection's own loops hold the
/// receiving end of the outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its bounded outbound queue
    pub fn new(
        user_id: UserId,
        room_id: Option<RoomId>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(ConnectionShared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                user_id,
                room_id,
                outbound,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                close_once: AtomicBool::new(false),
                closed,
            }),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.room_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Queue a frame without waiting; a full queue is reported, never awaited
    pub fn try_send(&self, frame: String) -> Result<(), TrySendError<String>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(frame));
        }
        self.inner.outbound.try_send(frame)
    }

    /// Fire the close signal; only the first call has any effect
    pub fn close(&self) -> bool {
        if self.inner.close_once.swap(true, Ordering::SeqCst) {
            return false;
        }
        let current = self.inner.state.load(Ordering::SeqCst);
        if current < ConnectionState::Closing as u8 {
            self.inner
                .state
                .store(ConnectionState::Closing as u8, Ordering::SeqCst);
        }
        self.inner.closed.send_replace(true);
        true
    }

    /// Resolves once the close signal has fired
    pub async fn closed(&self) {
        let mut receiver = self.inner.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    pub(crate) fn mark_registered(&self) {
        let _ = self.inner.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Registered as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn mark_closed(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.user_id)
            .field("room_id", &self.inner.room_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection represents a managed duplex connection
///
/// A read loop and a write loop cooperate over the outbound queue and the
/// shared close signal. Either loop ending tears the whole connection down.
pub struct Connection {
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<String>,
    hub: Hub,
    chat_service: Arc<dyn ChatService>,
    config: HubConfig,
}

impl Connection {
    pub fn new(
        user_id: UserId,
        room_id: Option<RoomId>,
        hub: Hub,
        chat_service: Arc<dyn ChatService>,
        config: HubConfig,
    ) -> Self {
        let (handle, outbound) = ConnectionHandle::new(user_id, room_id, config.outbound_buffer);
        Self {
            handle,
            outbound,
            hub,
            chat_service,
            config,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Register with the hub and run both loops until disconnect
    #[instrument(skip_all, fields(connection_id = self.handle.id(), user_id = self.handle.user_id()))]
    pub async fn run<W, R>(self, sink: W, stream: R)
    where
        W: FrameSink + 'static,
        R: FrameStream,
    {
        let Connection {
            handle,
            outbound,
            hub,
            chat_service,
            config,
        } = self;

        hub.register(handle.clone());

        let writer = tokio::spawn(write_loop(handle.clone(), outbound, sink, config.clone()));
        read_loop(&handle, stream, &hub, chat_service.as_ref(), &config).await;

        hub.unregister(handle.clone());
        handle.close();
        if let Err(e) = writer.await {
            warn!(error = %e, "Write loop task failed");
        }

        info!(
            room_id = ?handle.room_id(),
            "Connection closed"
        );
    }
}

async fn read_loop<R: FrameStream>(
    handle: &ConnectionHandle,
    mut stream: R,
    hub: &Hub,
    chat_service: &dyn ChatService,
    config: &HubConfig,
) {
    loop {
        let next = tokio::select! {
            _ = handle.closed() => break,
            next = timeout(config.read_timeout, stream.next_frame()) => next,
        };

        match next {
            Err(_) => {
                debug!("Read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Ok(Frame::Close))) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Read failed");
                break;
            }
            Ok(Some(Ok(Frame::Text(text)))) => {
                handle_text(handle, &text, hub, chat_service).await;
            }
            // Keepalive traffic only refreshes the deadline
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn handle_text(
    handle: &ConnectionHandle,
    text: &str,
    hub: &Hub,
    chat_service: &dyn ChatService,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Dropping undecodable frame");
            return;
        }
    };

    match message {
        ClientMessage::Chat { content } => {
            let Some(room_id) = handle.room_id() else {
                debug!("Chat frame on a connection without a room");
                return;
            };

            match chat_service
                .save_message(room_id, handle.user_id(), &content)
                .await
            {
                Ok((stored, sender)) => {
                    hub.broadcast(Envelope::Chat(ChatMessage {
                        id: stored.id,
                        room_id: stored.room_id,
                        sender_id: sender.user_id,
                        sender_name: sender.display_name,
                        content: stored.content,
                        timestamp: stored.created_at,
                    }));
                }
                Err(e) => {
                    warn!(room_id = room_id, error = %e, "Failed to persist chat message");
                }
            }
        }
    }
}

async fn write_loop<W: FrameSink>(
    handle: ConnectionHandle,
    mut outbound: mpsc::Receiver<String>,
    mut sink: W,
    config: HubConfig,
) {
    let mut keepalive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        tokio::select! {
            _ = handle.closed() => break,
            frame = outbound.recv() => {
                let Some(first) = frame else { break };
                let mut batch = first;
                while let Ok(next) = outbound.try_recv() {
                    batch.push('\n');
                    batch.push_str(&next);
                }
                match timeout(config.write_timeout, sink.send_text(batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "Write failed");
                        break;
                    }
                    Err(_) => {
                        debug!("Write deadline expired");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                match timeout(config.write_timeout, sink.send_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "Keepalive failed");
                        break;
                    }
                    Err(_) => {
                        debug!("Keepalive deadline expired");
                        break;
                    }
                }
            }
        }
    }

    handle.close();
    outbound.close();
    drop(outbound);
    let _ = timeout(config.write_timeout, sink.close()).await;
    handle.mark_closed();
}
