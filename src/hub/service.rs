use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::ConnectionHandle;
use super::messages::{Envelope, UserId};
use super::registry::Registry;

#[derive(Debug, Error, PartialEq)]
pub enum HubError {
    #[error("User {0} has no live connections")]
    NoConnections(UserId),

    #[error("Hub is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub users: usize,
    pub rooms: usize,
    pub connections: usize,
}

enum HubCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionHandle),
    Broadcast(Envelope),
    SendToUser {
        user_id: UserId,
        envelope: Envelope,
        reply: oneshot::Sender<Result<usize, HubError>>,
    },
    UserConnections {
        user_id: UserId,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Real-time fan-out hub
///
/// All registry state lives inside one event loop (`run`), which applies
/// commands strictly in the order they were sent. Handles are cheap clones of
/// the command sender.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>>,
}

impl Hub {
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        Self {
            commands,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    /// Spawn the event loop onto the runtime
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// The event loop; only the first caller gets to run it
    pub async fn run(self) {
        let Some(mut commands) = self.receiver.lock().await.take() else {
            warn!("Hub event loop is already running");
            return;
        };
        drop(self);

        info!("Hub event loop started");
        let mut registry = Registry::new();

        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register(handle) => register(&mut registry, handle),
                HubCommand::Unregister(handle) => {
                    if registry.remove(&handle) {
                        debug!(
                            connection_id = handle.id(),
                            user_id = handle.user_id(),
                            "Connection unregistered"
                        );
                    }
                    handle.close();
                }
                HubCommand::Broadcast(envelope) => {
                    let targets = match &envelope {
                        Envelope::Chat(message) => registry.room_members(message.room_id),
                        Envelope::Notification(notification) => {
                            registry.user_connections(notification.recipient_id)
                        }
                    };
                    fan_out(&mut registry, targets, &envelope);
                }
                HubCommand::SendToUser {
                    user_id,
                    envelope,
                    reply,
                } => {
                    let targets: Vec<ConnectionHandle> = registry
                        .user_connections(user_id)
                        .into_iter()
                        .filter(|handle| !handle.is_closed())
                        .collect();

                    let result = if targets.is_empty() {
                        Err(HubError::NoConnections(user_id))
                    } else {
                        Ok(fan_out(&mut registry, targets, &envelope))
                    };
                    let _ = reply.send(result);
                }
                HubCommand::UserConnections { user_id, reply } => {
                    let _ = reply.send(registry.user_connections(user_id).len());
                }
                HubCommand::Stats { reply } => {
                    let _ = reply.send(HubStats {
                        users: registry.user_count(),
                        rooms: registry.room_count(),
                        connections: registry.connection_count(),
                    });
                }
                HubCommand::Shutdown { reply } => {
                    close_all(&mut registry);
                    let _ = reply.send(());
                    break;
                }
            }
        }

        close_all(&mut registry);
        info!("Hub event loop stopped");
    }

    /// Add a connection to the registry; a stopped hub closes it instead
    pub fn register(&self, handle: ConnectionHandle) {
        if let Err(SendError(HubCommand::Register(handle))) =
            self.commands.send(HubCommand::Register(handle))
        {
            handle.close();
        }
    }

    pub fn unregister(&self, handle: ConnectionHandle) {
        if let Err(SendError(HubCommand::Unregister(handle))) =
            self.commands.send(HubCommand::Unregister(handle))
        {
            handle.close();
        }
    }

    /// Route a chat message to its room or a notification to its recipient
    pub fn broadcast(&self, envelope: Envelope) {
        if self.commands.send(HubCommand::Broadcast(envelope)).is_err() {
            debug!("Broadcast dropped, hub stopped");
        }
    }

    /// Push a notification to every live connection of `user_id`
    ///
    /// Returns how many connections accepted the frame.
    pub async fn send_to_user(
        &self,
        user_id: UserId,
        message_type: &str,
        payload: serde_json::Value,
    ) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::SendToUser {
                user_id,
                envelope: Envelope::notification(user_id, message_type, payload),
                reply,
            })
            .map_err(|_| HubError::Stopped)?;
        response.await.map_err(|_| HubError::Stopped)?
    }

    /// Number of registered connections held by `user_id`
    pub async fn user_connections(&self, user_id: UserId) -> usize {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::UserConnections { user_id, reply })
            .is_err()
        {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Stats { reply })
            .map_err(|_| HubError::Stopped)?;
        response.await.map_err(|_| HubError::Stopped)
    }

    /// Close every connection and stop the event loop
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(HubCommand::Shutdown { reply }).is_ok() {
            let _ = response.await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn register(registry: &mut Registry, handle: ConnectionHandle) {
    if handle.is_closed() {
        debug!(connection_id = handle.id(), "Skipping registration of a closed connection");
        return;
    }
    debug!(
        connection_id = handle.id(),
        user_id = handle.user_id(),
        room_id = ?handle.room_id(),
        "Connection registered"
    );
    registry.insert(handle.clone());
    handle.mark_registered();
}

/// Non-blocking send to every target; full or closed queues are evicted afterwards
fn fan_out(registry: &mut Registry, targets: Vec<ConnectionHandle>, envelope: &Envelope) -> usize {
    let frame = match serde_json::to_string(envelope) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to serialize envelope");
            return 0;
        }
    };

    let mut delivered = 0;
    let mut evicted = Vec::new();
    for handle in targets {
        match handle.try_send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = handle.id(),
                    user_id = handle.user_id(),
                    "Outbound queue full, evicting connection"
                );
                evicted.push(handle);
            }
            Err(TrySendError::Closed(_)) => evicted.push(handle),
        }
    }

    for handle in evicted {
        registry.remove(&handle);
        handle.close();
    }

    debug!(
        message_type = envelope.type_name(),
        delivered = delivered,
        "Envelope fanned out"
    );
    delivered
}

fn close_all(registry: &mut Registry) {
    for handle in registry.drain() {
        handle.close();
    }
}
