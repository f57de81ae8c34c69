#![allow(dead_code)] // Test utilities may not all be used in every test

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use marketplace_realtime::auth::JwtAuthenticator;
use marketplace_realtime::broker::{Broker, ConnectionStatus, InMemoryBroker, Topology};
use marketplace_realtime::chat::InMemoryChatService;
use marketplace_realtime::config::{BrokerConfig, HubConfig};
use marketplace_realtime::hub::{Connection, Hub, RoomId, UserId};
use marketplace_realtime::shared::AppState;

use super::assertions::eventually;
use super::mocks::{client_pair, ClientEnd};

// ============================================================================
// Test Setup Infrastructure
// ============================================================================

pub struct BrokerSetup {
    pub memory: InMemoryBroker,
    pub broker: Broker,
    pub config: BrokerConfig,
}

impl BrokerSetup {
    pub async fn wait_for_status(&self, status: ConnectionStatus) {
        eventually(&format!("broker status {:?}", status), || async move {
            self.broker.status().await == status
        })
        .await;
    }

    /// Drop the connection and wait until the client has recovered it
    pub async fn bounce(&self) {
        self.memory.sever_connections().await;
        eventually("broker reconnected", || async move {
            self.memory.open_connections().await == 1
                && self.broker.status().await == ConnectionStatus::Connected
        })
        .await;
    }

    pub async fn wait_for_disconnect(&self) {
        eventually("broker disconnected", || async move {
            self.broker.status().await != ConnectionStatus::Connected
        })
        .await;
    }

    pub async fn dead_letters(&self) -> usize {
        self.memory.queue_depth(&self.config.dead_letter_queue).await
    }

    pub async fn wait_for_dead_letters(&self, count: usize) {
        eventually(&format!("{} dead letters", count), || async move {
            self.dead_letters().await == count
        })
        .await;
    }

    pub async fn wait_for_unacked(&self, queue: &str, count: usize) {
        eventually(&format!("{} unacked on {}", count, queue), || async move {
            self.memory.unacked_count(queue).await == count
        })
        .await;
    }

    /// Wait until the broker has been re-declared to match `expected`
    pub async fn wait_for_topology(&self, expected: &Topology) {
        eventually("topology replayed", || async move {
            self.broker.status().await == ConnectionStatus::Connected
                && self.memory.declared_topology().await == *expected
        })
        .await;
    }
}

pub struct BrokerSetupBuilder {
    config: BrokerConfig,
}

impl BrokerSetupBuilder {
    pub fn new() -> Self {
        Self {
            config: BrokerConfig {
                url: "memory://".to_string(),
                max_retries: 3,
                reconnect_delay: Duration::from_millis(20),
                retry_backoff: Duration::from_millis(1),
                ..BrokerConfig::default()
            },
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn config(&self) -> BrokerConfig {
        self.config.clone()
    }

    pub async fn build(self) -> BrokerSetup {
        let memory = InMemoryBroker::new();
        let broker = Broker::connect(Arc::new(memory.clone()), self.config.clone())
            .await
            .unwrap();
        BrokerSetup {
            memory,
            broker,
            config: self.config,
        }
    }
}

pub struct HubSetup {
    pub hub: Hub,
    pub chat_service: Arc<InMemoryChatService>,
    pub authenticator: JwtAuthenticator,
    pub config: HubConfig,
    pub _hub_task: JoinHandle<()>,
}

impl HubSetup {
    pub fn new() -> Self {
        let hub = Hub::new();
        let _hub_task = hub.start();
        Self {
            hub,
            chat_service: Arc::new(InMemoryChatService::new()),
            authenticator: JwtAuthenticator::new("test-secret"),
            config: HubConfig {
                outbound_buffer: 16,
                read_timeout: Duration::from_secs(10),
                write_timeout: Duration::from_secs(1),
                ping_interval: Duration::from_secs(4),
                max_frame_bytes: 16 * 1024,
            },
            _hub_task,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.hub.clone(),
            self.chat_service.clone(),
            Arc::new(self.authenticator.clone()),
            self.config.clone(),
        )
    }

    /// Run a connection over in-process channels and wait until the hub holds it
    pub async fn connect(&self, user_id: UserId, room_id: Option<RoomId>) -> ClientEnd {
        let before = self.hub.user_connections(user_id).await;
        let (sink, stream, client) = client_pair();
        let connection = Connection::new(
            user_id,
            room_id,
            self.hub.clone(),
            self.chat_service.clone(),
            self.config.clone(),
        );
        tokio::spawn(connection.run(sink, stream));

        eventually("connection registration", || async move {
            self.hub.user_connections(user_id).await > before
        })
        .await;
        client
    }
}
