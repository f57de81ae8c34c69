use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, warn};

use super::consumer::{self, DeliveryHandler};
use super::errors::BrokerError;
use super::retry::RetryPolicy;
use super::topology::Topology;
use super::transport::{BrokerChannel, BrokerConnector, ExchangeKind, Headers, QueueArguments};
use crate::config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

struct Subscription {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
}

struct BrokerState {
    status: ConnectionStatus,
    channel: Option<Arc<dyn BrokerChannel>>,
    topology: Topology,
    subscriptions: Vec<Subscription>,
}

struct BrokerInner {
    connector: Arc<dyn BrokerConnector>,
    config: BrokerConfig,
    policy: RetryPolicy,
    state: RwLock<BrokerState>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    consumer_seq: AtomicU64,
}

/// Durable message-broker client
///
/// Owns one connection and channel at a time. A background monitor notices
/// connection loss, reconnects with a fixed delay, replays the recorded
/// topology and resumes every active subscription. While disconnected,
/// publish and consume fail fast with [`BrokerError::NotConnected`].
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Connect and declare the dead-letter sink; failure here is fatal to the caller
    #[instrument(skip_all)]
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        config: BrokerConfig,
    ) -> Result<Self, BrokerError> {
        let channel = connector.connect().await?;

        let mut topology = Topology::new();
        topology.record_exchange(&config.dead_letter_exchange, ExchangeKind::Fanout);
        topology.record_queue(&config.dead_letter_queue, QueueArguments::default());
        topology.record_binding(&config.dead_letter_queue, &config.dead_letter_exchange, "");

        if let Err(e) = topology.apply(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e);
        }

        let (shutdown, _) = watch::channel(false);
        let broker = Self {
            inner: Arc::new(BrokerInner {
                connector,
                policy: RetryPolicy::from_config(&config),
                config,
                state: RwLock::new(BrokerState {
                    status: ConnectionStatus::Connected,
                    channel: Some(channel.clone()),
                    topology,
                    subscriptions: Vec::new(),
                }),
                shutdown,
                closed: AtomicBool::new(false),
                consumer_seq: AtomicU64::new(1),
            }),
        };

        tokio::spawn(broker.clone().monitor(channel));

        info!("Broker connected");
        Ok(broker)
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.read().await.status
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of everything declared so far
    pub async fn topology(&self) -> Topology {
        self.inner.state.read().await.topology.clone()
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        channel.declare_exchange(name, kind).await?;
        self.inner
            .state
            .write()
            .await
            .topology
            .record_exchange(name, kind);
        debug!(exchange = %name, kind = ?kind, "Exchange declared");
        Ok(())
    }

    /// Declare a durable queue that dead-letters into the shared sink
    pub async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let args = if name == self.inner.config.dead_letter_queue {
            QueueArguments::default()
        } else {
            QueueArguments {
                dead_letter_exchange: Some(self.inner.config.dead_letter_exchange.clone()),
            }
        };

        let channel = self.channel().await?;
        channel.declare_queue(name, &args).await?;
        self.inner
            .state
            .write()
            .await
            .topology
            .record_queue(name, args);
        debug!(queue = %name, "Queue declared");
        Ok(())
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        channel.bind_queue(queue, exchange, routing_key).await?;
        self.inner
            .state
            .write()
            .await
            .topology
            .record_binding(queue, exchange, routing_key);
        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Queue bound");
        Ok(())
    }

    /// Serialize `message` as JSON and publish it persistently to `queue`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(message)?;
        self.publish_bytes(queue, body).await
    }

    pub async fn publish_bytes(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        channel.publish("", queue, body, Headers::new()).await?;
        debug!(queue = %queue, "Message published");
        Ok(())
    }

    /// Start one sequential dispatch loop for `queue`
    ///
    /// The subscription is resumed automatically after a reconnect.
    pub async fn consume<H>(&self, queue: &str, handler: H) -> Result<(), BrokerError>
    where
        H: DeliveryHandler + 'static,
    {
        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);

        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let mut state = self.inner.state.write().await;
        let channel = match (&state.status, &state.channel) {
            (ConnectionStatus::Connected, Some(channel)) => channel.clone(),
            _ => return Err(BrokerError::NotConnected),
        };

        self.start_consumer(&channel, queue, handler.clone()).await?;
        state.subscriptions.push(Subscription {
            queue: queue.to_string(),
            handler,
        });
        Ok(())
    }

    /// Stop the monitor, then close the channel and connection; idempotent
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(true);

        let channel = {
            let mut state = self.inner.state.write().await;
            state.status = ConnectionStatus::Disconnected;
            state.subscriptions.clear();
            state.channel.take()
        };

        if let Some(channel) = channel {
            channel.close().await?;
        }
        info!("Broker closed");
        Ok(())
    }

    pub(crate) fn dead_letter_exchange(&self) -> &str {
        &self.inner.config.dead_letter_exchange
    }

    /// Publish to an explicit exchange and routing key, keeping `headers`
    pub(crate) async fn republish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        channel.publish(exchange, routing_key, body, headers).await
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let state = self.inner.state.read().await;
        match (&state.status, &state.channel) {
            (ConnectionStatus::Connected, Some(channel)) => Ok(channel.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    async fn start_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError> {
        let tag = format!(
            "{}-{}",
            queue,
            self.inner.consumer_seq.fetch_add(1, Ordering::Relaxed)
        );
        let deliveries = channel.consume(queue, &tag).await?;

        tokio::spawn(consumer::dispatch(
            self.clone(),
            queue.to_string(),
            deliveries,
            handler,
            self.inner.policy.clone(),
        ));
        Ok(())
    }

    /// Watch the live channel and recover it whenever the connection drops
    async fn monitor(self, mut channel: Arc<dyn BrokerChannel>) {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = channel.closed() => {}
            }
            if self.is_closed() {
                break;
            }

            {
                let mut state = self.inner.state.write().await;
                state.status = ConnectionStatus::Disconnected;
                state.channel = None;
            }
            warn!("Broker connection lost, reconnecting");

            match self.reconnect(&mut shutdown).await {
                Some(restored) => channel = restored,
                None => break,
            }
        }

        debug!("Broker monitor stopped");
    }

    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.state.write().await.status = ConnectionStatus::Reconnecting;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return None,
                _ = tokio::time::sleep(self.inner.config.reconnect_delay) => {}
            }

            let channel = match self.inner.connector.connect().await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Reconnect attempt failed");
                    continue;
                }
            };

            let topology = self.inner.state.read().await.topology.clone();
            if let Err(e) = topology.apply(channel.as_ref()).await {
                warn!(attempt = attempt, error = %e, "Topology replay failed");
                let _ = channel.close().await;
                continue;
            }

            let mut state = self.inner.state.write().await;
            if self.is_closed() {
                drop(state);
                let _ = channel.close().await;
                return None;
            }
            state.status = ConnectionStatus::Connected;
            state.channel = Some(channel.clone());

            let resumed: Vec<(String, Arc<dyn DeliveryHandler>)> = state
                .subscriptions
                .iter()
                .map(|s| (s.queue.clone(), s.handler.clone()))
                .collect();
            for (queue, handler) in resumed {
                if let Err(e) = self.start_consumer(&channel, &queue, handler).await {
                    warn!(queue = %queue, error = %e, "Failed to resume consumer");
                }
            }

            info!(
                attempt = attempt,
                subscriptions = state.subscriptions.len(),
                "Broker reconnected, topology restored"
            );
            return Some(channel);
        }
    }
}
