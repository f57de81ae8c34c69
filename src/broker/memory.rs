use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::errors::BrokerError;
use super::topology::{Binding, Topology};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    Headers, QueueArguments,
};

/// A message as stored by the in-memory broker
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

struct MemoryConsumer {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    channel_id: u64,
    message: StoredMessage,
}

struct MemoryQueue {
    args: QueueArguments,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn new(args: QueueArguments) -> Self {
        Self {
            args,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct BrokerState {
    available: bool,
    exchanges: BTreeMap<String, ExchangeKind>,
    queues: BTreeMap<String, MemoryQueue>,
    bindings: BTreeMap<String, BTreeSet<Binding>>,
    open_channels: HashMap<u64, Arc<watch::Sender<bool>>>,
    published: Vec<StoredMessage>,
    next_channel_id: u64,
    next_delivery_tag: u64,
}

type SharedState = Arc<Mutex<BrokerState>>;

impl BrokerState {
    fn new() -> Self {
        Self {
            available: true,
            exchanges: BTreeMap::new(),
            queues: BTreeMap::new(),
            bindings: BTreeMap::new(),
            open_channels: HashMap::new(),
            published: Vec::new(),
            next_channel_id: 1,
            next_delivery_tag: 1,
        }
    }

    fn ensure_open(&self, channel_id: u64) -> Result<(), BrokerError> {
        if self.open_channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(BrokerError::Channel("channel closed".to_string()))
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .keys()
                .filter(|name| name.as_str() == routing_key)
                .cloned()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Channel(format!("no exchange '{}'", exchange)))?;

        Ok(self
            .bindings
            .iter()
            .filter(|(_, bindings)| {
                bindings.iter().any(|binding| {
                    binding.exchange == exchange
                        && match kind {
                            ExchangeKind::Fanout => true,
                            ExchangeKind::Direct => binding.routing_key == routing_key,
                            ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                        }
                })
            })
            .map(|(queue, _)| queue.clone())
            .collect())
    }

    fn enqueue(&mut self, shared: &SharedState, queue: &str, message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
        }
        self.pump(shared, queue);
    }

    /// Hand ready messages to consumers round-robin
    fn pump(&mut self, shared: &SharedState, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let channel_id = queue.consumers[index].channel_id;
            let tag = self.next_delivery_tag;
            self.next_delivery_tag += 1;

            let delivery = Delivery::new(
                message.body.clone(),
                message.headers.clone(),
                message.exchange.clone(),
                message.routing_key.clone(),
                Box::new(MemoryAcker {
                    state: shared.clone(),
                    queue: queue_name.to_string(),
                    tag,
                    channel_id,
                }),
            );

            if queue.consumers[index].sender.send(delivery).is_err() {
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            queue.unacked.insert(
                tag,
                Unacked {
                    channel_id,
                    message,
                },
            );
            queue.next_consumer = index + 1;
        }
    }

    /// Drop the channel's consumers and requeue whatever it left unacked
    fn close_channel(&mut self, shared: &SharedState, channel_id: u64) {
        if let Some(closed) = self.open_channels.remove(&channel_id) {
            closed.send_replace(true);
        }

        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);

            let orphaned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in orphaned.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    queue.ready.push_front(unacked.message);
                }
            }
            touched.push(name.clone());
        }

        for name in touched {
            self.pump(shared, &name);
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            words_match(&pattern[1..], key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => words_match(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => words_match(&pattern[1..], &key[1..]),
        _ => false,
    }
}

/// In-process broker with AMQP-like routing and dead-lettering
///
/// Useful for tests and for running the server without an external broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: SharedState,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    /// When unavailable, `connect` fails
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Drop every open connection; declarations and messages survive
    pub async fn sever_connections(&self) {
        let mut state = self.state.lock().await;
        let channel_ids: Vec<u64> = state.open_channels.keys().copied().collect();
        for channel_id in channel_ids {
            state.close_channel(&self.state, channel_id);
        }
        debug!("In-memory broker severed all connections");
    }

    /// Drop every connection and forget all exchanges, queues, bindings and messages
    pub async fn restart(&self) {
        self.sever_connections().await;
        let mut state = self.state.lock().await;
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
        debug!("In-memory broker restarted");
    }

    pub async fn declared_topology(&self) -> Topology {
        let state = self.state.lock().await;
        let mut topology = Topology::new();
        for (name, kind) in &state.exchanges {
            topology.record_exchange(name, *kind);
        }
        for (name, queue) in &state.queues {
            topology.record_queue(name, queue.args.clone());
        }
        for (queue, bindings) in &state.bindings {
            for binding in bindings {
                topology.record_binding(queue, &binding.exchange, &binding.routing_key);
            }
        }
        topology
    }

    /// Messages waiting for a consumer
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Remove and return every ready message in `queue`
    pub async fn drain_queue(&self, queue: &str) -> Vec<StoredMessage> {
        let mut state = self.state.lock().await;
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    /// Every message accepted by a `publish` call, in order
    pub async fn published(&self) -> Vec<StoredMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn open_connections(&self) -> usize {
        self.state.lock().await.open_channels.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.state.lock().await;
        if !state.available {
            return Err(BrokerError::Connection("broker unavailable".to_string()));
        }

        let channel_id = state.next_channel_id;
        state.next_channel_id += 1;
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        state.open_channels.insert(channel_id, closed.clone());

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            channel_id,
            closed,
        }))
    }
}

struct MemoryChannel {
    state: SharedState,
    channel_id: u64,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.channel_id)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Channel(format!(
                "exchange '{}' already declared as {:?}",
                name, existing
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.channel_id)?;
        match state.queues.get(name) {
            Some(existing) if existing.args != *args => Err(BrokerError::Channel(format!(
                "queue '{}' already declared with different arguments",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), MemoryQueue::new(args.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.channel_id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{}'", exchange)));
        }
        state
            .bindings
            .entry(queue.to_string())
            .or_default()
            .insert(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.channel_id)?;

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            headers,
        };
        let targets = state.route(exchange, routing_key)?;
        for queue in targets {
            state.enqueue(&self.state, &queue, message.clone());
        }
        state.published.push(message);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_open(self.channel_id)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(MemoryConsumer {
                channel_id: self.channel_id,
                sender,
            }),
            None => return Err(BrokerError::Channel(format!("no queue '{}'", queue))),
        }
        state.pump(&self.state, queue);

        debug!(queue = %queue, consumer_tag = %consumer_tag, "In-memory consumer attached");

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok::<_, BrokerError>(delivery), receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.close_channel(&self.state, self.channel_id);
        Ok(())
    }
}

struct MemoryAcker {
    state: SharedState,
    queue: String,
    tag: u64,
    channel_id: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState) -> Result<StoredMessage, BrokerError> {
        state.ensure_open(self.channel_id)?;
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .map(|unacked| unacked.message)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", self.tag)))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        self.take(&mut state).map(|_| ())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let message = self.take(&mut state)?;

        let dead_letter_exchange = state
            .queues
            .get(&self.queue)
            .and_then(|q| q.args.dead_letter_exchange.clone());

        if let Some(exchange) = dead_letter_exchange {
            let targets = state
                .route(&exchange, &message.routing_key)
                .unwrap_or_default();
            for queue in targets {
                let dead = StoredMessage {
                    exchange: exchange.clone(),
                    ..message.clone()
                };
                state.enqueue(&self.state, &queue, dead);
            }
        }
        Ok(())
    }
}
