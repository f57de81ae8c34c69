use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::errors::BrokerError;
use super::transport::{BrokerChannel, ExchangeKind, QueueArguments};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
}

/// Every exchange, queue and binding declared so far
///
/// Replayed in full onto each new channel after a reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: BTreeMap<String, ExchangeKind>,
    queues: BTreeMap<String, QueueArguments>,
    bindings: BTreeMap<String, BTreeSet<Binding>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exchange(&mut self, name: &str, kind: ExchangeKind) {
        self.exchanges.insert(name.to_string(), kind);
    }

    pub fn record_queue(&mut self, name: &str, args: QueueArguments) {
        self.queues.insert(name.to_string(), args);
    }

    pub fn record_binding(&mut self, queue: &str, exchange: &str, routing_key: &str) {
        self.bindings
            .entry(queue.to_string())
            .or_default()
            .insert(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
    }

    pub fn exchanges(&self) -> &BTreeMap<String, ExchangeKind> {
        &self.exchanges
    }

    pub fn queues(&self) -> &BTreeMap<String, QueueArguments> {
        &self.queues
    }

    pub fn bindings(&self) -> &BTreeMap<String, BTreeSet<Binding>> {
        &self.bindings
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Declare everything on `channel`: exchanges, then queues, then bindings
    pub async fn apply(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        for (name, kind) in &self.exchanges {
            channel.declare_exchange(name, *kind).await?;
        }
        for (name, args) in &self.queues {
            channel.declare_queue(name, args).await?;
        }
        for (queue, bindings) in &self.bindings {
            for binding in bindings {
                channel
                    .bind_queue(queue, &binding.exchange, &binding.routing_key)
                    .await?;
            }
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.values().map(BTreeSet::len).sum::<usize>(),
            "Topology applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::transport::BrokerConnector;

    fn sample_topology() -> Topology {
        let mut topology = Topology::new();
        topology.record_exchange("dlx", ExchangeKind::Fanout);
        topology.record_exchange("events", ExchangeKind::Topic);
        topology.record_queue("dead", QueueArguments::default());
        topology.record_queue(
            "bids",
            QueueArguments {
                dead_letter_exchange: Some("dlx".to_string()),
            },
        );
        topology.record_binding("dead", "dlx", "");
        topology.record_binding("bids", "events", "bid.*");
        topology
    }

    #[test]
    fn test_recording_twice_is_idempotent() {
        let mut topology = sample_topology();
        topology.record_binding("bids", "events", "bid.*");
        topology.record_exchange("events", ExchangeKind::Topic);

        assert_eq!(topology, sample_topology());
        assert_eq!(topology.bindings()["bids"].len(), 1);
    }

    #[test]
    fn test_empty_topology() {
        assert!(Topology::new().is_empty());
        assert!(!sample_topology().is_empty());
        assert!(sample_topology().has_queue("bids"));
    }

    #[tokio::test]
    async fn test_apply_declares_everything_on_fresh_channel() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        let topology = sample_topology();

        topology.apply(channel.as_ref()).await.unwrap();

        assert_eq!(broker.declared_topology().await, topology);
    }

    #[tokio::test]
    async fn test_apply_fails_on_closed_channel() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        broker.sever_connections().await;

        let result = sample_topology().apply(channel.as_ref()).await;

        assert!(result.is_err());
    }
}
