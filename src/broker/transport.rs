use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::errors::BrokerError;

/// Message metadata carried alongside the body
pub type Headers = BTreeMap<String, HeaderValue>;

/// Header values as they arrive from the wire
///
/// Brokers encode integers with whatever width the publisher chose, so a
/// numeric header may show up as any of the numeric variants.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

/// Arguments applied when a queue is declared
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// Exchange that receives messages rejected without requeue
    pub dead_letter_exchange: Option<String>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Settles a single delivery on the broker side
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject without requeue, letting the queue's dead-letter argument route it
    async fn reject(&self) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, unacknowledged until settled
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub exchange: String,
    pub routing_key: String,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        headers: Headers,
        exchange: String,
        routing_key: String,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            headers,
            exchange,
            routing_key,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Opens fresh connections to the broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// One connection plus its channel
///
/// A new channel knows nothing about what earlier channels declared.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish with persistent delivery mode
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Resolves once the underlying connection has been lost or closed
    async fn closed(&self);

    /// Close the channel, then the connection
    async fn close(&self) -> Result<(), BrokerError>;
}
