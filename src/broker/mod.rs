// Durable message-broker client
//
// Topology bookkeeping, publish/consume, retry with dead-lettering and
// transparent reconnection, over a pluggable transport.

// Public API
pub use amqp::AmqpConnector;
pub use client::{Broker, ConnectionStatus};
pub use consumer::DeliveryHandler;
pub use errors::{BrokerError, HandlerError};
pub use memory::{InMemoryBroker, StoredMessage};
pub use retry::{
    last_error, retry_count, RetryDecision, RetryPolicy, LAST_ERROR_HEADER, RETRY_COUNT_HEADER,
};
pub use topology::{Binding, Topology};
pub use transport::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    HeaderValue, Headers, QueueArguments,
};

// Internal modules
mod amqp;
mod client;
mod consumer;
mod errors;
mod memory;
mod retry;
mod topology;
mod transport;
