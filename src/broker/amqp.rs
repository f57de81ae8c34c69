use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::errors::BrokerError;
use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, ExchangeKind,
    HeaderValue, Headers, QueueArguments,
};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connects to an AMQP 0-9-1 broker
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let notifier = closed.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection lost");
            notifier.send_replace(true);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        info!("AMQP connection and channel opened in confirm mode");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            closed,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed: Arc<watch::Sender<bool>>,
}

impl AmqpChannel {
    /// A dead channel is as good as a dead connection for our purposes
    fn channel_error(&self, err: lapin::Error) -> BrokerError {
        if !self.channel.status().connected() || !self.connection.status().connected() {
            self.closed.send_replace(true);
        }
        BrokerError::Channel(err.to_string())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.channel_error(e))
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &args.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(exchange.clone().into()),
            );
        }

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| self.channel_error(e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.channel_error(e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(ShortString::from("application/json"))
            .with_headers(to_field_table(&headers));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| self.channel_error(e))?;
        let confirmation = confirm.await.map_err(|e| self.channel_error(e))?;
        confirmed(exchange, routing_key, confirmation)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.channel_error(e))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "AMQP consumer started");

        let deliveries = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.data.clone(),
                    from_field_table(delivery.properties.headers().as_ref()),
                    delivery.exchange.as_str().to_string(),
                    delivery.routing_key.as_str().to_string(),
                    Box::new(AmqpAcker {
                        acker: delivery.acker.clone(),
                    }),
                )
            })
            .map_err(|e| BrokerError::Channel(e.to_string()))
        });
        Ok(deliveries.boxed())
    }

    async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.send_replace(true);
        let channel_result = self.channel.close(REPLY_SUCCESS, "closing").await;
        let connection_result = self.connection.close(REPLY_SUCCESS, "closing").await;
        channel_result.map_err(|e| BrokerError::Channel(e.to_string()))?;
        connection_result.map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}

/// Only a broker ack counts as published; the channel is always in confirm mode
fn confirmed(
    exchange: &str,
    routing_key: &str,
    confirmation: Confirmation,
) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(_) => {
            debug!(exchange = %exchange, routing_key = %routing_key, "Publish confirmed");
            Ok(())
        }
        Confirmation::Nack(_) => Err(BrokerError::Channel(format!(
            "broker nacked publish to {}/{}",
            exchange, routing_key
        ))),
        Confirmation::NotRequested => Err(BrokerError::Channel(
            "publish confirmation not requested".to_string(),
        )),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        let value = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::UInt(n) => u32::try_from(*n)
                .map(AMQPValue::LongUInt)
                .unwrap_or_else(|_| AMQPValue::LongLongInt(i64::try_from(*n).unwrap_or(i64::MAX))),
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::Text(s) => AMQPValue::LongString(s.clone().into()),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(name.clone()), value);
    }
    table
}

/// Collapse every AMQP field encoding into the handful of header shapes we use
fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };

    for (name, value) in table.inner() {
        let value = match value {
            AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
            AMQPValue::ShortShortUInt(n) => HeaderValue::UInt(u64::from(*n)),
            AMQPValue::ShortUInt(n) => HeaderValue::UInt(u64::from(*n)),
            AMQPValue::LongUInt(n) => HeaderValue::UInt(u64::from(*n)),
            AMQPValue::Timestamp(n) => HeaderValue::UInt(*n),
            AMQPValue::Float(f) => HeaderValue::Float(f64::from(*f)),
            AMQPValue::Double(f) => HeaderValue::Float(*f),
            AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
            AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
            AMQPValue::LongString(s) => {
                HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            other => {
                debug!(header = %name.as_str(), value = ?other, "Skipping unsupported header");
                continue;
            }
        };
        headers.insert(name.as_str().to_string(), value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::retry::{retry_count, RETRY_COUNT_HEADER};

    #[test]
    fn test_narrow_integer_headers_normalize_to_same_retry_count() {
        for value in [
            AMQPValue::ShortShortInt(2),
            AMQPValue::ShortInt(2),
            AMQPValue::LongInt(2),
            AMQPValue::LongLongInt(2),
            AMQPValue::ShortShortUInt(2),
            AMQPValue::ShortUInt(2),
            AMQPValue::LongUInt(2),
        ] {
            let mut table = FieldTable::default();
            table.insert(ShortString::from(RETRY_COUNT_HEADER), value);

            let headers = from_field_table(Some(&table));

            assert_eq!(retry_count(&headers), 2);
        }
    }

    #[test]
    fn test_only_acked_publish_confirmation_succeeds() {
        assert!(confirmed("", "q1", Confirmation::Ack(None)).is_ok());
        assert!(matches!(
            confirmed("", "q1", Confirmation::Nack(None)),
            Err(BrokerError::Channel(_))
        ));
        assert!(matches!(
            confirmed("", "q1", Confirmation::NotRequested),
            Err(BrokerError::Channel(_))
        ));
    }

    #[test]
    fn test_headers_survive_conversion_to_field_table() {
        let mut headers = Headers::new();
        headers.insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::Int(3));
        headers.insert(
            "x-last-error".to_string(),
            HeaderValue::Text("boom".to_string()),
        );
        headers.insert("flag".to_string(), HeaderValue::Bool(true));

        let converted = from_field_table(Some(&to_field_table(&headers)));

        assert_eq!(converted, headers);
    }

    #[test]
    fn test_missing_header_table_is_empty() {
        assert!(from_field_table(None).is_empty());
    }
}
