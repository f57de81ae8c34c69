use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::client::Broker;
use super::errors::HandlerError;
use super::retry::{RetryDecision, RetryPolicy};
use super::transport::{Delivery, DeliveryStream};

/// Processes message bodies taken off a queue
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        (self)(body.to_vec()).await
    }
}

/// How a single delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Republished { attempt: u32 },
    DeadLettered,
    /// Settling failed; the broker still owns the delivery
    Unsettled,
}

/// Sequential delivery loop for one queue; ends when the stream closes
pub(crate) async fn dispatch(
    broker: Broker,
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    policy: RetryPolicy,
) {
    info!(queue = %queue, "Dispatch loop started");

    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => {
                let settlement = process(&broker, &queue, &delivery, handler.as_ref(), &policy).await;
                debug!(queue = %queue, settlement = ?settlement, "Delivery settled");
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Delivery stream failed");
                break;
            }
        }
    }

    info!(queue = %queue, "Delivery stream closed, dispatch loop ended");
}

/// Run the handler and settle the delivery exactly once
async fn process(
    broker: &Broker,
    queue: &str,
    delivery: &Delivery,
    handler: &dyn DeliveryHandler,
    policy: &RetryPolicy,
) -> Settlement {
    let reason = match handler.handle(&delivery.body).await {
        Ok(()) => {
            return match delivery.ack().await {
                Ok(()) => Settlement::Acked,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to ack delivery");
                    Settlement::Unsettled
                }
            };
        }
        Err(HandlerError::Malformed(reason)) => {
            warn!(queue = %queue, reason = %reason, "Malformed payload, dead-lettering");
            return reject(queue, delivery).await;
        }
        Err(HandlerError::Failed(reason)) => reason,
    };

    match policy.on_failure(&delivery.headers, &reason) {
        RetryDecision::Republish {
            attempt,
            delay,
            headers,
        } => {
            warn!(
                queue = %queue,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Handler failed, will retry"
            );
            tokio::time::sleep(delay).await;

            if let Err(e) = broker
                .republish(
                    &delivery.exchange,
                    &delivery.routing_key,
                    delivery.body.clone(),
                    headers,
                )
                .await
            {
                error!(
                    queue = %queue,
                    attempt = attempt,
                    error = %e,
                    "Republish failed, leaving delivery unacknowledged"
                );
                return Settlement::Unsettled;
            }

            match delivery.ack().await {
                Ok(()) => Settlement::Republished { attempt },
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to ack republished delivery");
                    Settlement::Unsettled
                }
            }
        }
        RetryDecision::DeadLetter { attempts, headers } => {
            error!(
                queue = %queue,
                attempts = attempts,
                error = %reason,
                "Retries exhausted, dead-lettering"
            );

            if let Err(e) = broker
                .republish(
                    broker.dead_letter_exchange(),
                    queue,
                    delivery.body.clone(),
                    headers,
                )
                .await
            {
                warn!(
                    queue = %queue,
                    error = %e,
                    "Dead-letter publish failed, rejecting with original headers"
                );
                return reject(queue, delivery).await;
            }

            match delivery.ack().await {
                Ok(()) => Settlement::DeadLettered,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to ack dead-lettered delivery");
                    Settlement::Unsettled
                }
            }
        }
    }
}

async fn reject(queue: &str, delivery: &Delivery) -> Settlement {
    match delivery.reject().await {
        Ok(()) => Settlement::DeadLettered,
        Err(e) => {
            warn!(queue = %queue, error = %e, "Failed to reject delivery");
            Settlement::Unsettled
        }
    }
}
