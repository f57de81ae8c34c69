use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::broker::{DeliveryHandler, HandlerError};
use crate::hub::{Hub, HubError, UserId};

/// Broker body published by domain services that want a user told about something
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub recipient_id: UserId,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NotificationEvent {
    pub fn new(recipient_id: UserId, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            recipient_id,
            kind: kind.into(),
            payload,
        }
    }
}

/// Bridges the notification queue to live connections
pub struct NotificationRelay {
    hub: Hub,
}

impl NotificationRelay {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl DeliveryHandler for NotificationRelay {
    #[instrument(skip_all)]
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let event: NotificationEvent = serde_json::from_slice(body)
            .map_err(|e| HandlerError::malformed(format!("notification event: {e}")))?;

        match self
            .hub
            .send_to_user(event.recipient_id, &event.kind, event.payload)
            .await
        {
            Ok(delivered) => {
                debug!(
                    recipient_id = event.recipient_id,
                    kind = %event.kind,
                    delivered = delivered,
                    "Notification relayed"
                );
                Ok(())
            }
            // Offline recipients read the durable record later
            Err(HubError::NoConnections(_)) => {
                debug!(recipient_id = event.recipient_id, "Recipient offline");
                Ok(())
            }
            Err(e @ HubError::Stopped) => Err(HandlerError::failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ConnectionHandle;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_reaches_recipient() {
        let hub = Hub::new();
        let _task = hub.start();
        let (handle, mut outbound) = ConnectionHandle::new(9, None, 4);
        hub.register(handle);
        let relay = NotificationRelay::new(hub.clone());

        let body = serde_json::to_vec(&NotificationEvent::new(9, "bid_created", json!({"bid_id": 1})))
            .unwrap();
        relay.handle(&body).await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "NOTIFICATION");
        assert_eq!(frame["payload"]["kind"], "bid_created");
    }

    #[tokio::test]
    async fn test_offline_recipient_is_not_an_error() {
        let hub = Hub::new();
        let _task = hub.start();
        let relay = NotificationRelay::new(hub);

        let result = relay
            .handle(br#"{"recipient_id":3,"kind":"news_published"}"#)
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_malformed() {
        let relay = NotificationRelay::new(Hub::new());

        let result = relay.handle(b"{not json").await;

        assert!(matches!(result, Err(HandlerError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_stopped_hub_is_retryable() {
        let hub = Hub::new();
        let task = hub.start();
        hub.shutdown().await;
        task.await.unwrap();
        let relay = NotificationRelay::new(hub);

        let result = relay
            .handle(br#"{"recipient_id":3,"kind":"news_published"}"#)
            .await;

        assert!(matches!(result, Err(HandlerError::Failed(_))));
    }
}
