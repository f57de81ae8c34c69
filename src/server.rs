use axum::{routing::get, Router};
use tokio::task::{JoinError, JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::Broker;
use crate::hub::{websocket_handler, Hub};
use crate::shared::AppState;

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Close the broker, then stop the hub and wait for its loop to finish
///
/// A broker close error is logged; the hub is shut down regardless.
pub async fn shutdown(
    broker: &Broker,
    hub: &Hub,
    hub_task: JoinHandle<()>,
) -> Result<(), JoinError> {
    if let Err(e) = broker.close().await {
        error!(error = %e, "Failed to close broker cleanly");
    }
    hub.shutdown().await;
    hub_task.await?;
    info!("Services stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::broker::{
        BrokerChannel, BrokerConnector, BrokerError, DeliveryStream, ExchangeKind, Headers,
        InMemoryBroker, QueueArguments,
    };
    use crate::config::BrokerConfig;
    use crate::hub::ConnectionHandle;

    /// Delegates to the in-memory broker but refuses to close
    struct StubbornConnector {
        memory: InMemoryBroker,
    }

    struct StubbornChannel {
        inner: Arc<dyn BrokerChannel>,
    }

    #[async_trait]
    impl BrokerConnector for StubbornConnector {
        async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
            let inner = self.memory.connect().await?;
            Ok(Arc::new(StubbornChannel { inner }))
        }
    }

    #[async_trait]
    impl BrokerChannel for StubbornChannel {
        async fn declare_exchange(
            &self,
            name: &str,
            kind: ExchangeKind,
        ) -> Result<(), BrokerError> {
            self.inner.declare_exchange(name, kind).await
        }

        async fn declare_queue(
            &self,
            name: &str,
            args: &QueueArguments,
        ) -> Result<(), BrokerError> {
            self.inner.declare_queue(name, args).await
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> Result<(), BrokerError> {
            self.inner.bind_queue(queue, exchange, routing_key).await
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            body: Vec<u8>,
            headers: Headers,
        ) -> Result<(), BrokerError> {
            self.inner.publish(exchange, routing_key, body, headers).await
        }

        async fn consume(
            &self,
            queue: &str,
            consumer_tag: &str,
        ) -> Result<DeliveryStream, BrokerError> {
            self.inner.consume(queue, consumer_tag).await
        }

        async fn closed(&self) {
            self.inner.closed().await
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Err(BrokerError::Channel("close refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_hub_even_when_broker_close_fails() {
        let connector = StubbornConnector {
            memory: InMemoryBroker::new(),
        };
        let broker = Broker::connect(Arc::new(connector), BrokerConfig::default())
            .await
            .unwrap();

        let hub = Hub::new();
        let hub_task = hub.start();
        let (handle, _outbound) = ConnectionHandle::new(1, Some(3), 4);
        hub.register(handle.clone());
        assert_eq!(hub.user_connections(1).await, 1);

        tokio::time::timeout(Duration::from_secs(2), shutdown(&broker, &hub, hub_task))
            .await
            .expect("shutdown stalled")
            .unwrap();

        assert!(handle.is_closed());
        assert!(hub.stats().await.is_err());
    }
}
