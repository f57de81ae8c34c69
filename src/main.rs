use std::error::Error;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketplace_realtime::auth::JwtAuthenticator;
use marketplace_realtime::broker::{AmqpConnector, Broker};
use marketplace_realtime::chat::InMemoryChatService;
use marketplace_realtime::config::AppConfig;
use marketplace_realtime::hub::Hub;
use marketplace_realtime::notify::NotificationRelay;
use marketplace_realtime::server::{build_router, shutdown};
use marketplace_realtime::shared::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketplace_realtime=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting marketplace real-time server");

    let config = AppConfig::from_env();
    config.hub.validate()?;

    // Without a broker there is nothing to deliver; fail startup
    let broker = match Broker::connect(
        Arc::new(AmqpConnector::new(config.broker.url.clone())),
        config.broker.clone(),
    )
    .await
    {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "Failed to connect to the message broker");
            return Err(e.into());
        }
    };
    broker.declare_queue(&config.broker.notification_queue).await?;

    let hub = Hub::new();
    let hub_task = hub.start();

    broker
        .consume(
            &config.broker.notification_queue,
            NotificationRelay::new(hub.clone()),
        )
        .await?;

    let app_state = AppState::new(
        hub.clone(),
        Arc::new(InMemoryChatService::new()),
        Arc::new(JwtAuthenticator::new(config.server.jwt_secret.clone())),
        config.hub.clone(),
    );
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "Server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    shutdown(&broker, &hub, hub_task).await?;

    info!("Server stopped");
    Ok(())
}
