// Library crate for the marketplace real-time delivery core
// This file exposes the public API for the binary and integration tests

pub mod auth;
pub mod broker;
pub mod chat;
pub mod config;
pub mod hub;
pub mod notify;
pub mod server;
pub mod shared;

// Re-export commonly used types for easier access in tests
pub use broker::{Broker, BrokerError, DeliveryHandler, HandlerError, InMemoryBroker};
pub use config::{AppConfig, BrokerConfig, HubConfig};
pub use hub::{Envelope, Hub, HubError};
pub use notify::{NotificationEvent, NotificationRelay};
pub use shared::{AppError, AppState};
