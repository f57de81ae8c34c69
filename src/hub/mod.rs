// Public API
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState};
pub use handler::{websocket_handler, ConnectParams};
pub use messages::{ChatMessage, ClientMessage, Envelope, Notification, RoomId, UserId};
pub use service::{Hub, HubError, HubStats};
pub use socket::{Frame, FrameSink, FrameStream, SocketError};

// Internal modules
mod connection;
mod handler;
mod messages;
mod registry;
mod service;
mod socket;
