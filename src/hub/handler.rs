use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use super::connection::Connection;
use super::messages::{RoomId, UserId};
use crate::shared::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub room_id: Option<RoomId>,
}

/// WebSocket endpoint that authenticates via the Sec-WebSocket-Protocol header
/// GET /ws?room_id={room_id} with a JWT as the offered subprotocol
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(app_state): State<AppState>,
) -> Result<Response, AppError> {
    let token = headers
        .get("sec-websocket-protocol")
        .and_then(|h| h.to_str().ok())
        .and_then(|protocols| protocols.split(',').map(str::trim).find(|p| !p.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| {
            warn!("Missing or invalid Sec-WebSocket-Protocol header");
            AppError::Unauthorized("Missing authentication token".to_string())
        })?;

    let user_id = app_state.authenticator.authenticate(&token).await?;

    info!(
        user_id = user_id,
        room_id = ?params.room_id,
        "WebSocket authentication successful"
    );

    let max_frame_bytes = app_state.hub_config.max_frame_bytes;
    Ok(ws
        .protocols([token])
        .max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| {
            handle_websocket_connection(socket, user_id, params.room_id, app_state)
        }))
}

async fn handle_websocket_connection(
    socket: WebSocket,
    user_id: UserId,
    room_id: Option<RoomId>,
    app_state: AppState,
) {
    let (sink, stream) = socket.split();

    let connection = Connection::new(
        user_id,
        room_id,
        app_state.hub.clone(),
        app_state.chat_service.clone(),
        app_state.hub_config.clone(),
    );
    connection.run(sink, stream).await;
}
