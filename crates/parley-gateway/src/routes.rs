use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::warn;

use parley_types::models::RoomId;

use crate::connection::{self, ConnectionConfig};
use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub config: ConnectionConfig,
}

/// Socket and presence routes, addressed by `{kind}-{id}` room names.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/parties/chat/{room}", get(ws_upgrade))
        .route("/parties/chat/{room}/presence", get(presence))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let room_id = match room.parse::<RoomId>() {
        Ok(room_id) => room_id,
        Err(e) => {
            warn!("rejecting socket upgrade: {}", e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let GatewayState { dispatcher, config } = state;
    ws.max_message_size(config.max_frame_bytes)
        .on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, room_id, config))
}

async fn presence(State(state): State<GatewayState>, Path(room): Path<String>) -> Response {
    let Ok(room_id) = room.parse::<RoomId>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let users = state.dispatcher.roster(&room_id).await.unwrap_or_default();
    Json(serde_json::json!({ "users": users })).into_response()
}
