use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::models::RoomId;

use crate::dispatcher::Dispatcher;
use crate::room::Outbound;

/// Per-socket settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server sends a Ping this often.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered Pings before the socket is dropped.
    pub max_missed_pongs: u8,
    /// Largest text frame accepted from a client.
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_missed_pongs: 2,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Drive one websocket for its whole life inside a single room.
///
/// Any exit path (close frame, socket error, heartbeat timeout) ends in the
/// room's leave handling, so an abrupt disconnect clears presence the same
/// way an explicit `remove-user` does.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    room_id: RoomId,
    config: ConnectionConfig,
) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();

    let (tx, mut room_rx) = mpsc::unbounded_channel::<Outbound>();
    let room = dispatcher.join(room_id.clone(), conn_id, tx).await;
    info!("{} connected to room {}", conn_id, room_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room frames -> client, with heartbeat
    let heartbeat_interval = config.heartbeat_interval;
    let max_missed = config.max_missed_pongs;
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = room_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= max_missed {
                            warn!("{} heartbeat timeout (missed {} pongs), dropping", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    // Read frames from client
    let recv_room = room.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if !recv_room.inbound(conn_id, text.as_str().to_owned()) {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    warn!("{} sent a {} byte binary frame, dropping", conn_id, data.len());
                }
                Ok(Message::Pong(_)) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {}
                Err(e) => {
                    debug!("{} socket error: {}", conn_id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    room.leave(conn_id);
    info!("{} disconnected from room {}", conn_id, room_id);
}
