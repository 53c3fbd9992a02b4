//! Signaling WebSocket transport
//!
//! Authentication, admission and membership lookup happen before the
//! upgrade. After it, the socket is split: a writer task drains the
//! connection's outbound queue as JSON text frames and the reader forwards
//! decoded frames to the coordinator.

use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use huddle_core::models::{ConnectionId, RoomId, UserId};
use huddle_proto::{ClientMessage, ServerMessage};

use crate::http::{AppError, AppState};

/// Keepalive ping cadence; pongs count as activity for the idle sweep
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: Option<String>,
}

/// Signaling endpoint
///
/// Clients should provide JWT token via query parameter:
/// <ws://host/ws?token={jwt_token}>
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::unauthorized("Missing token query parameter"))?;

    let user_id = state.verifier.verify(&token)?;
    state.registry.check_capacity(&user_id)?;
    let rooms = state.directory.rooms_of(&user_id).await?;

    Ok(ws
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id, rooms)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    user_id: UserId,
    rooms: HashSet<RoomId>,
) {
    let connection_id = ConnectionId::new();
    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket connection established"
    );

    // The coordinator holds the only strong sender, so detaching the
    // connection there closes the writer below.
    let (tx, rx) = mpsc::channel::<ServerMessage>(state.outbound_buffer);
    let replies = tx.downgrade();

    if state
        .coordinator
        .connect(connection_id.clone(), user_id.clone(), rooms, tx)
        .await
        .is_err()
    {
        error!("Coordinator not running, WebSocket connection not supported");
        return;
    }

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, rx, connection_id.clone()));

    loop {
        tokio::select! {
            frame = stream.next() => {
                let forwarded = match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => state
                                .coordinator
                                .client(connection_id.clone(), message)
                                .await
                                .is_ok(),
                            Err(e) => {
                                debug!(connection_id = %connection_id, error = %e, "Malformed frame");
                                reply(&replies, ServerMessage::error(format!("Malformed message: {e}")));
                                true
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        reply(&replies, ServerMessage::error("Binary frames are not supported"));
                        true
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => state
                        .coordinator
                        .heartbeat(connection_id.clone())
                        .await
                        .is_ok(),
                    Some(Ok(Message::Close(_))) | None => false,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                        false
                    }
                };
                if !forwarded {
                    break;
                }
            }
            _ = &mut writer => break,
        }
    }

    if state.coordinator.disconnect(connection_id.clone()).await.is_err() {
        error!(connection_id = %connection_id, "Coordinator gone before disconnect");
    }
    writer.abort();

    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket connection closed"
    );
}

async fn write_frames(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
    connection_id: ConnectionId,
) {
    let mut keepalive = tokio::time::interval(PING_INTERVAL);
    keepalive.tick().await;

    loop {
        let frame = tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!(event_type = message.name(), "Failed to encode server message: {}", e);
                        continue;
                    }
                }
            }
            _ = keepalive.tick() => Message::Ping(Vec::new().into()),
        };

        if let Err(e) = sink.send(frame).await {
            debug!(connection_id = %connection_id, error = %e, "Failed to send WebSocket message");
            return;
        }
    }

    // Outlet detached by the coordinator
    let _ = sink.close().await;
}

fn reply(replies: &mpsc::WeakSender<ServerMessage>, message: ServerMessage) {
    if let Some(tx) = replies.upgrade() {
        let _ = tx.try_send(message);
    }
}
