//! Manages the WebSocket connection lifecycle for both pipelines.

use super::{
    live::LiveConversation,
    presentation::{StartSessionRequest, handle_start_session},
    protocol::{ClientMessage, ServerMessage, message_type},
    sink::{ClientSink, WsSink},
};
use crate::{models::ErrorResponse, state::AppState};
use axum::{
    Json,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Identity attached to a connection when it is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionContext {
    pub user_id: String,
    /// Random id used to correlate log lines of one connection.
    pub connection_id: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub user_id: Option<String>,
}

/// Reads the user id from the `x-user-id` header, falling back to the
/// `user_id` query parameter (browsers cannot set headers on WebSocket requests).
fn authenticate(headers: &HeaderMap, query: &ConnectQuery) -> Option<ConnectionContext> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .or(query.user_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    Some(ConnectionContext {
        user_id: user_id.to_string(),
        connection_id: rand::random(),
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            message: "A user id is required".to_string(),
        }),
    )
        .into_response()
}

/// Upgrades a connection for the presentation pipeline.
pub async fn presentation_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Response {
    match authenticate(&headers, &query) {
        Some(ctx) => ws.on_upgrade(move |socket| handle_presentation_socket(socket, state, ctx)),
        None => unauthorized(),
    }
}

/// Upgrades a connection for the live conversation pipeline.
pub async fn live_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Response {
    match authenticate(&headers, &query) {
        Some(ctx) => ws.on_upgrade(move |socket| handle_live_socket(socket, state, ctx)),
        None => unauthorized(),
    }
}

/// A `start_session` the server cannot decode still gets an answer.
fn rejected_start_session(text: &str, error: &serde_json::Error) -> Option<ServerMessage> {
    (message_type(text).as_deref() == Some("start_session")).then(|| {
        ServerMessage::SessionError {
            message: format!("Failed to process session. Invalid request: {}", error),
        }
    })
}

/// Handles `start_session` requests one at a time, in arrival order.
#[instrument(
    name = "ws_presentation",
    skip_all,
    fields(connection_id = ctx.connection_id, user_id = %ctx.user_id)
)]
async fn handle_presentation_socket(socket: WebSocket, state: Arc<AppState>, ctx: ConnectionContext) {
    info!("New presentation connection.");
    let (socket_tx, mut socket_rx) = socket.split();
    let sink = WsSink::new(socket_tx);

    while let Some(msg_result) = socket_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::StartSession {
                    prompt_text,
                    session_id,
                    file_ids,
                    language_code,
                }) => {
                    let request = StartSessionRequest {
                        prompt_text,
                        session_id,
                        file_ids,
                        language_code,
                    };
                    handle_start_session(&state, &ctx, &sink, request).await;
                }
                Ok(_) => warn!("Ignoring a conversation message on the presentation endpoint."),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed client message.");
                    if let Some(reply) = rejected_start_session(&text, &e) {
                        let _ = sink.send(reply).await;
                    }
                }
            },
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                break;
            }
        }
    }
    info!("Presentation connection closed.");
}

/// Runs one live conversation connection until the client goes away.
#[instrument(
    name = "ws_live",
    skip_all,
    fields(connection_id = ctx.connection_id, user_id = %ctx.user_id)
)]
async fn handle_live_socket(socket: WebSocket, state: Arc<AppState>, ctx: ConnectionContext) {
    info!("New live conversation connection.");
    let (socket_tx, mut socket_rx) = socket.split();
    let sink: Arc<dyn ClientSink> = Arc::new(WsSink::new(socket_tx));
    let (mut conversation, mut events) =
        LiveConversation::new(state.live.clone(), sink, ctx.user_id.clone());

    loop {
        tokio::select! {
            msg_result = socket_rx.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::StartConversation { session_id, language_code }) => {
                            conversation.start(session_id, language_code).await;
                        }
                        Ok(ClientMessage::AudioStreamFromClient { chunk }) => {
                            conversation.push_encoded_audio(&chunk);
                        }
                        Ok(ClientMessage::ClientInterruption) => conversation.interrupt(),
                        Ok(ClientMessage::StartSession { .. }) => {
                            warn!("Ignoring start_session on the live endpoint.");
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                    },
                    Some(Ok(Message::Binary(data))) => conversation.push_audio(data),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the live connection.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            },
            Some(event) = events.transcription.recv() => conversation.on_transcription(event).await,
            Some(event) = events.turns.recv() => conversation.on_turn(event).await,
        }
    }

    conversation.shutdown();
    info!("Live conversation connection closed.");
}
