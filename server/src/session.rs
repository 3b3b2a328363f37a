//! WebSocket session lifecycle for both socket endpoints.
//!
//! `/events` is the per-user notification stream the delivery worker
//! pushes into; `/chat/{hex}` is the bidirectional per-conversation
//! channel feeding the dispatcher. Authentication and participation are
//! checked before the upgrade completes, so failed handshakes answer with
//! a plain HTTP status.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::auth::{self, Principal};
use crate::db::now_ms;
use crate::dispatch;
use crate::error::ChatError;
use crate::hub::{chat_topic, EVENTS_TOPIC};
use crate::models::Conversation;
use crate::registry::ConnectionHandle;
use crate::state::SharedState;

/// Close codes for terminations after the upgrade has completed.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
pub const CLOSE_NOT_FOUND: u16 = 4404;
pub const CLOSE_INTERNAL: u16 = 1011;

const OUTBOUND_CAPACITY: usize = 100;

fn cookie_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::COOKIE).and_then(|v| v.to_str().ok())
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `GET /events` upgrade: per-user notification stream.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Response {
    let principal = match auth::authenticate(cookie_header(&headers), &state.config.jwt_secret) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    info!(user = %principal.hex, "notification socket accepted");
    ws.on_upgrade(move |socket| run_session(socket, principal, None, state))
}

/// `GET /chat/{hex}` upgrade: bidirectional conversation channel.
pub async fn chat_handler(
    ws: WebSocketUpgrade,
    Path(hex): Path<String>,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Response {
    let principal = match auth::authenticate(cookie_header(&headers), &state.config.jwt_secret) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    let conversation = match state.db.find_conversation(&hex).await {
        Ok(conversation) => conversation,
        Err(err) => return err.into_response(),
    };
    if !conversation.is_participant(&principal.hex) {
        return ChatError::Unauthenticated("Not a participant of this conversation".into())
            .into_response();
    }

    info!(user = %principal.hex, conversation = %hex, "chat socket accepted");
    ws.on_upgrade(move |socket| run_session(socket, principal, Some(conversation), state))
}

/// Open → message → close for one socket. Inbound frames are processed
/// strictly in arrival order; outbound frames funnel through one task so
/// per-socket ordering holds in both directions.
async fn run_session(
    socket: WebSocket,
    principal: Principal,
    conversation: Option<Conversation>,
    state: SharedState,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut personal_rx) = broadcast::channel::<Message>(OUTBOUND_CAPACITY);

    let topic = match &conversation {
        Some(conversation) => chat_topic(&conversation.hex),
        None => EVENTS_TOPIC.to_string(),
    };
    let mut topic_rx = state.hub.subscribe(&topic).await;

    let connection_id = state.registry.next_id();
    state
        .registry
        .add(
            &principal.hex,
            ConnectionHandle {
                id: connection_id,
                sender: outbound.clone(),
            },
        )
        .await;

    if let Some(conversation) = &conversation {
        // The conversation may have vanished between handshake and upgrade.
        if state.db.find_conversation(&conversation.hex).await.is_err() {
            let _ = sink
                .send(close_message(CLOSE_NOT_FOUND, "Conversation not found"))
                .await;
            state.registry.remove(&principal.hex, connection_id).await;
            return;
        }

        if let Err(err) = state
            .db
            .set_participant_online(&conversation.hex, &principal.hex, true)
            .await
        {
            warn!(user = %principal.hex, %err, "failed to flag participant online");
            let _ = sink
                .send(close_message(CLOSE_INTERNAL, "Internal error"))
                .await;
            state.registry.remove(&principal.hex, connection_id).await;
            return;
        }

        let joined = json!({
            "kind": "system",
            "message": { "message": "A user joined", "createdAt": now_ms() }
        });
        state
            .hub
            .publish(&topic, Message::Text(joined.to_string()))
            .await;
    }

    // Single writer: merges direct pushes, topic broadcasts, keepalives.
    let idle = Duration::from_secs(state.config.socket_idle_secs);
    let keepalive = Duration::from_secs((state.config.socket_idle_secs / 2).max(30));
    let user = principal.hex.clone();
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(keepalive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await; // immediate first tick
        loop {
            tokio::select! {
                received = personal_rx.recv() => match received {
                    Ok(frame) => {
                        let closing = matches!(frame, Message::Close(_));
                        if sink.send(frame).await.is_err() || closing {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user = %user, skipped, "outbound channel lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                received = topic_rx.recv() => match received {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user = %user, skipped, "topic subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let frame = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                info!(user = %principal.hex, "socket idle timeout");
                let _ = outbound.send(close_message(1000, "Idle timeout"));
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                // Abrupt transport loss takes the same path as a close.
                debug!(user = %principal.hex, %err, "socket errored");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        if principal.exp <= now_secs() {
            let _ = outbound.send(close_message(CLOSE_UNAUTHENTICATED, "Token expired"));
            break;
        }

        match frame {
            Message::Text(text) => match &conversation {
                Some(conversation) => {
                    dispatch::handle_frame(&text, &principal, conversation, &state, &outbound)
                        .await;
                }
                None => {
                    debug!(user = %principal.hex, "frame on notification socket ignored");
                }
            },
            Message::Binary(payload) => {
                // Forwarded verbatim, never parsed.
                if conversation.is_some() {
                    state.hub.publish(&topic, Message::Binary(payload)).await;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.registry.remove(&principal.hex, connection_id).await;
    if let Some(conversation) = &conversation {
        if let Err(err) = state
            .db
            .set_participant_online(&conversation.hex, &principal.hex, false)
            .await
        {
            warn!(user = %principal.hex, %err, "failed to flag participant offline");
        }
    }
    send_task.abort();
    info!(user = %principal.hex, "socket session ended");
}
