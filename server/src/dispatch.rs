//! The message state machine.
//!
//! Every inbound chat frame lands here. The dispatcher resolves the frame
//! `kind` through a fixed table, validates the payload, mutates persisted
//! state, publishes the resulting event to the conversation topic, and
//! enqueues a delivery job for recipients on other instances. Failures
//! turn into an `error` frame sent to the originating socket only.

use axum::extract::ws::Message;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::auth::Principal;
use crate::db::now_ms;
use crate::error::{ChatError, ChatResult};
use crate::hub::chat_topic;
use crate::ident::{generate_hex, ID_BYTES};
use crate::models::{
    Conversation, MessageKind, NewMessageFrame, RawFrame, ReactionFrame, ReactionSlot,
    Reactions, RemoveFrame, ReplyPreview, StatusFrame, UpdateFrame,
};
use crate::queue::DeliveryJob;
use crate::rate_limit::ActionType;
use crate::state::AppState;
use crate::validation::{validate_new_message, validate_update};

/// Entry point for one inbound text frame, processed in arrival order.
pub async fn handle_frame(
    text: &str,
    principal: &Principal,
    conversation: &Conversation,
    state: &AppState,
    reply: &broadcast::Sender<Message>,
) {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(user = %principal.hex, %err, "unparseable frame");
            send_error(reply, "invalid", None, "Invalid frame".to_string());
            return;
        }
    };

    let outcome = match raw.kind.as_str() {
        "new" => handle_new(&raw, principal, conversation, state).await,
        "reply" => handle_reply(&raw, principal, conversation, state).await,
        "status" => handle_status(&raw, conversation, state).await,
        "reaction" => handle_reaction(&raw, principal, conversation, state).await,
        "update" => handle_update(&raw, principal, conversation, state).await,
        "remove" => handle_remove(&raw, principal, conversation, state).await,
        "forward" => Err(ChatError::Validation("forward is not implemented".into())),
        other => {
            warn!(kind = other, user = %principal.hex, "unknown frame kind dropped");
            return;
        }
    };

    if let Err(err) = outcome {
        if let ChatError::Backend(detail) = &err {
            error!(%detail, kind = %raw.kind, user = %principal.hex, "dispatch failed");
        }
        let id = raw
            .message
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from);
        send_error(reply, &raw.kind, id, err.public_message());
    }
}

/// Error frames go to the originating socket only, never the topic.
fn send_error(reply: &broadcast::Sender<Message>, kind: &str, id: Option<String>, error: String) {
    let mut message = json!({ "kind": kind, "error": error });
    if let Some(id) = id {
        message["id"] = json!(id);
    }
    let frame = json!({ "kind": "error", "message": message });
    let _ = reply.send(Message::Text(frame.to_string()));
}

fn parse_payload<T: serde::de::DeserializeOwned>(raw: &RawFrame) -> ChatResult<T> {
    serde_json::from_value(raw.message.clone())
        .map_err(|err| ChatError::Validation(format!("Invalid {} payload: {err}", raw.kind)))
}

/// The author on the frame must be the socket principal and the frame
/// must target the conversation this socket is bound to.
fn guard_author(
    frame: &NewMessageFrame,
    principal: &Principal,
    conversation: &Conversation,
) -> ChatResult<()> {
    if frame.user != principal.hex {
        return Err(ChatError::Forbidden("Cannot send as another user".into()));
    }
    if frame.conversation != conversation.hex {
        return Err(ChatError::Validation(
            "conversation does not match this channel".into(),
        ));
    }
    Ok(())
}

/// Publish to same-instance subscribers, then hand the event to the
/// delivery queue for everyone else.
async fn fan_out(
    state: &AppState,
    conversation: &Conversation,
    data: serde_json::Value,
) -> ChatResult<()> {
    state
        .hub
        .publish(&chat_topic(&conversation.hex), Message::Text(data.to_string()))
        .await;
    let job = DeliveryJob::new(conversation.participant_hexes(), &conversation.hex, data);
    state.queue.enqueue(&job).await
}

/// Insert with a fresh id; an id collision regenerates once.
async fn persist(
    state: &AppState,
    frame: NewMessageFrame,
    kind: MessageKind,
    reply_preview: Option<ReplyPreview>,
) -> ChatResult<crate::models::Message> {
    let now = now_ms();
    let mut message = crate::models::Message {
        id: generate_hex(ID_BYTES),
        conversation: frame.conversation,
        kind,
        message_type: frame.message_type,
        parent: frame.parent,
        user: frame.user,
        recipient_content: frame.recipient_content,
        sender_content: frame.sender_content,
        status: frame.status,
        attachments: frame.attachments,
        images: frame.images,
        videos: frame.videos,
        audio: frame.audio,
        reactions: frame.reactions.unwrap_or_default(),
        reply: reply_preview,
        created_at: now,
        updated_at: now,
    };

    match state.db.insert_message(&message).await {
        Ok(persisted) => Ok(persisted),
        Err(ChatError::Conflict(_)) => {
            message.id = generate_hex(ID_BYTES);
            state.db.insert_message(&message).await
        }
        Err(err) => Err(err),
    }
}

async fn handle_new(
    raw: &RawFrame,
    principal: &Principal,
    conversation: &Conversation,
    state: &AppState,
) -> ChatResult<()> {
    let mut frame: NewMessageFrame = parse_payload(raw)?;
    state.limiter.check(&principal.hex, ActionType::Message).await?;
    validate_new_message(&mut frame, false)?;
    guard_author(&frame, principal, conversation)?;

    let persisted = persist(state, frame, MessageKind::Message, None).await?;
    fan_out(state, conversation, json!({ "kind": "new", "message": persisted })).await
}

async fn handle_reply(
    raw: &RawFrame,
    principal: &Principal,
    conversation: &Conversation,
    state: &AppState,
) -> ChatResult<()> {
    let mut frame: NewMessageFrame = parse_payload(raw)?;
    state.limiter.check(&principal.hex, ActionType::Message).await?;
    validate_new_message(&mut frame, true)?;
    guard_author(&frame, principal, conversation)?;

    let parent_id = frame.parent.clone().unwrap_or_default();
    let parent = match state.db.find_message(&parent_id).await {
        Ok(parent) if parent.conversation == conversation.hex => parent,
        Ok(_) | Err(ChatError::NotFound(_)) => {
            return Err(ChatError::NotFound("Parent message not found".into()))
        }
        Err(err) => return Err(err),
    };

    // Swap the parent's envelopes so each side previews the copy that was
    // addressed to it.
    let preview = ReplyPreview {
        recipient_content: parent.sender_content,
        sender_content: parent.recipient_content,
    };

    let persisted = persist(state, frame, MessageKind::Reply, Some(preview)).await?;
    fan_out(state, conversation, json!({ "kind": "reply", "message": persisted })).await
}

/// A socket may only touch messages of the conversation it is bound to.
async fn load_in_conversation(
    state: &AppState,
    id: &str,
    conversation: &Conversation,
) -> ChatResult<crate::models::Message> {
    let message = state.db.find_message(id).await?;
    if message.conversation != conversation.hex {
        return Err(ChatError::NotFound("Message not found".into()));
    }
    Ok(message)
}

async fn handle_status(
    raw: &RawFrame,
    conversation: &Conversation,
    state: &AppState,
) -> ChatResult<()> {
    let frame: StatusFrame = parse_payload(raw)?;
    load_in_conversation(state, &frame.id, conversation).await?;
    let updated = state.db.update_status(&frame.id, frame.status).await?;
    fan_out(
        state,
        conversation,
        json!({
            "kind": "status",
            "message": {
                "_id": updated.id,
                "conversation": updated.conversation,
                "status": updated.status,
            }
        }),
    )
    .await
}

async fn handle_reaction(
    raw: &RawFrame,
    principal: &Principal,
    conversation: &Conversation,
    state: &AppState,
) -> ChatResult<()> {
    let frame: ReactionFrame = parse_payload(raw)?;
    if frame.user != principal.hex {
        return Err(ChatError::Forbidden("Cannot react as another user".into()));
    }
    state.limiter.check(&principal.hex, ActionType::Reaction).await?;

    let message = load_in_conversation(state, &frame.id, conversation).await?;
    // Author reactions land in `from`, the counterpart's in `to`.
    let slot = if frame.user == message.user {
        ReactionSlot::From
    } else {
        ReactionSlot::To
    };
    let updated = state
        .db
        .update_reactions(&frame.id, slot, frame.reaction)
        .await?;

    fan_out(
        state,
        conversation,
        json!({
            "kind": "reaction",
            "message": {
                "_id": updated.id,
                "conversation": updated.conversation,
                "reactions": reactions_json(&updated.reactions),
            }
        }),
    )
    .await
}

fn reactions_json(reactions: &Reactions) -> serde_json::Value {
    serde_json::to_value(reactions).unwrap_or_else(|_| json!({}))
}

async fn handle_update(
    raw: &RawFrame,
    principal: &Principal,
    conversation: &Conversation,
    state: &AppState,
) -> ChatResult<()> {
    let frame: UpdateFrame = parse_payload(raw)?;
    validate_update(&frame)?;
    state.limiter.check(&principal.hex, ActionType::Edit).await?;

    let message = load_in_conversation(state, &frame.id, conversation).await?;
    if message.user != principal.hex {
        return Err(ChatError::Invariant("Unauthorized to update message".into()));
    }

    let updated = state
        .db
        .update_contents(&frame.id, &frame.sender_content, &frame.recipient_content)
        .await?;

    fan_out(
        state,
        conversation,
        json!({
            "kind": "update",
            "message": {
                "_id": updated.id,
                "conversation": updated.conversation,
                "senderContent": updated.sender_content,
                "recipientContent": updated.recipient_content,
            }
        }),
    )
    .await
}

async fn handle_remove(
    raw: &RawFrame,
    principal: &Principal,
    conversation: &Conversation,
    state: &AppState,
) -> ChatResult<()> {
    let frame: RemoveFrame = parse_payload(raw)?;
    if frame.user != principal.hex {
        return Err(ChatError::Forbidden("Cannot delete as another user".into()));
    }

    load_in_conversation(state, &frame.id, conversation).await?;
    let deleted = state.db.delete_message(&frame.id, &frame.user).await?;
    fan_out(
        state,
        conversation,
        json!({
            "kind": "remove",
            "message": {
                "_id": deleted.id,
                "conversation": deleted.conversation,
            }
        }),
    )
    .await
}
