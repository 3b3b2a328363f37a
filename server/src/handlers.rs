//! HTTP handlers and router for the `/api/v1` surface.
//!
//! Every response carries `{"success": bool, ...}`; failures map through
//! [`ChatError`] to the status table. All endpoints require the access
//! token cookie except user registration.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{self, Principal};
use crate::db::{ConversationFilter, UserField};
use crate::error::{ChatError, ChatResult};
use crate::ident::{generate_hex, ID_BYTES};
use crate::models::{
    CreateConversationRequest, EditAvatarRequest, EditNameRequest, EditStatusRequest,
    EditVerificationRequest, OneConversationRequest, PageQuery, ParticipantRole,
    RegisterKeysRequest,
};
use crate::session::{chat_handler, events_handler};
use crate::state::SharedState;
use crate::validation;

type ApiResponse = ChatResult<(StatusCode, Json<Value>)>;

fn authenticate(headers: &HeaderMap, state: &SharedState) -> ChatResult<Principal> {
    auth::authenticate(
        headers.get(header::COOKIE).and_then(|v| v.to_str().ok()),
        &state.config.jwt_secret,
    )
}

fn ok(body: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(body))
}

// ── Health ──

pub async fn health_handler(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    ok(json!({
        "success": true,
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.uptime(),
    }))
}

// ── User endpoints ──

/// `PUT /api/v1/user/add` — the only unauthenticated endpoint.
pub async fn register_user_handler(
    State(state): State<SharedState>,
    Json(body): Json<RegisterKeysRequest>,
) -> ApiResponse {
    validation::validate_key_envelope(&body)?;

    let user = match state.db.create_user(&generate_hex(ID_BYTES), &body).await {
        Ok(user) => user,
        // An id collision regenerates once; a second conflict surfaces.
        Err(ChatError::Conflict(_)) => state.db.create_user(&generate_hex(ID_BYTES), &body).await?,
        Err(err) => return Err(err),
    };

    info!(user = %user.hex, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "user": user })),
    ))
}

pub async fn retrieve_user_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    let user = state.db.find_user(&principal.hex).await?;
    Ok(ok(json!({ "success": true, "user": user })))
}

pub async fn edit_keys_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<RegisterKeysRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    validation::validate_key_envelope(&body)?;
    state.db.update_user_keys(&principal.hex, &body).await?;
    Ok(ok(json!({ "success": true })))
}

pub async fn edit_name_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(mut body): Json<EditNameRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    validation::validate_name(&mut body.name)?;
    state
        .db
        .update_user_field(&principal.hex, UserField::Name(body.name))
        .await?;
    Ok(ok(json!({ "success": true })))
}

pub async fn edit_avatar_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(mut body): Json<EditAvatarRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    validation::validate_avatar(&mut body.avatar)?;
    state
        .db
        .update_user_field(&principal.hex, UserField::Avatar(body.avatar))
        .await?;
    Ok(ok(json!({ "success": true })))
}

pub async fn edit_status_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<EditStatusRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    state
        .db
        .update_user_field(&principal.hex, UserField::Status(body.status))
        .await?;
    Ok(ok(json!({ "success": true })))
}

pub async fn edit_verification_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<EditVerificationRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    state
        .db
        .update_user_field(&principal.hex, UserField::Verified(body.verified))
        .await?;
    Ok(ok(json!({ "success": true })))
}

pub async fn remove_user_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    state.db.delete_user(&principal.hex).await?;
    info!(user = %principal.hex, "user removed");
    Ok(ok(json!({ "success": true })))
}

// ── Conversation endpoints ──

pub async fn create_conversation_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;

    if body.participants.len() != 2 {
        return Err(ChatError::Validation(
            "participants must name exactly 2 users".into(),
        ));
    }
    for spec in &body.participants {
        validation::validate_hex("participants.hex", &spec.hex)?;
    }
    let hexes: Vec<String> = body.participants.iter().map(|p| p.hex.clone()).collect();
    if hexes[0] == hexes[1] {
        return Err(ChatError::Validation(
            "participants must be distinct users".into(),
        ));
    }
    if !hexes.contains(&principal.hex) {
        return Err(ChatError::Forbidden(
            "Conversation must include the caller".into(),
        ));
    }

    let other = hexes.iter().find(|h| **h != principal.hex).cloned().unwrap_or_default();
    if !state.db.user_exists(&other).await? {
        return Err(ChatError::NotFound("User not found".into()));
    }

    // The duplicate-pair case answers 400, not 409.
    if state.db.conversation_exists(&hexes).await? {
        return Err(ChatError::Validation("Conversation already exists".into()));
    }

    let participants: Vec<(String, ParticipantRole)> = body
        .participants
        .iter()
        .map(|p| (p.hex.clone(), p.role.unwrap_or(ParticipantRole::Member)))
        .collect();
    let scope = body.kind.unwrap_or(crate::models::ConversationScope::User);

    let conversation = match state
        .db
        .create_conversation(&generate_hex(ID_BYTES), &participants, scope, &principal.hex)
        .await
    {
        Ok(conversation) => conversation,
        Err(ChatError::Conflict(_)) => {
            if state.db.conversation_exists(&hexes).await? {
                return Err(ChatError::Validation("Conversation already exists".into()));
            }
            state
                .db
                .create_conversation(&generate_hex(ID_BYTES), &participants, scope, &principal.hex)
                .await?
        }
        Err(err) => return Err(err),
    };

    info!(conversation = %conversation.hex, from = %principal.hex, "conversation created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "conversation": conversation })),
    ))
}

pub async fn one_conversation_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<OneConversationRequest>,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    validation::validate_hex("other", &body.other)?;
    let conversation = state
        .db
        .find_conversation_by_pair(&[principal.hex.clone(), body.other])
        .await?;
    Ok(ok(json!({ "success": true, "conversation": conversation })))
}

pub async fn list_conversations_handler(
    State(state): State<SharedState>,
    Path(filter): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    let filter = ConversationFilter::parse(&filter)
        .ok_or_else(|| ChatError::NotFound("Unknown listing".into()))?;
    let page = query.page.unwrap_or(1).max(1);

    let conversations = state
        .db
        .list_conversations(&principal.hex, filter, page, state.config.per_page)
        .await?;
    Ok(ok(json!({
        "success": true,
        "conversations": conversations,
        "page": page,
    })))
}

pub async fn conversation_stats_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;
    let counts = state.db.counts(&principal.hex).await?;
    Ok(ok(json!({
        "success": true,
        "total": counts.total,
        "unread": counts.unread,
        "requested": counts.requested,
    })))
}

pub async fn conversation_transition_handler(
    State(state): State<SharedState>,
    Path((hex, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;

    let conversation = state.db.find_conversation(&hex).await?;
    if !conversation.is_participant(&principal.hex) {
        return Err(ChatError::Forbidden(
            "Not a participant of this conversation".into(),
        ));
    }

    match action.as_str() {
        "pin" => {
            state
                .db
                .pin(&hex, &principal.hex, state.config.max_pins)
                .await?;
            Ok(ok(json!({ "success": true })))
        }
        "unpin" => {
            state.db.unpin(&hex, &principal.hex).await?;
            Ok(ok(json!({ "success": true })))
        }
        "accept" => {
            let conversation = state.db.accept(&hex, &principal.hex).await?;
            Ok(ok(json!({ "success": true, "conversation": conversation })))
        }
        "delete" => {
            state.db.mark_deleted(&hex, &principal.hex).await?;
            Ok(ok(json!({ "success": true })))
        }
        _ => Err(ChatError::NotFound("Unknown action".into())),
    }
}

pub async fn message_page_handler(
    State(state): State<SharedState>,
    Path(hex): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> ApiResponse {
    let principal = authenticate(&headers, &state)?;

    let conversation = state.db.find_conversation(&hex).await?;
    if !conversation.is_participant(&principal.hex) {
        return Err(ChatError::Forbidden(
            "Not a participant of this conversation".into(),
        ));
    }

    let page = query.page.unwrap_or(1).max(1);
    let messages = state
        .db
        .page_messages(&hex, &principal.hex, page, state.config.history_page)
        .await?;
    // Fetching history counts as catching up.
    state.db.reset_unread(&hex).await?;

    Ok(ok(json!({
        "success": true,
        "messages": messages,
        "page": page,
    })))
}

// ── Router ──

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/user/add", put(register_user_handler))
        .route("/api/v1/user/retrieve", get(retrieve_user_handler))
        .route("/api/v1/user/edit/keys", patch(edit_keys_handler))
        .route("/api/v1/user/edit/status", patch(edit_status_handler))
        .route("/api/v1/user/edit/avatar", patch(edit_avatar_handler))
        .route("/api/v1/user/edit/verification", patch(edit_verification_handler))
        .route("/api/v1/user/edit/name", patch(edit_name_handler))
        .route("/api/v1/user/remove", delete(remove_user_handler))
        .route("/api/v1/conversation/add", put(create_conversation_handler))
        .route("/api/v1/conversation/one", post(one_conversation_handler))
        .route("/api/v1/conversation/:hex/messages", get(message_page_handler))
        .route(
            "/api/v1/conversation/:hex/:action",
            patch(conversation_transition_handler),
        )
        .route("/api/v1/conversations/stats", get(conversation_stats_handler))
        .route("/api/v1/conversations/:filter", get(list_conversations_handler))
        .route("/events", get(events_handler))
        .route("/chat/:hex", get(chat_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                ),
        )
}
