//! Data models for the Sotto relay server.
//!
//! Wire names follow the client protocol (camelCase, message ids exposed
//! as `_id`). Enum values are stored in the database under their lowercase
//! wire spelling.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

// ── Enums ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Admin,
    Moderator,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Inactive,
    Suspended,
    Blocked,
}

/// Trust axis of a conversation. Born `request`, moves once to `trusted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustKind {
    Request,
    Trusted,
}

/// Orthogonal scope axis. Only `user` (1-to-1) conversations are created
/// through the public surface today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationScope {
    User,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Reply,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    All,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Ordering rank: status only ever advances along this chain.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Like,
    Love,
    Laugh,
    Wow,
    Sad,
    Angry,
}

/// Reaction slot on a message: `from` belongs to the author, `to` to the
/// counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionSlot {
    From,
    To,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "active" => Ok(UserStatus::Active),
            "inactive" => Ok(UserStatus::Inactive),
            "suspended" => Ok(UserStatus::Suspended),
            other => Err(ChatError::Backend(format!("unknown user status: {other}"))),
        }
    }
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Admin => "admin",
            ParticipantRole::Moderator => "moderator",
            ParticipantRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "admin" => Ok(ParticipantRole::Admin),
            "moderator" => Ok(ParticipantRole::Moderator),
            "member" => Ok(ParticipantRole::Member),
            other => Err(ChatError::Backend(format!("unknown role: {other}"))),
        }
    }
}

impl ParticipantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Inactive => "inactive",
            ParticipantStatus::Suspended => "suspended",
            ParticipantStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "active" => Ok(ParticipantStatus::Active),
            "inactive" => Ok(ParticipantStatus::Inactive),
            "suspended" => Ok(ParticipantStatus::Suspended),
            "blocked" => Ok(ParticipantStatus::Blocked),
            other => Err(ChatError::Backend(format!(
                "unknown participant status: {other}"
            ))),
        }
    }
}

impl TrustKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustKind::Request => "request",
            TrustKind::Trusted => "trusted",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "request" => Ok(TrustKind::Request),
            "trusted" => Ok(TrustKind::Trusted),
            other => Err(ChatError::Backend(format!("unknown trust kind: {other}"))),
        }
    }
}

impl ConversationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationScope::User => "user",
            ConversationScope::Group => "group",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "user" => Ok(ConversationScope::User),
            "group" => Ok(ConversationScope::Group),
            other => Err(ChatError::Backend(format!("unknown scope: {other}"))),
        }
    }
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::Reply => "reply",
            MessageKind::Forward => "forward",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "message" => Ok(MessageKind::Message),
            "reply" => Ok(MessageKind::Reply),
            "forward" => Ok(MessageKind::Forward),
            other => Err(ChatError::Backend(format!("unknown message kind: {other}"))),
        }
    }
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::All => "all",
            MessageType::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "all" => Ok(MessageType::All),
            "audio" => Ok(MessageType::Audio),
            other => Err(ChatError::Backend(format!("unknown message type: {other}"))),
        }
    }
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(ChatError::Backend(format!("unknown status: {other}"))),
        }
    }
}

impl Reaction {
    pub fn as_str(self) -> &'static str {
        match self {
            Reaction::Like => "like",
            Reaction::Love => "love",
            Reaction::Laugh => "laugh",
            Reaction::Wow => "wow",
            Reaction::Sad => "sad",
            Reaction::Angry => "angry",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "like" => Ok(Reaction::Like),
            "love" => Ok(Reaction::Love),
            "laugh" => Ok(Reaction::Laugh),
            "wow" => Ok(Reaction::Wow),
            "sad" => Ok(Reaction::Sad),
            "angry" => Ok(Reaction::Angry),
            other => Err(ChatError::Backend(format!("unknown reaction: {other}"))),
        }
    }
}

// ── Records ──

/// Opaque encrypted payload. The server never decrypts; it only checks
/// both fields are present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEnvelope {
    pub encrypted: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub link: String,
}

/// Two-slot reaction record: `from` is the message author's reaction,
/// `to` the counterpart's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reactions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Reaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Reaction>,
}

/// Parent preview stored on a reply. The envelopes are swapped relative
/// to the parent so each side sees the copy addressed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub recipient_content: ContentEnvelope,
    pub sender_content: ContentEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub hex: String,
    pub name: String,
    pub avatar: String,
    pub verified: bool,
    pub status: UserStatus,
    pub public_key: String,
    pub encrypted_private_key: String,
    pub private_key_nonce: String,
    pub passcode_salt: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub hex: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub online: bool,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub hex: String,
    pub participants: Vec<Participant>,
    pub kind: TrustKind,
    #[serde(skip, default = "default_scope")]
    pub scope: ConversationScope,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Message>,
    pub unread: i64,
    pub total: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_scope() -> ConversationScope {
    ConversationScope::User
}

impl Conversation {
    pub fn is_participant(&self, hex: &str) -> bool {
        self.participants.iter().any(|p| p.hex == hex)
    }

    pub fn participant_hexes(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.hex.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    pub conversation: String,
    pub kind: MessageKind,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub user: String,
    pub recipient_content: ContentEnvelope,
    pub sender_content: ContentEnvelope,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub videos: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    pub reactions: Reactions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyPreview>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConversationCounts {
    pub total: i64,
    pub unread: i64,
    pub requested: i64,
}

// ── Inbound socket frames ──

/// First parse stage of an inbound frame. The dispatcher matches on
/// `kind` and deserializes `message` into the matching payload record.
#[derive(Debug, Deserialize)]
pub struct RawFrame {
    pub kind: String,
    #[serde(default)]
    pub message: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageFrame {
    pub conversation: String,
    pub kind: MessageKind,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub user: String,
    pub recipient_content: ContentEnvelope,
    pub sender_content: ContentEnvelope,
    pub status: MessageStatus,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub videos: Option<Vec<String>>,
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub reactions: Option<Reactions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusFrame {
    pub id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionFrame {
    pub id: String,
    pub reaction: Option<Reaction>,
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFrame {
    pub id: String,
    pub sender_content: ContentEnvelope,
    pub recipient_content: ContentEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveFrame {
    pub id: String,
    pub user: String,
}

// ── HTTP bodies ──

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterKeysRequest {
    pub public_key: String,
    pub encrypted_private_key: String,
    pub private_key_nonce: String,
    pub passcode_salt: String,
}

#[derive(Debug, Deserialize)]
pub struct EditNameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct EditAvatarRequest {
    pub avatar: String,
}

#[derive(Debug, Deserialize)]
pub struct EditStatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Deserialize)]
pub struct EditVerificationRequest {
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantSpec {
    pub hex: String,
    #[serde(default)]
    pub role: Option<ParticipantRole>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub participants: Vec<ParticipantSpec>,
    #[serde(default)]
    pub kind: Option<ConversationScope>,
}

#[derive(Debug, Deserialize)]
pub struct OneConversationRequest {
    pub other: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_serializes_with_wire_names() {
        let msg = Message {
            id: "a1b2".into(),
            conversation: "c3d4".into(),
            kind: MessageKind::Message,
            message_type: MessageType::All,
            parent: None,
            user: "u5e6".into(),
            recipient_content: ContentEnvelope {
                encrypted: "E1".into(),
                nonce: "N1".into(),
            },
            sender_content: ContentEnvelope {
                encrypted: "E2".into(),
                nonce: "N2".into(),
            },
            status: MessageStatus::Sent,
            attachments: None,
            images: None,
            videos: None,
            audio: None,
            reactions: Reactions::default(),
            reply: None,
            created_at: 1,
            updated_at: 1,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["_id"], "a1b2");
        assert_eq!(value["type"], "all");
        assert_eq!(value["recipientContent"]["encrypted"], "E1");
        assert_eq!(value["status"], "sent");
        assert!(value.get("parent").is_none());
        assert!(value.get("reply").is_none());
    }

    #[test]
    fn status_rank_is_monotonic() {
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
    }

    #[test]
    fn frame_payloads_deserialize_from_wire_json() {
        let frame: NewMessageFrame = serde_json::from_value(json!({
            "conversation": "c3d4",
            "kind": "message",
            "type": "all",
            "user": "u5e6",
            "recipientContent": {"encrypted": "E1", "nonce": "N1"},
            "senderContent": {"encrypted": "E2", "nonce": "N2"},
            "status": "sent"
        }))
        .unwrap();
        assert_eq!(frame.kind, MessageKind::Message);
        assert!(frame.parent.is_none());

        let frame: ReactionFrame = serde_json::from_value(json!({
            "id": "a1b2", "reaction": "love", "user": "u5e6"
        }))
        .unwrap();
        assert_eq!(frame.reaction, Some(Reaction::Love));

        let frame: ReactionFrame = serde_json::from_value(json!({
            "id": "a1b2", "reaction": null, "user": "u5e6"
        }))
        .unwrap();
        assert!(frame.reaction.is_none());
    }

    #[test]
    fn enum_wire_spellings_round_trip() {
        for status in [
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()).unwrap(), status);
        }
        for reaction in [
            Reaction::Like,
            Reaction::Love,
            Reaction::Laugh,
            Reaction::Wow,
            Reaction::Sad,
            Reaction::Angry,
        ] {
            assert_eq!(Reaction::parse(reaction.as_str()).unwrap(), reaction);
        }
        assert!(TrustKind::parse("untrusted").is_err());
    }
}
