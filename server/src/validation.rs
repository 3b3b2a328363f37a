//! Structural validation and sanitisation of client input.
//!
//! Constraints fail on the first violation with a message naming the field
//! and the broken rule. Free-form strings are HTML-escaped in place before
//! they reach the repository; encrypted envelopes are opaque and only
//! checked for presence.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{ChatError, ChatResult};
use crate::models::{ContentEnvelope, NewMessageFrame, RegisterKeysRequest, UpdateFrame};

const MAX_HEX_LEN: usize = 64;
const MAX_NAME_LEN: usize = 64;
const MAX_AVATAR_LEN: usize = 512;
const MAX_LINK_LEN: usize = 2048;
const MAX_ATTACHMENTS: usize = 10;
const MAX_MEDIA_REFS: usize = 10;
const MAX_KEY_LEN: usize = 8192;

/// HTML-escape `& < > " '` in place.
pub fn sanitize_in_place(s: &mut String) {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return;
    }
    let mut escaped = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    *s = escaped;
}

fn required(field: &str, value: &str) -> ChatResult<()> {
    if value.trim().is_empty() {
        return Err(ChatError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn max_len(field: &str, value: &str, max: usize) -> ChatResult<()> {
    if value.len() > max {
        return Err(ChatError::Validation(format!(
            "{field} must not exceed {max} characters"
        )));
    }
    Ok(())
}

fn max_items(field: &str, len: usize, max: usize) -> ChatResult<()> {
    if len > max {
        return Err(ChatError::Validation(format!(
            "{field} must not exceed {max} items"
        )));
    }
    Ok(())
}

fn base64_field(field: &str, value: &str, max: usize) -> ChatResult<()> {
    required(field, value)?;
    max_len(field, value, max)?;
    BASE64
        .decode(value)
        .map_err(|_| ChatError::Validation(format!("{field} must be base64")))?;
    Ok(())
}

/// A content envelope must carry a non-empty ciphertext and nonce.
pub fn validate_content(field: &str, content: &ContentEnvelope) -> ChatResult<()> {
    if content.encrypted.is_empty() {
        return Err(ChatError::Validation(format!(
            "{field}.encrypted is required"
        )));
    }
    if content.nonce.is_empty() {
        return Err(ChatError::Validation(format!("{field}.nonce is required")));
    }
    Ok(())
}

/// Identifier fields: non-empty, bounded, plain text.
pub fn validate_hex(field: &str, value: &str) -> ChatResult<()> {
    required(field, value)?;
    max_len(field, value, MAX_HEX_LEN)
}

/// Schema for `new` and (with `require_parent`) `reply` frames. Sanitises
/// free-form strings in place and returns the frame fit for persistence.
pub fn validate_new_message(frame: &mut NewMessageFrame, require_parent: bool) -> ChatResult<()> {
    validate_hex("conversation", &frame.conversation)?;
    validate_hex("user", &frame.user)?;
    validate_content("recipientContent", &frame.recipient_content)?;
    validate_content("senderContent", &frame.sender_content)?;

    if require_parent {
        match frame.parent.as_deref() {
            Some(parent) if !parent.trim().is_empty() => validate_hex("parent", parent)?,
            _ => return Err(ChatError::Validation("parent is required".into())),
        }
    }

    if let Some(attachments) = frame.attachments.as_mut() {
        max_items("attachments", attachments.len(), MAX_ATTACHMENTS)?;
        for attachment in attachments.iter_mut() {
            required("attachments.name", &attachment.name)?;
            max_len("attachments.name", &attachment.name, MAX_NAME_LEN)?;
            max_len("attachments.link", &attachment.link, MAX_LINK_LEN)?;
            sanitize_in_place(&mut attachment.name);
            sanitize_in_place(&mut attachment.kind);
            sanitize_in_place(&mut attachment.link);
        }
    }
    for (field, refs) in [("images", &mut frame.images), ("videos", &mut frame.videos)] {
        if let Some(refs) = refs.as_mut() {
            max_items(field, refs.len(), MAX_MEDIA_REFS)?;
            for item in refs.iter_mut() {
                max_len(field, item, MAX_LINK_LEN)?;
                sanitize_in_place(item);
            }
        }
    }
    if let Some(audio) = frame.audio.as_mut() {
        max_len("audio", audio, MAX_LINK_LEN)?;
        sanitize_in_place(audio);
    }

    Ok(())
}

/// Schema for `update` frames: the two envelopes only.
pub fn validate_update(frame: &UpdateFrame) -> ChatResult<()> {
    validate_hex("id", &frame.id)?;
    validate_content("senderContent", &frame.sender_content)?;
    validate_content("recipientContent", &frame.recipient_content)
}

/// Key envelope submitted on registration and key rotation.
pub fn validate_key_envelope(req: &RegisterKeysRequest) -> ChatResult<()> {
    base64_field("publicKey", &req.public_key, MAX_KEY_LEN)?;
    base64_field(
        "encryptedPrivateKey",
        &req.encrypted_private_key,
        MAX_KEY_LEN,
    )?;
    base64_field("privateKeyNonce", &req.private_key_nonce, MAX_KEY_LEN)?;
    base64_field("passcodeSalt", &req.passcode_salt, MAX_KEY_LEN)
}

/// Display name and avatar updates.
pub fn validate_name(name: &mut String) -> ChatResult<()> {
    required("name", name)?;
    max_len("name", name, MAX_NAME_LEN)?;
    sanitize_in_place(name);
    Ok(())
}

pub fn validate_avatar(avatar: &mut String) -> ChatResult<()> {
    max_len("avatar", avatar, MAX_AVATAR_LEN)?;
    sanitize_in_place(avatar);
    Ok(())
}
