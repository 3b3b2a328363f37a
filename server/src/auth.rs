//! Cookie token verification.
//!
//! Connections and HTTP requests authenticate with a signed token carried
//! in the `x-access-token` cookie. Verification failures of any shape come
//! back as `Unauthenticated`; nothing panics across this boundary.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ChatError, ChatResult};
use crate::models::UserStatus;

/// Name of the cookie carrying the access token.
pub const TOKEN_COOKIE: &str = "x-access-token";

/// Claims embedded in an access token by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub hex: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default = "default_status")]
    pub status: UserStatus,
    #[serde(default)]
    pub public_key: String,
    pub iat: i64,
    pub exp: i64,
}

fn default_status() -> UserStatus {
    UserStatus::Active
}

/// Pull a named cookie value out of a raw `Cookie` header.
fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// Authenticate a request from its `Cookie` header.
pub fn authenticate(cookie_header: Option<&str>, secret: &str) -> ChatResult<Principal> {
    let token = cookie_header
        .and_then(|h| cookie_value(h, TOKEN_COOKIE))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ChatError::Unauthenticated("Missing access token".into()))?;

    let validation = Validation::new(Algorithm::HS256);
    decode::<Principal>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ChatError::Unauthenticated("Invalid or expired access token".into()))
}

/// Sign a token for the given identity. The server itself never issues
/// tokens in production; this exists for tests and local tooling.
pub fn issue(
    hex: &str,
    name: &str,
    public_key: &str,
    secret: &str,
    ttl_secs: i64,
) -> ChatResult<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ChatError::Backend(format!("clock: {e}")))?
        .as_secs() as i64;

    let claims = Principal {
        hex: hex.to_string(),
        name: name.to_string(),
        avatar: String::new(),
        verified: false,
        status: UserStatus::Active,
        public_key: public_key.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ChatError::Backend(format!("token signing: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    fn cookie_for(hex: &str) -> String {
        let token = issue(hex, "Test", "pk", SECRET, 3600).unwrap();
        format!("{TOKEN_COOKIE}={token}")
    }

    #[test]
    fn accepts_a_valid_cookie() {
        let header = cookie_for("a1b2c3");
        let principal = authenticate(Some(&header), SECRET).unwrap();
        assert_eq!(principal.hex, "a1b2c3");
        assert_eq!(principal.status, UserStatus::Active);
    }

    #[test]
    fn finds_the_token_among_other_cookies() {
        let header = format!("theme=dark; {}; lang=en", cookie_for("a1b2c3"));
        assert!(authenticate(Some(&header), SECRET).is_ok());
    }

    #[test]
    fn rejects_missing_header_and_missing_cookie() {
        assert!(matches!(
            authenticate(None, SECRET),
            Err(ChatError::Unauthenticated(_))
        ));
        assert!(matches!(
            authenticate(Some("theme=dark"), SECRET),
            Err(ChatError::Unauthenticated(_))
        ));
    }

    #[test]
    fn rejects_a_token_signed_with_another_secret() {
        let token = issue("a1b2c3", "Test", "pk", "other-secret", 3600).unwrap();
        let header = format!("{TOKEN_COOKIE}={token}");
        assert!(matches!(
            authenticate(Some(&header), SECRET),
            Err(ChatError::Unauthenticated(_))
        ));
    }

    #[test]
    fn rejects_an_expired_token() {
        let token = issue("a1b2c3", "Test", "pk", SECRET, -7200).unwrap();
        let header = format!("{TOKEN_COOKIE}={token}");
        assert!(matches!(
            authenticate(Some(&header), SECRET),
            Err(ChatError::Unauthenticated(_))
        ));
    }

    #[test]
    fn rejects_garbage_tokens() {
        let header = format!("{TOKEN_COOKIE}=not.a.token");
        assert!(matches!(
            authenticate(Some(&header), SECRET),
            Err(ChatError::Unauthenticated(_))
        ));
    }
}
