//! Sliding-window rate limiting per user and action type.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Message,
    Reaction,
    Edit,
}

impl ActionType {
    /// Allowed actions per window.
    fn limit(self) -> usize {
        match self {
            ActionType::Message => 30,
            ActionType::Reaction => 20,
            ActionType::Edit => 10,
        }
    }

    fn window(self) -> Duration {
        Duration::from_secs(60)
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: RwLock<HashMap<(String, ActionType), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action, or refuse it when the window is full.
    pub async fn check(&self, user_hex: &str, action: ActionType) -> ChatResult<()> {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        let window = windows
            .entry((user_hex.to_string(), action))
            .or_default();

        while let Some(&front) = window.front() {
            if now.duration_since(front) > action.window() {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= action.limit() {
            let retry_after = window
                .front()
                .map(|&front| action.window().saturating_sub(now.duration_since(front)))
                .unwrap_or_default();
            return Err(ChatError::Invariant(format!(
                "Rate limit exceeded, retry in {}s",
                retry_after.as_secs().max(1)
            )));
        }

        window.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_limit_then_refuses() {
        let limiter = RateLimiter::new();
        for _ in 0..30 {
            limiter.check("aa11", ActionType::Message).await.unwrap();
        }
        let err = limiter.check("aa11", ActionType::Message).await.unwrap_err();
        assert!(err.to_string().starts_with("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn limits_are_per_user_and_per_action() {
        let limiter = RateLimiter::new();
        for _ in 0..30 {
            limiter.check("aa11", ActionType::Message).await.unwrap();
        }
        // A different user and a different action are unaffected.
        limiter.check("bb22", ActionType::Message).await.unwrap();
        limiter.check("aa11", ActionType::Reaction).await.unwrap();
    }
}
