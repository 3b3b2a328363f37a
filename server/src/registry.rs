//! In-process connection registry.
//!
//! Maps a user hex to the set of sockets that user currently holds on this
//! instance (the notifications socket plus any chat sockets). The
//! synchronisation primitive stays behind this interface; the hub and the
//! delivery worker only ever see `add`/`remove`/`get`/`snapshot`.

use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

/// One live socket: the id disambiguates multiple sockets per user, the
/// sender feeds that socket's outbound task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub sender: broadcast::Sender<Message>,
}

impl ConnectionHandle {
    /// Push a payload to this socket. Returns false when the socket's
    /// outbound task is gone.
    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<String, Vec<ConnectionHandle>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn add(&self, user_hex: &str, handle: ConnectionHandle) {
        self.inner
            .write()
            .await
            .entry(user_hex.to_string())
            .or_default()
            .push(handle);
    }

    pub async fn remove(&self, user_hex: &str, id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(handles) = inner.get_mut(user_hex) {
            handles.retain(|h| h.id != id);
            if handles.is_empty() {
                inner.remove(user_hex);
            }
        }
    }

    pub async fn get(&self, user_hex: &str) -> Vec<ConnectionHandle> {
        self.inner
            .read()
            .await
            .get(user_hex)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, user_hex: &str) -> bool {
        self.inner.read().await.contains_key(user_hex)
    }

    /// Connection count per user, for diagnostics.
    pub async fn snapshot(&self) -> HashMap<String, usize> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(user, handles)| (user.clone(), handles.len()))
            .collect()
    }
}
