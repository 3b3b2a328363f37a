//! # Sotto relay server
//!
//! End-to-end-encrypted conversational messaging backend. The server
//! authenticates socket connections from a signed cookie token, binds
//! them to conversation channels, validates and persists opaque message
//! payloads, fans events out to same-instance subscribers, and hands
//! cross-instance delivery to a durable job queue. Message content is
//! never decrypted here.

pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod ident;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod state;
pub mod validation;
