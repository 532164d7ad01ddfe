//! Core data types shared across the knowledge cache, history store,
//! and inference engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single cached reference entry (e.g. one first-aid topic).
///
/// `id` is a stable topic slug and unique within the store. `content` is a
/// denormalized human-readable text block ready to drop into a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub content: String,
    /// Producer-assigned version, normalized to a string at the parse boundary.
    pub version: String,
    pub updated_at: i64,
}

/// Message author within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One turn in a conversation. Append-only, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// A conversation thread.
///
/// `title` stays `None` until the first user message arrives, is derived
/// once from it, and is immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            title: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
