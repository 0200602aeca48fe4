//! The core models for a persisted chat session.
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::openai::{RequestMessage, Role};

/// Placeholder title a session carries until one is generated.
pub const NEW_CHAT_TITLE: &str = "New Chat";

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static LAST_MESSAGE_ID: AtomicI64 = AtomicI64::new(0);

/// Returns a message id derived from the wall clock in milliseconds.
/// Ids are strictly increasing within the process even when several
/// are minted in the same millisecond.
pub fn next_message_id() -> String {
    let now = now_millis();
    let mut last = LAST_MESSAGE_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_MESSAGE_ID.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate.to_string(),
            Err(actual) => last = actual,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            id: next_message_id(),
            role,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(id: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            role: Role::Assistant,
            content: content.to_string(),
        }
    }

    pub fn to_request(&self) -> RequestMessage {
        RequestMessage::new(self.role, &self.content)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ChatMetadata {
    pub id: String,
    pub title: String,
    /// Last activity, epoch milliseconds
    pub date: i64,
}

impl ChatMetadata {
    pub fn has_placeholder_title(&self) -> bool {
        self.title == NEW_CHAT_TITLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_strictly_increasing() {
        let ids: Vec<i64> = (0..1000)
            .map(|_| next_message_id().parse().unwrap())
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0], "{} <= {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::assistant("42", "Hello");
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"id":"42","role":"assistant","content":"Hello"}"#
        );
    }

    #[test]
    fn test_message_to_request_drops_id() {
        let msg = Message::user("Hi");
        assert_eq!(
            serde_json::to_string(&msg.to_request()).unwrap(),
            r#"{"role":"user","content":"Hi"}"#
        );
    }

    #[test]
    fn test_metadata_deserialization() {
        let meta: ChatMetadata =
            serde_json::from_str(r#"{"id":"1","title":"New Chat","date":1700000000000}"#)
                .unwrap();
        assert!(meta.has_placeholder_title());
        assert_eq!(meta.date, 1_700_000_000_000);
    }
}
