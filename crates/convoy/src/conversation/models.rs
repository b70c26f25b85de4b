//! Conversation data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single transcript entry.
///
/// Messages are append-only: once committed they are never mutated or
/// reordered. Assistant entries hold the raw ordered records emitted by the
/// external process for one invocation, kept opaque so the client can replay
/// them exactly as they streamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    User {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        content: Vec<Value>,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: Vec<Value>) -> Self {
        Self::Assistant {
            content,
            timestamp: Utc::now(),
        }
    }
}

/// A persisted conversation.
///
/// Serialized as one JSON document per conversation, rewritten in full on
/// every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque random identifier (hex, 16 chars).
    pub id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Working directory for assistant invocations, relative to the
    /// project root. Defaults to the root itself.
    pub working_directory: String,
    /// Ordered message log, insertion order = chronological order.
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            working_directory: ".".to_string(),
            messages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tags_serialize_lowercase() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["content"], "hello");

        let msg = Message::assistant(vec![serde_json::json!({"type": "result"})]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "assistant");
        assert_eq!(json["content"][0]["type"], "result");
    }

    #[test]
    fn new_conversation_defaults_to_root() {
        let conv = Conversation::new("abcd".to_string());
        assert_eq!(conv.working_directory, ".");
        assert!(conv.messages.is_empty());
    }
}
