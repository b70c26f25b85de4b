//! Conversation transcripts - durable, append-only message logs.

mod models;
mod store;

pub use models::{Conversation, Message};
pub use store::{ConversationStore, StoreError, StoreResult};
