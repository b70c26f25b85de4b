//! Flat-file conversation store.
//!
//! One JSON file per conversation under `<data>/conversations/`, rewritten in
//! full on every mutation. An in-memory cache fronts the files; the disk copy
//! is the source of truth across restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

use super::models::{Conversation, Message};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during transcript persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No conversation with the given identifier.
    #[error("conversation not found: {0}")]
    NotFound(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed conversation file.
    #[error("invalid conversation file: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Durable mapping from conversation identifier to transcript.
pub struct ConversationStore {
    dir: PathBuf,
    cache: DashMap<String, Conversation>,
    /// Per-conversation write locks. Each lock spans apply and persist, so
    /// snapshots reach the file in mutation order.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationStore {
    /// Open a store rooted at `<data_dir>/conversations`, creating the
    /// directory if needed.
    pub async fn open(data_dir: &Path) -> StoreResult<Self> {
        let dir = data_dir.join("conversations");
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            cache: DashMap::new(),
            write_locks: DashMap::new(),
        })
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Generate a fresh unguessable conversation identifier.
    fn generate_id() -> String {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Create, persist, and return a new empty conversation.
    pub async fn create(&self) -> StoreResult<Conversation> {
        let conversation = Conversation::new(Self::generate_id());
        self.persist(&conversation).await?;
        self.cache
            .insert(conversation.id.clone(), conversation.clone());
        info!("created conversation {}", conversation.id);
        Ok(conversation)
    }

    /// Look up a conversation, falling back to disk on a cache miss.
    pub async fn get(&self, id: &str) -> StoreResult<Conversation> {
        if let Some(conv) = self.cache.get(id) {
            return Ok(conv.clone());
        }
        let conversation = self.load(id).await?;
        self.cache.insert(id.to_string(), conversation.clone());
        Ok(conversation)
    }

    /// Load a conversation directly from its file, bypassing the cache.
    pub async fn load(&self, id: &str) -> StoreResult<Conversation> {
        let path = self.file_path(id);
        let bytes = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Append a user message with the literal prompt text and persist.
    pub async fn append_user(&self, id: &str, content: &str) -> StoreResult<()> {
        self.mutate(id, |conv| conv.messages.push(Message::user(content)))
            .await
    }

    /// Append one assistant message holding the full ordered record sequence
    /// of an exchange and persist.
    pub async fn append_assistant(&self, id: &str, records: Vec<Value>) -> StoreResult<()> {
        self.mutate(id, |conv| conv.messages.push(Message::assistant(records)))
            .await
    }

    /// Update the working directory and persist.
    pub async fn set_working_directory(&self, id: &str, path: &str) -> StoreResult<()> {
        self.mutate(id, |conv| conv.working_directory = path.to_string())
            .await
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Conversation),
    {
        let lock = Arc::clone(self.write_locks.entry(id.to_string()).or_default().value());
        let _guard = lock.lock().await;

        // Make sure the conversation is cached before taking the mutable
        // entry, so a cold lookup does not hold the shard lock across IO.
        self.get(id).await?;
        let snapshot = {
            let mut entry = self
                .cache
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            apply(&mut entry);
            entry.clone()
        };
        self.persist(&snapshot).await
    }

    /// Rewrite the conversation file in full, atomically via a temp file.
    async fn persist(&self, conversation: &Conversation) -> StoreResult<()> {
        let path = self.file_path(&conversation.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(conversation)?;
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(
            "persisted conversation {} ({} messages)",
            conversation.id,
            conversation.messages.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, ConversationStore) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_then_reload_round_trips_working_directory() {
        let (_dir, store) = store().await;
        let conv = store.create().await.unwrap();
        assert_eq!(conv.id.len(), 16);

        store
            .set_working_directory(&conv.id, "./projects/demo1")
            .await
            .unwrap();

        let reloaded = store.load(&conv.id).await.unwrap();
        assert_eq!(reloaded.working_directory, "./projects/demo1");
    }

    #[tokio::test]
    async fn messages_append_in_order() {
        let (_dir, store) = store().await;
        let conv = store.create().await.unwrap();

        store.append_user(&conv.id, "first").await.unwrap();
        store
            .append_assistant(&conv.id, vec![serde_json::json!({"type": "result"})])
            .await
            .unwrap();
        store.append_user(&conv.id, "second").await.unwrap();

        let loaded = store.load(&conv.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 3);
        assert!(matches!(&loaded.messages[0], Message::User { content, .. } if content == "first"));
        assert!(matches!(&loaded.messages[1], Message::Assistant { .. }));
        assert!(
            matches!(&loaded.messages[2], Message::User { content, .. } if content == "second")
        );
    }

    #[tokio::test]
    async fn interleaved_mutations_all_reach_disk() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConversationStore::open(dir.path()).await.unwrap());
        let conv = store.create().await.unwrap();

        let appender = {
            let store = Arc::clone(&store);
            let id = conv.id.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    store.append_user(&id, &format!("msg-{i}")).await.unwrap();
                }
            })
        };
        let committer = {
            let store = Arc::clone(&store);
            let id = conv.id.clone();
            tokio::spawn(async move {
                store
                    .set_working_directory(&id, "./projects/demo1")
                    .await
                    .unwrap();
                for i in 0..10 {
                    store
                        .append_assistant(&id, vec![serde_json::json!({"n": i})])
                        .await
                        .unwrap();
                }
            })
        };
        appender.await.unwrap();
        committer.await.unwrap();

        // Neither writer's snapshot may clobber the other's on disk.
        let loaded = store.load(&conv.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 20);
        assert_eq!(loaded.working_directory, "./projects/demo1");
    }

    #[tokio::test]
    async fn replaying_a_file_twice_yields_identical_conversations() {
        let (_dir, store) = store().await;
        let conv = store.create().await.unwrap();
        store.append_user(&conv.id, "hello").await.unwrap();
        store
            .append_assistant(&conv.id, vec![serde_json::json!({"type": "assistant"})])
            .await
            .unwrap();

        let first = store.load(&conv.id).await.unwrap();
        let second = store.load(&conv.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.get("deadbeefdeadbeef").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
