//! Session token registry.
//!
//! Maps a conversation identifier to the opaque session token the external
//! assistant assigned on its first response. The whole table lives in one
//! JSON file that is rewritten in full on every update. Bindings are
//! first-write-wins: once a conversation has a token it is never replaced, and
//! later invocations pass it back with `--resume`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::info;
use tokio::fs;
use tokio::sync::RwLock;

use crate::conversation::StoreResult;

/// Durable conversation -> session token table.
pub struct SessionRegistry {
    path: PathBuf,
    table: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    /// Open the registry at `<data_dir>/sessions.json`, loading any existing
    /// table.
    pub async fn open(data_dir: &Path) -> StoreResult<Self> {
        let path = data_dir.join("sessions.json");
        let table = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    /// Bind a session token to a conversation.
    ///
    /// Returns `true` when the binding was created. Returns `false` without
    /// touching disk when the conversation already has a token.
    pub async fn bind(&self, conversation_id: &str, session_id: &str) -> StoreResult<bool> {
        // The write guard spans insert and persist, so concurrent bindings
        // cannot reach the file in inverted order.
        let mut table = self.table.write().await;
        if table.contains_key(conversation_id) {
            return Ok(false);
        }
        table.insert(conversation_id.to_string(), session_id.to_string());
        self.persist(&table).await?;
        info!("bound session {session_id} to conversation {conversation_id}");
        Ok(true)
    }

    /// Look up the session token for a conversation.
    pub async fn get(&self, conversation_id: &str) -> Option<String> {
        self.table.read().await.get(conversation_id).cloned()
    }

    async fn persist(&self, table: &HashMap<String, String>) -> StoreResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(table)?;
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
