//! Process orchestrator.
//!
//! Maps a conversation to one external assistant process per prompt: resolves
//! the working directory (materializing projects through the repository cache
//! when the prompt names one), launches the assistant with resume and
//! system-prompt arguments, streams its output to the transport while
//! buffering parsed records, and commits the exchange to the transcript on
//! exit. Also owns the per-connection active process table and the
//! cancellation path.

mod records;
mod runner;

pub use records::{kind, session_id, LineDecoder, RecordKind};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::{AssistantConfig, ResolvedPaths};
use crate::conversation::{ConversationStore, StoreError};
use crate::repo::{CacheError, RepoCache};
use crate::session::SessionRegistry;
use crate::ws::WsEvent;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The connection has not joined a conversation.
    #[error("no conversation joined for this connection")]
    NoConversationBound,

    /// The bound conversation does not exist in the store.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// The connection already has a running assistant process.
    #[error("a prompt is already in flight for this connection")]
    PromptInFlight,

    /// A working directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreateFailed {
        path: String,
        source: std::io::Error,
    },

    /// Project materialization failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Transcript persistence failed.
    #[error("transcript store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::ConversationNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Orchestrator settings, derived from the application config.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Assistant executable.
    pub binary: String,
    /// Capability allow-list passed with `--allowedTools`.
    pub allowed_tools: Vec<String>,
    /// Optional `--append-system-prompt` text.
    pub append_system_prompt: Option<String>,
    /// Grace window between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// Root against which relative working directories resolve.
    pub project_root: PathBuf,
    /// Root for materialized project clones.
    pub projects_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(assistant: &AssistantConfig, paths: &ResolvedPaths) -> Self {
        Self {
            binary: assistant.binary.clone(),
            allowed_tools: assistant.allowed_tools.clone(),
            append_system_prompt: assistant.append_system_prompt.clone(),
            stop_grace: Duration::from_millis(assistant.stop_grace_ms),
            project_root: paths.project_root.clone(),
            projects_dir: paths.projects_dir.clone(),
        }
    }
}

/// A running assistant process bound to a connection.
pub(crate) struct ActiveProcess {
    /// Requests graceful termination of the exchange task.
    pub(crate) stop_tx: mpsc::Sender<()>,
    /// Identity of the exchange owning this entry. The exit path only clears
    /// the entry when it still belongs to its own exchange.
    pub(crate) exchange: u64,
}

/// The conversation/session orchestrator.
///
/// All registries are owned tables injected at construction so tests can run
/// isolated instances.
pub struct Orchestrator {
    config: OrchestratorConfig,
    conversations: Arc<ConversationStore>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<RepoCache>,
    /// Connection id -> in-flight process. At most one per connection.
    pub(crate) active: DashMap<String, ActiveProcess>,
    exchange_counter: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        conversations: Arc<ConversationStore>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<RepoCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            conversations,
            sessions,
            cache,
            active: DashMap::new(),
            exchange_counter: AtomicU64::new(0),
        })
    }

    /// Create and persist a fresh conversation, returning its identifier.
    pub async fn create_conversation(&self) -> Result<String, OrchestratorError> {
        let conversation = self.conversations.create().await?;
        Ok(conversation.id)
    }

    /// Whether a conversation exists. A store failure other than a missing
    /// file is an error, not a negative answer.
    pub async fn conversation_exists(
        &self,
        conversation_id: &str,
    ) -> Result<bool, OrchestratorError> {
        match self.conversations.get(conversation_id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(OrchestratorError::Store(e)),
        }
    }

    /// Set a conversation's working directory, creating the directory if
    /// absent. Returns whether it was created.
    pub async fn set_working_directory(
        &self,
        conversation_id: &str,
        path: &str,
    ) -> Result<bool, OrchestratorError> {
        // Fail on an unknown conversation before touching the filesystem.
        self.conversations.get(conversation_id).await?;

        let dir = self.config.project_root.join(path);
        let created = !dir.exists();
        if created {
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| OrchestratorError::DirectoryCreateFailed {
                    path: dir.display().to_string(),
                    source,
                })?;
        }
        self.conversations
            .set_working_directory(conversation_id, path)
            .await?;
        Ok(created)
    }

    /// Materialize a project from a source repository into the projects root
    /// and report the resolved path.
    pub async fn clone_repository(
        &self,
        repository: &str,
        project_name: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, OrchestratorError> {
        let destination = self.config.projects_dir.join(project_name);
        self.cache
            .resolve_project(repository, &destination, branch)
            .await?;
        Ok(destination)
    }

    /// Run the assistant for one prompt.
    ///
    /// Streams output to `events` concurrently; this method returns as soon
    /// as the process is launched. A spawn failure is reported as an `error`
    /// event, not an `Err` - the user message is already durable by then.
    pub async fn send_prompt(
        self: &Arc<Self>,
        connection_id: &str,
        conversation_id: Option<&str>,
        prompt: &str,
        events: mpsc::Sender<WsEvent>,
    ) -> Result<(), OrchestratorError> {
        let conversation_id = conversation_id
            .ok_or(OrchestratorError::NoConversationBound)?
            .to_string();

        // At most one process per connection; a concurrent prompt is refused
        // rather than queued or allowed to orphan the running exchange.
        if self.active.contains_key(connection_id) {
            return Err(OrchestratorError::PromptInFlight);
        }

        let conversation = self.conversations.get(&conversation_id).await?;

        // Resolve the working directory. A `<path>/claude <rest>` prefix
        // designates a target directory and strips down to the actual prompt.
        let (work_dir, downstream_prompt) = match split_prompt(prompt) {
            Some((prefix, rest)) => {
                let dir = self.config.project_root.join(prefix);
                if !dir.exists() {
                    self.materialize_prefix_dir(prefix, &dir, &events).await?;
                }
                (dir, rest.to_string())
            }
            None => {
                let dir = self
                    .config
                    .project_root
                    .join(&conversation.working_directory);
                if !dir.exists() {
                    fs::create_dir_all(&dir).await.map_err(|source| {
                        OrchestratorError::DirectoryCreateFailed {
                            path: dir.display().to_string(),
                            source,
                        }
                    })?;
                }
                (dir, prompt.to_string())
            }
        };

        // The user message is durable before the process starts, so a crash
        // mid-exchange never loses the prompt that caused it. The original
        // text keeps any path prefix.
        self.conversations
            .append_user(&conversation_id, prompt)
            .await?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--print")
            .args(["--output-format", "stream-json"])
            .arg("--verbose")
            .args(["--allowedTools", &self.config.allowed_tools.join(",")]);
        if let Some(token) = self.sessions.get(&conversation_id).await {
            cmd.args(["--resume", &token]);
        }
        if let Some(ref extra) = self.config.append_system_prompt {
            cmd.args(["--append-system-prompt", extra]);
        }
        cmd.current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            "launching {} for conversation {} in {}",
            self.config.binary,
            conversation_id,
            work_dir.display()
        );
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to start {}: {e}", self.config.binary);
                let _ = events
                    .send(WsEvent::Error {
                        message: format!("failed to start {}: {e}", self.config.binary),
                    })
                    .await;
                return Ok(());
            }
        };

        // Single-shot input: write the actual prompt, then close stdin.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(downstream_prompt.as_bytes()).await {
                warn!("failed to write prompt to assistant stdin: {e}");
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let exchange = self.exchange_counter.fetch_add(1, Ordering::Relaxed);
        self.active
            .insert(connection_id.to_string(), ActiveProcess { stop_tx, exchange });

        let orchestrator = Arc::clone(self);
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            runner::run_exchange(
                orchestrator,
                connection_id,
                conversation_id,
                exchange,
                child,
                stop_rx,
                events,
            )
            .await;
        });
        Ok(())
    }

    /// Request termination of the connection's in-flight process.
    ///
    /// Graceful first; the exchange task force-kills after the grace window.
    /// A no-op when nothing is running.
    pub async fn stop_prompt(&self, connection_id: &str, events: &mpsc::Sender<WsEvent>) {
        let stop_tx = self
            .active
            .get(connection_id)
            .map(|entry| entry.stop_tx.clone());
        match stop_tx {
            Some(tx) => {
                // try_send: a second stop while one is pending is a no-op.
                let _ = tx.try_send(());
                let _ = events
                    .send(WsEvent::SystemNotice {
                        message: "assistant process stopped by user".to_string(),
                    })
                    .await;
            }
            None => {
                info!("stop requested for {connection_id} with no active process");
            }
        }
    }

    /// Drop the active process entry for a lost connection. The process
    /// itself keeps running so the exchange still commits on exit.
    pub fn disconnect(&self, connection_id: &str) {
        self.active.remove(connection_id);
    }

    /// Create a prefix-designated directory, going through the repository
    /// cache when the final path component names a known source repository.
    async fn materialize_prefix_dir(
        &self,
        prefix: &str,
        dir: &Path,
        events: &mpsc::Sender<WsEvent>,
    ) -> Result<(), OrchestratorError> {
        let name = Path::new(prefix)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| prefix.to_string());
        if self.cache.has_repository(&name) {
            self.cache.resolve_project(&name, dir, None).await?;
            let _ = events
                .send(WsEvent::RepositoryCloned {
                    repository: name.clone(),
                    project_name: name,
                    path: dir.display().to_string(),
                    branch: None,
                })
                .await;
        } else {
            fs::create_dir_all(dir).await.map_err(|source| {
                OrchestratorError::DirectoryCreateFailed {
                    path: dir.display().to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    pub(crate) fn stop_grace(&self) -> Duration {
        self.config.stop_grace
    }

    pub(crate) fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub(crate) fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

/// Split a `<relativePath>/claude <rest>` prompt into its target directory
/// and the actual prompt sent downstream.
///
/// The prefix must be a single word; anything else leaves the prompt intact.
fn split_prompt(prompt: &str) -> Option<(&str, &str)> {
    let (prefix, rest) = prompt.split_once("/claude ")?;
    if prefix.is_empty() || prefix.contains(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    Some((prefix, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prefix_is_split_off() {
        let (prefix, rest) = split_prompt("./proj/claude fix the bug").unwrap();
        assert_eq!(prefix, "./proj");
        assert_eq!(rest, "fix the bug");

        let (prefix, rest) = split_prompt("projects/demo1/claude run the tests").unwrap();
        assert_eq!(prefix, "projects/demo1");
        assert_eq!(rest, "run the tests");
    }

    #[test]
    fn plain_prompts_are_left_intact() {
        assert!(split_prompt("fix the bug").is_none());
        assert!(split_prompt("ask claude about it").is_none());
        // A prefix containing whitespace is not a path designation.
        assert!(split_prompt("my dir/claude hello").is_none());
        // No prompt body after the marker.
        assert!(split_prompt("./proj/claude ").is_none());
    }
}
