//! Application state shared across handlers.

use std::sync::Arc;

use crate::agent::Orchestrator;
use crate::conversation::ConversationStore;
use crate::repo::RepoCache;

/// State injected into every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<ConversationStore>,
    pub repos: Arc<RepoCache>,
    pub orchestrator: Arc<Orchestrator>,
}
