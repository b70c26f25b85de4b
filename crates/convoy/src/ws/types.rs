//! WebSocket message types.
//!
//! The protocol between the browser client and the backend. Commands flow
//! client -> server, events flow server -> client; both are internally tagged
//! JSON objects.

use serde::{Deserialize, Serialize};

/// Events sent from backend to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// Connection established.
    Connected,

    /// Heartbeat/keepalive ping.
    Ping,

    /// A new conversation was created.
    ConversationCreated { conversation_id: String },

    /// The connection is now bound to a conversation.
    ConversationJoined { conversation_id: String },

    /// Working directory updated; `created` reports whether the directory
    /// had to be created.
    WorkingDirectorySet {
        conversation_id: String,
        working_directory: String,
        created: bool,
    },

    /// Raw stdout chunk from the assistant process, forwarded verbatim.
    Output { data: String },

    /// A failure, or a stderr chunk from the assistant process.
    Error { message: String },

    /// The assistant process exited. `code` is `None` when it was killed by
    /// a signal.
    Complete { code: Option<i32> },

    /// A project was materialized from a source repository.
    RepositoryCloned {
        repository: String,
        project_name: String,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },

    /// Informational notice (e.g. "stopped by user").
    SystemNotice { message: String },
}

/// Commands sent from client to backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    /// Pong response to ping.
    Pong,

    /// Bind this connection to an existing conversation.
    JoinConversation { conversation_id: String },

    /// Create a fresh conversation and bind to it.
    CreateConversation,

    /// Run the assistant with a prompt in the bound conversation.
    SendPrompt { prompt: String },

    /// Stop the in-flight assistant process, if any.
    StopPrompt,

    /// Set the working directory of a conversation, creating it if needed.
    SetWorkingDirectory {
        conversation_id: String,
        working_directory: String,
    },

    /// Materialize a project from a source repository.
    CloneRepository {
        conversation_id: String,
        repository: String,
        project_name: String,
        #[serde(default)]
        branch: Option<String>,
    },
}
