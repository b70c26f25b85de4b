//! Convoy backend library.
//!
//! Bridges a browser chat client to an external command-line AI assistant:
//! prompts arrive over a WebSocket, each prompt runs as one assistant
//! subprocess, and the subprocess's line-delimited JSON output is streamed
//! back while transcripts and session tokens are persisted to disk.

pub mod agent;
pub mod api;
pub mod config;
pub mod conversation;
pub mod repo;
pub mod session;
pub mod ws;
