//! WebSocket transport - one logical client per conversation.

mod handler;
mod types;

pub use handler::ws_handler;
pub use types::{WsCommand, WsEvent};
