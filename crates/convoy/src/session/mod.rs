//! Assistant session bindings - resumption tokens per conversation.

mod registry;

pub use registry::SessionRegistry;
