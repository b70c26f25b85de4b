//! HTTP API layer.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
