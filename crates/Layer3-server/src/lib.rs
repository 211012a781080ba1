//! # devyard-server
//!
//! HTTP surface over the devyard runtime:
//! - `routes`: deployment control, SSE log streams, agents, terminal sockets
//! - `state`: collaborator wiring shared by every handler
//! - `error`: runtime error → HTTP status mapping

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use state::{AppState, Collaborators};
