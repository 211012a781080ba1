//! Storage module for devyard
//!
//! - `json`: directory-scoped JSON files (config, state snapshots)
//! - `snapshot`: fire-and-forget background snapshot writer

mod json;
mod snapshot;

pub use json::JsonStore;
pub use snapshot::SnapshotWriter;

/// Session registry snapshot file
pub const SESSIONS_FILE: &str = "sessions.json";

/// Agent table snapshot file
pub const AGENTS_FILE: &str = "agents.json";
