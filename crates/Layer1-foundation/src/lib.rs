//! # devyard-foundation
//!
//! Foundation layer for devyard:
//! - Error: the shared error taxonomy and `Result` alias
//! - Config: `DevyardConfig` (limits, session, agent, stream, storage, projects)
//! - Storage: `JsonStore` and the fire-and-forget `SnapshotWriter`

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    AgentConfig, ContainerRuntime, DevyardConfig, LimitsConfig, ProjectConfig, ServerConfig,
    SessionConfig, SshConfig, StorageConfig, StreamConfig, DEVYARD_CONFIG_FILE,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{JsonStore, SnapshotWriter, AGENTS_FILE, SESSIONS_FILE};
