//! Config - devyard settings
//!
//! Loaded from the global file (`~/.config/devyard/config.json`) deep-merged
//! with the project file (`./.devyard/config.json`), or from an explicit path.
//! Every field has a default, so an absent file yields a working config.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name
pub const DEVYARD_CONFIG_FILE: &str = "config.json";

/// Container runtime CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevyardConfig {
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub runtime: ContainerRuntime,
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    /// Ring log bound per resource key
    pub max_log_entries: usize,
    /// Per-agent output ring bound
    pub max_agent_log_lines: usize,
    /// Live subscriber channel capacity per key
    pub broadcast_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_log_entries: 2000,
            max_agent_log_lines: 5000,
            broadcast_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub connect_attempts: u32,
    pub connect_delay_ms: u64,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Shell started inside the container
    pub shell: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_delay_ms: 2000,
            default_cols: 120,
            default_rows: 32,
            shell: "bash".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Seconds between TERM and KILL when stopping an agent
    pub stop_grace_secs: u64,
    /// In-container directory holding per-agent PID files
    pub pid_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: 3,
            pid_dir: "/tmp/devyard/agents".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// State directory; `None` means `~/.config/devyard/state`
    pub state_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn state_store(&self) -> Result<JsonStore> {
        match &self.state_dir {
            Some(dir) => Ok(JsonStore::new(dir)),
            None => Ok(JsonStore::new(JsonStore::global()?.base_dir().join("state"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7700".to_string(),
        }
    }
}

/// Per-project container identity and connection parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl DevyardConfig {
    /// Global file merged with the current project's file (project wins)
    pub fn load() -> Result<Self> {
        let mut merged = serde_json::Value::Object(Default::default());

        if let Ok(global) = JsonStore::global() {
            if let Some(value) = global.load_optional::<serde_json::Value>(DEVYARD_CONFIG_FILE)? {
                merge_values(&mut merged, value);
            }
        }

        if let Ok(project) = JsonStore::current_project() {
            if let Some(value) = project.load_optional::<serde_json::Value>(DEVYARD_CONFIG_FILE)? {
                merge_values(&mut merged, value);
            }
        }

        serde_json::from_value(merged).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a single explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

/// Recursive object merge; non-object values in `other` replace `base`
fn merge_values(base: &mut serde_json::Value, other: serde_json::Value) {
    match (base, other) {
        (serde_json::Value::Object(base), serde_json::Value::Object(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}
