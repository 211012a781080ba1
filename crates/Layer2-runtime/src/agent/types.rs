//! Agent records and start requests

use chrono::{DateTime, Utc};
use devyard_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Known providers and the binary each one runs
const PROVIDERS: &[(&str, &str)] = &[("codex", "codex"), ("claude", "claude")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Stopped | AgentStatus::Exited | AgentStatus::Failed
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Exited => "exited",
            AgentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Public, persisted state of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub resource_key: String,
    pub provider: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// In-container PID file written by the bootstrap shell
    pub pid_file: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// OS pid of the host-side process; set only while it is alive
    #[serde(default)]
    pub host_pid: Option<u32>,
}

/// Request to start an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartAgentRequest {
    pub provider: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
}

impl StartAgentRequest {
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Concrete command: explicit command wins, else the provider's binary
    pub fn resolve_command(&self) -> Result<String> {
        if let Some(command) = self.command.as_deref().map(str::trim) {
            if !command.is_empty() {
                return Ok(command.to_string());
            }
        }

        let provider = self.provider.trim();
        PROVIDERS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(provider))
            .map(|(_, binary)| binary.to_string())
            .ok_or_else(|| {
                if provider.is_empty() {
                    Error::Validation("provider or command is required".to_string())
                } else {
                    Error::Validation(format!(
                        "provider {:?} requires an explicit command",
                        provider
                    ))
                }
            })
    }
}
