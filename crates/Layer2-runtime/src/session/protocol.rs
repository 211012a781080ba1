//! Terminal session wire frames

use serde::{Deserialize, Serialize};

/// How a session's setup prepares the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Attach a shell to the already-running container
    #[default]
    Default,
    /// Tear down and rebuild the container before opening the shell
    Recreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Close,
}

/// Viewer → server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Control { action: ControlAction },
}

/// Server → viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Output { data: String },
    Info { data: String },
    Error { data: String },
}

impl ServerFrame {
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn info(data: impl Into<String>) -> Self {
        Self::Info { data: data.into() }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::Error { data: data.into() }
    }
}
