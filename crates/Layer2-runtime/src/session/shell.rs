//! Remote shell connector interface

use crate::project::ProjectTarget;
use async_trait::async_trait;
use devyard_foundation::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 120, rows: 32 }
    }
}

/// Output of a backing shell; the channel closes after `Exit` or `Error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Data(Vec<u8>),
    Exit(Option<i32>),
    Error(String),
}

/// Control side of a live shell
pub trait ShellControl: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, size: TermSize) -> Result<()>;

    /// Terminate the backing process; must be safe to call twice
    fn close(&self);
}

pub struct ShellHandle {
    pub events: mpsc::Receiver<ShellEvent>,
    pub control: Arc<dyn ShellControl>,
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Open an interactive shell for `target`
    ///
    /// Errors are `Error::Connection` and may be retried.
    async fn connect(&self, target: &ProjectTarget, size: TermSize) -> Result<ShellHandle>;
}
