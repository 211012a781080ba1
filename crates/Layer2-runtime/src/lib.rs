//! # devyard-runtime
//!
//! Live-operation orchestration for devyard containers:
//! - `log`: per-key ring log with cursor replay and live subscription
//! - `operation`: single-flight background runs with phase reporting
//! - `deploy`: compose build/up/down through the guarded runner
//! - `session`: shared interactive shells multiplexed across viewers
//! - `agent`: supervised long-running processes inside containers
//! - `container` / `project`: collaborator interfaces and their CLI/config
//!   backed implementations

pub mod agent;
pub mod container;
pub mod deploy;
pub mod log;
pub mod operation;
pub mod project;
pub mod session;

pub use agent::{AgentRecord, AgentStatus, AgentSupervisor, LineFramer, StartAgentRequest};
pub use container::{CommandOutput, ComposeRunner, ContainerRunner};
pub use deploy::{Deployer, DeploymentStatus};
pub use log::{
    Delta, EntryKind, LogEntry, LogRead, LogReader, RingLog, Snapshot, StreamFrame,
};
pub use operation::{OperationContext, OperationRunner, OperationStatus, Phase, StartOutcome};
pub use project::{ProjectLookup, ProjectTarget, SshTarget, StaticProjects};
pub use session::{
    ClientFrame, ControlAction, PtyShellConnector, ServerFrame, SessionMode,
    SessionMultiplexer, SessionRecord, SessionStatus, ShellConnector, ShellControl, ShellEvent,
    ShellHandle, TermSize, ViewerConnection, ViewerId,
};
