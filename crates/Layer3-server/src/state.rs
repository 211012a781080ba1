//! Shared handler state

use devyard_foundation::{DevyardConfig, Result, SnapshotWriter, AGENTS_FILE, SESSIONS_FILE};
use devyard_runtime::{
    AgentSupervisor, ComposeRunner, ContainerRunner, Deployer, OperationRunner, ProjectLookup,
    PtyShellConnector, RingLog, SessionMultiplexer, ShellConnector, StaticProjects,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub log: RingLog,
    pub deployer: Deployer,
    pub sessions: SessionMultiplexer,
    pub agents: AgentSupervisor,
    pub poll_interval: Duration,
}

/// Collaborators the runtime is wired to
pub struct Collaborators {
    pub containers: Arc<dyn ContainerRunner>,
    pub connector: Arc<dyn ShellConnector>,
    pub projects: Arc<dyn ProjectLookup>,
    pub session_snapshots: SnapshotWriter,
    pub agent_snapshots: SnapshotWriter,
}

impl AppState {
    pub fn new(config: &DevyardConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            containers,
            connector,
            projects,
            session_snapshots,
            agent_snapshots,
        } = collaborators;

        let log = RingLog::with_limits(
            config.limits.max_log_entries,
            config.limits.broadcast_capacity,
        );
        let deployer = Deployer::new(
            OperationRunner::new(log.clone()),
            Arc::clone(&containers),
            Arc::clone(&projects),
        );
        let sessions = SessionMultiplexer::new(
            connector,
            Arc::clone(&containers),
            Arc::clone(&projects),
            log.clone(),
            config.session.clone(),
            session_snapshots,
        );
        let agents = AgentSupervisor::new(
            containers,
            projects,
            log.clone(),
            config.agent.clone(),
            config.limits.max_agent_log_lines,
            agent_snapshots,
        );

        Self {
            log,
            deployer,
            sessions,
            agents,
            poll_interval: config.stream.poll_interval(),
        }
    }

    /// Production wiring: compose CLI, PTY shells, persisted state
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &DevyardConfig) -> Result<Self> {
        let store = config.storage.state_store()?;
        info!(state_dir = %store.base_dir().display(), "Using state directory");

        let state = Self::new(
            config,
            Collaborators {
                containers: Arc::new(ComposeRunner::new(config.runtime)),
                connector: Arc::new(PtyShellConnector::new(
                    config.runtime,
                    config.session.shell.clone(),
                )),
                projects: Arc::new(StaticProjects::from_config(config)),
                session_snapshots: SnapshotWriter::spawn(store.clone(), SESSIONS_FILE),
                agent_snapshots: SnapshotWriter::spawn(store.clone(), AGENTS_FILE),
            },
        );

        state.sessions.restore(&store);
        state.agents.restore(&store);
        Ok(state)
    }

    /// Interrupt in-flight deployments and close live shells
    pub async fn shutdown(&self) {
        self.deployer.runner().shutdown().await;
        self.sessions.shutdown();
    }
}
