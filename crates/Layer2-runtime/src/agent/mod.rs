//! Agent Supervisor - long-running commands inside project containers
//!
//! State machine: `starting → running → {stopping → stopped} | exited | failed`.
//! A host process handle exists only in the non-terminal states.
//!
//! Each agent owns three tasks: one reader per output stream feeding a
//! [`LineFramer`], and a waiter that observes the host process exit, drains
//! the readers (flushing partial lines), then decides the final status.

mod framing;
mod script;
mod types;

pub use framing::LineFramer;
pub use types::{AgentRecord, AgentStatus, StartAgentRequest};

use crate::container::ContainerRunner;
use crate::log::{EntryKind, RingLog};
use crate::project::ProjectLookup;
use chrono::Utc;
use devyard_foundation::{AgentConfig, Error, JsonStore, Result, SnapshotWriter, AGENTS_FILE};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the waiter lets readers drain after the host process exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    fn as_str(&self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

struct HostProcess {
    kill_tx: Option<oneshot::Sender<()>>,
}

struct AgentState {
    record: AgentRecord,
    lines: VecDeque<String>,
    host: Option<HostProcess>,
}

struct Inner {
    agents: Mutex<HashMap<String, AgentState>>,
    containers: Arc<dyn ContainerRunner>,
    projects: Arc<dyn ProjectLookup>,
    log: RingLog,
    config: AgentConfig,
    max_lines: usize,
    snapshots: SnapshotWriter,
}

#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<Inner>,
}

impl AgentSupervisor {
    pub fn new(
        containers: Arc<dyn ContainerRunner>,
        projects: Arc<dyn ProjectLookup>,
        log: RingLog,
        config: AgentConfig,
        max_lines: usize,
        snapshots: SnapshotWriter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agents: Mutex::new(HashMap::new()),
                containers,
                projects,
                log,
                config,
                max_lines: max_lines.max(1),
                snapshots,
            }),
        }
    }

    /// Rehydrate agents persisted by a previous run
    ///
    /// Nothing spawned by another process is assumed alive: every
    /// non-terminal record comes back as `exited` without a host handle.
    pub fn restore(&self, store: &JsonStore) {
        let records: Vec<AgentRecord> = match store.load_optional(AGENTS_FILE) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to load agent snapshot");
                return;
            }
        };

        let mut agents = self.inner.agents.lock();
        for mut record in records {
            if !record.status.is_terminal() {
                debug!(agent_id = %record.id, status = %record.status, "Rehydrating agent as exited");
                record.status = AgentStatus::Exited;
                record.stopped_at = record.stopped_at.or_else(|| Some(Utc::now()));
            }
            record.host_pid = None;
            agents.insert(
                record.id.clone(),
                AgentState {
                    record,
                    lines: VecDeque::new(),
                    host: None,
                },
            );
        }
        info!(count = agents.len(), "Restored agent records");
        self.inner.persist(&agents);
    }

    /// Launch an agent inside the container of `resource_key`
    pub fn start(&self, resource_key: &str, request: StartAgentRequest) -> Result<AgentRecord> {
        let command = request.resolve_command()?;
        let target = self.inner.projects.resolve(resource_key)?;

        let id = format!("agent-{}", Uuid::new_v4().simple());
        let pid_file = script::pid_file(&self.inner.config.pid_dir, &id);
        let working_dir = request.working_dir.as_deref().or(target.workdir.as_deref());
        let bootstrap = script::bootstrap(&pid_file, &command, &request.args, &request.env, working_dir)?;

        let provider = if request.provider.trim().is_empty() {
            "custom".to_string()
        } else {
            request.provider.trim().to_lowercase()
        };

        let mut child = self.inner.containers.spawn_exec(&target, &bootstrap)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();

        let record = AgentRecord {
            id: id.clone(),
            resource_key: resource_key.to_string(),
            provider,
            command,
            args: request.args,
            pid_file,
            status: AgentStatus::Running,
            started_at: Utc::now(),
            stopped_at: None,
            exit_code: None,
            signal: None,
            host_pid: child.id(),
        };

        {
            let mut agents = self.inner.agents.lock();
            agents.insert(
                id.clone(),
                AgentState {
                    record: record.clone(),
                    lines: VecDeque::new(),
                    host: Some(HostProcess {
                        kill_tx: Some(kill_tx),
                    }),
                },
            );
            self.inner.publish_status(&record);
            self.inner.persist(&agents);
        }

        info!(agent_id = %id, key = %resource_key, command = %record.command, "Agent started");

        let readers: Vec<JoinHandle<()>> = [
            stdout.map(|s| self.inner.spawn_reader(&id, StreamName::Stdout, s)),
            stderr.map(|s| self.inner.spawn_reader(&id, StreamName::Stderr, s)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    debug!(agent_id = %id, "Killing host process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            for mut reader in readers {
                if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                    warn!(agent_id = %id, "Output reader did not drain, abandoning it");
                    reader.abort();
                }
            }

            inner.on_exit(&id, status);
        });

        Ok(record)
    }

    /// Stop an agent; terminal agents are returned unchanged
    pub fn stop(&self, agent_id: &str) -> Result<AgentRecord> {
        let (record, kill_tx) = {
            let mut agents = self.inner.agents.lock();
            let state = agents
                .get_mut(agent_id)
                .ok_or_else(|| Error::not_found("agent", agent_id))?;

            if state.record.status.is_terminal() || state.record.status == AgentStatus::Stopping {
                return Ok(state.record.clone());
            }

            state.record.status = AgentStatus::Stopping;
            let kill_tx = state.host.as_mut().and_then(|h| h.kill_tx.take());
            let record = state.record.clone();
            self.inner.publish_status(&record);
            self.inner.persist(&agents);
            (record, kill_tx)
        };

        info!(agent_id = %agent_id, "Stopping agent");

        let inner = Arc::clone(&self.inner);
        let pid_file = record.pid_file.clone();
        let resource_key = record.resource_key.clone();
        let id = agent_id.to_string();
        tokio::spawn(async move {
            inner.kill_in_container(&id, &resource_key, &pid_file).await;
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
        });

        Ok(record)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentRecord> {
        self.inner
            .agents
            .lock()
            .get(agent_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| Error::not_found("agent", agent_id))
    }

    /// Agents, optionally limited to one resource key, oldest first
    pub fn list(&self, resource_key: Option<&str>) -> Vec<AgentRecord> {
        let agents = self.inner.agents.lock();
        let mut records: Vec<AgentRecord> = agents
            .values()
            .filter(|s| resource_key.map_or(true, |k| s.record.resource_key == k))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Most recent `lines` buffered output lines
    pub fn logs(&self, agent_id: &str, lines: usize) -> Result<Vec<String>> {
        let agents = self.inner.agents.lock();
        let state = agents
            .get(agent_id)
            .ok_or_else(|| Error::not_found("agent", agent_id))?;
        let skip = state.lines.len().saturating_sub(lines);
        Ok(state.lines.iter().skip(skip).cloned().collect())
    }
}

impl Inner {
    fn persist(&self, agents: &HashMap<String, AgentState>) {
        let mut records: Vec<&AgentRecord> = agents.values().map(|s| &s.record).collect();
        records.sort_by_key(|r| r.started_at);
        self.snapshots.submit(&records);
    }

    fn publish_status(&self, record: &AgentRecord) {
        self.log.push(
            &record.resource_key,
            EntryKind::AgentStatus,
            serde_json::json!({
                "agentId": record.id,
                "status": record.status,
                "exitCode": record.exit_code,
                "signal": record.signal,
            }),
        );
    }

    fn on_line(&self, agent_id: &str, stream: StreamName, line: String) {
        let mut agents = self.agents.lock();
        let Some(state) = agents.get_mut(agent_id) else {
            return;
        };

        self.log.push(
            &state.record.resource_key,
            EntryKind::AgentOutput,
            serde_json::json!({
                "agentId": agent_id,
                "stream": stream.as_str(),
                "line": line,
            }),
        );

        state.lines.push_back(line);
        while state.lines.len() > self.max_lines {
            state.lines.pop_front();
        }
    }

    fn spawn_reader<R>(self: &Arc<Self>, agent_id: &str, stream: StreamName, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(self);
        let id = agent_id.to_string();
        tokio::spawn(async move {
            let mut framer = LineFramer::new();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            inner.on_line(&id, stream, line);
                        }
                    }
                    Err(e) => {
                        warn!(agent_id = %id, stream = stream.as_str(), error = %e, "Agent output read failed");
                        inner.log_error(&id, &format!("{} read failed: {}", stream.as_str(), e));
                        break;
                    }
                }
            }
            if let Some(rest) = framer.finish() {
                inner.on_line(&id, stream, rest);
            }
        })
    }

    fn log_error(&self, agent_id: &str, message: &str) {
        let key = match self.agents.lock().get(agent_id) {
            Some(state) => state.record.resource_key.clone(),
            None => return,
        };
        self.log.push(
            &key,
            EntryKind::Error,
            serde_json::json!({ "agentId": agent_id, "message": message }),
        );
    }

    /// Decide the final status from the status recorded right now
    fn on_exit(&self, agent_id: &str, status: std::io::Result<std::process::ExitStatus>) {
        let (exit_code, signal) = match &status {
            Ok(status) => (status.code(), exit_signal(status)),
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Failed to wait for agent process");
                (None, None)
            }
        };

        let mut agents = self.agents.lock();
        let Some(state) = agents.get_mut(agent_id) else {
            return;
        };

        let final_status = match state.record.status {
            AgentStatus::Stopping | AgentStatus::Stopped => AgentStatus::Stopped,
            _ if exit_code == Some(0) => AgentStatus::Exited,
            _ => AgentStatus::Failed,
        };

        state.record.status = final_status;
        state.record.exit_code = exit_code;
        state.record.signal = signal;
        state.record.stopped_at = Some(Utc::now());
        state.record.host_pid = None;
        state.host = None;

        info!(
            agent_id = %agent_id,
            status = %final_status,
            exit_code = ?exit_code,
            signal = ?signal,
            "Agent ended"
        );

        let record = state.record.clone();
        self.publish_status(&record);
        self.persist(&agents);
    }

    async fn kill_in_container(&self, agent_id: &str, resource_key: &str, pid_file: &str) {
        let target = match self.projects.resolve(resource_key) {
            Ok(target) => target,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Cannot resolve container for kill script");
                return;
            }
        };
        let kill = match script::kill(pid_file, self.config.stop_grace_secs) {
            Ok(kill) => kill,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Cannot build kill script");
                return;
            }
        };

        match self.containers.exec(&target, &kill).await {
            Ok(output) if output.success() => debug!(agent_id = %agent_id, "Kill script finished"),
            Ok(output) => {
                warn!(agent_id = %agent_id, exit_code = output.exit_code, "Kill script failed");
                self.log_error(agent_id, &format!("kill script exited with {}", output.exit_code));
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Kill script could not run");
                self.log_error(agent_id, &e.to_string());
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
