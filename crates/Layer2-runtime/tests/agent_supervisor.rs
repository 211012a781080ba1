//! Agent supervisor integration tests against local `sh` processes
//!
//! `cargo test -p devyard-runtime --test agent_supervisor`

use async_trait::async_trait;
use devyard_foundation::{AgentConfig, JsonStore, Result, SnapshotWriter, AGENTS_FILE};
use devyard_runtime::{
    AgentRecord, AgentStatus, AgentSupervisor, CommandOutput, ContainerRunner, EntryKind,
    ProjectTarget, RingLog, StartAgentRequest, StaticProjects,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};

/// Runs container scripts with the host `sh`, with a fake `codex` on PATH
struct LocalRunner {
    bin_dir: PathBuf,
}

impl LocalRunner {
    fn new(dir: &TempDir) -> Self {
        let bin_dir = dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let codex = bin_dir.join("codex");
        std::fs::write(&codex, "#!/bin/sh\nexec sleep 30 >/dev/null 2>&1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&codex, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        Self { bin_dir }
    }

    fn command(&self, script: &str) -> Command {
        let path = format!(
            "{}:{}",
            self.bin_dir.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).env("PATH", path);
        cmd
    }

    fn output(call: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("{}\n", call),
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl ContainerRunner for LocalRunner {
    async fn build(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Self::output("build")
    }
    async fn up(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Self::output("up")
    }
    async fn down(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Self::output("down")
    }
    async fn ps(&self, _: &ProjectTarget) -> Result<CommandOutput> {
        Self::output("ps")
    }
    async fn logs(&self, _: &ProjectTarget, _: usize) -> Result<CommandOutput> {
        Self::output("logs")
    }

    async fn exec(&self, _: &ProjectTarget, script: &str) -> Result<CommandOutput> {
        Ok(self.command(script).output().await?.into())
    }

    fn spawn_exec(&self, _: &ProjectTarget, script: &str) -> Result<Child> {
        Ok(self
            .command(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?)
    }
}

struct Harness {
    _dir: TempDir,
    log: RingLog,
    supervisor: AgentSupervisor,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let log = RingLog::new();
    let config = AgentConfig {
        stop_grace_secs: 0,
        pid_dir: dir.path().join("pids").display().to_string(),
    };
    let projects = StaticProjects::new().with(ProjectTarget::new("web", "web-dev"));
    let supervisor = AgentSupervisor::new(
        Arc::new(LocalRunner::new(&dir)),
        Arc::new(projects),
        log.clone(),
        config,
        100,
        SnapshotWriter::disabled(AGENTS_FILE),
    );
    Harness {
        _dir: dir,
        log,
        supervisor,
    }
}

async fn wait_terminal(supervisor: &AgentSupervisor, id: &str) -> AgentRecord {
    for _ in 0..500 {
        let record = supervisor.get(id).expect("agent exists");
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent {} never reached a terminal status", id);
}

#[tokio::test]
async fn test_codex_stop_ends_stopped() {
    let h = harness();

    let record = h
        .supervisor
        .start("web", StartAgentRequest::provider("codex"))
        .expect("start failed");
    assert_eq!(record.command, "codex");
    assert_eq!(record.status, AgentStatus::Running);
    assert!(record.host_pid.is_some());

    // Let the bootstrap write its PID file
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopping = h.supervisor.stop(&record.id).expect("stop failed");
    assert_eq!(stopping.status, AgentStatus::Stopping);

    let done = wait_terminal(&h.supervisor, &record.id).await;
    assert_eq!(done.status, AgentStatus::Stopped);
    assert!(done.host_pid.is_none());
    assert!(done.stopped_at.is_some());

    // Stopping again is a no-op
    let again = h.supervisor.stop(&record.id).expect("second stop failed");
    assert_eq!(again, done);
}

#[tokio::test]
async fn test_output_framing_and_exit() {
    let h = harness();

    let request = StartAgentRequest::provider("custom")
        .with_command("printf 'foo'; sleep 0.2; printf 'bar\\nbaz'");
    let record = h.supervisor.start("web", request).expect("start failed");

    let done = wait_terminal(&h.supervisor, &record.id).await;
    assert_eq!(done.status, AgentStatus::Exited);
    assert_eq!(done.exit_code, Some(0));

    let lines = h.supervisor.logs(&record.id, 10).unwrap();
    assert_eq!(lines, vec!["foobar", "baz"]);

    let outputs: Vec<_> = h
        .log
        .snapshot("web")
        .entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::AgentOutput)
        .map(|e| e.payload["line"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(outputs, vec!["foobar", "baz"]);
}

#[tokio::test]
async fn test_failed_exit_and_env() {
    let h = harness();

    let request = StartAgentRequest::provider("custom")
        .with_command("echo \"$GREETING\"; exit 3")
        .with_env("GREETING", "hello there");
    let record = h.supervisor.start("web", request).expect("start failed");

    let done = wait_terminal(&h.supervisor, &record.id).await;
    assert_eq!(done.status, AgentStatus::Failed);
    assert_eq!(done.exit_code, Some(3));
    assert_eq!(h.supervisor.logs(&record.id, 1).unwrap(), vec!["hello there"]);
}

#[tokio::test]
async fn test_validation_before_launch() {
    let h = harness();

    let err = h
        .supervisor
        .start("web", StartAgentRequest::provider("aider"))
        .unwrap_err();
    assert!(err.is_user_facing());

    let err = h
        .supervisor
        .start("nope", StartAgentRequest::provider("codex"))
        .unwrap_err();
    assert!(matches!(err, devyard_foundation::Error::NotFound(_)));

    assert!(h.supervisor.list(None).is_empty());
}

#[tokio::test]
async fn test_rehydrated_agents_are_exited() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::new(dir.path());

    let persisted = serde_json::json!([{
        "id": "agent-old",
        "resourceKey": "web",
        "provider": "codex",
        "command": "codex",
        "pidFile": "/tmp/devyard/agents/agent-old.pid",
        "status": "running",
        "startedAt": "2026-01-01T00:00:00Z",
        "hostPid": 4242
    }, {
        "id": "agent-done",
        "resourceKey": "api",
        "provider": "claude",
        "command": "claude",
        "pidFile": "/tmp/devyard/agents/agent-done.pid",
        "status": "failed",
        "startedAt": "2026-01-01T00:00:00Z",
        "exitCode": 1
    }]);
    store.save(AGENTS_FILE, &persisted).unwrap();

    let h = harness();
    h.supervisor.restore(&store);

    let old = h.supervisor.get("agent-old").unwrap();
    assert_eq!(old.status, AgentStatus::Exited);
    assert!(old.host_pid.is_none());

    let done = h.supervisor.get("agent-done").unwrap();
    assert_eq!(done.status, AgentStatus::Failed);
    assert_eq!(done.exit_code, Some(1));

    // Restored agents are inert
    assert_eq!(h.supervisor.stop("agent-old").unwrap().status, AgentStatus::Exited);
    assert_eq!(h.supervisor.list(Some("api")).len(), 1);
}

#[tokio::test]
async fn test_snapshot_written_after_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::new(dir.path().join("state"));
    let projects = StaticProjects::new().with(ProjectTarget::new("web", "web-dev"));
    let supervisor = AgentSupervisor::new(
        Arc::new(LocalRunner::new(&dir)),
        Arc::new(projects),
        RingLog::new(),
        AgentConfig {
            stop_grace_secs: 0,
            pid_dir: dir.path().join("pids").display().to_string(),
        },
        100,
        SnapshotWriter::spawn(store.clone(), AGENTS_FILE),
    );

    let record = supervisor
        .start("web", StartAgentRequest::provider("custom").with_command("true"))
        .unwrap();
    wait_terminal(&supervisor, &record.id).await;

    let mut saved: Vec<AgentRecord> = Vec::new();
    for _ in 0..100 {
        saved = store.load_optional(AGENTS_FILE).unwrap().unwrap_or_default();
        if saved.first().map(|r| r.status.is_terminal()).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].id, record.id);
    assert_eq!(saved[0].status, AgentStatus::Exited);
}
