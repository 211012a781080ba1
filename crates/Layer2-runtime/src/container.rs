//! Container command runner
//!
//! Narrow interface over the Docker/Podman CLI: compose lifecycle commands
//! that run to completion, plus `exec` into a running container.

use crate::project::ProjectTarget;
use async_trait::async_trait;
use devyard_foundation::{ContainerRuntime, Error, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Captured result of a finished container command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty stdout and stderr lines, stdout first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
    }

    /// Turn a non-zero exit into `Error::Process`
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            let detail = self.stderr.trim();
            Err(Error::process(if detail.is_empty() {
                format!("{} exited with {}", what, self.exit_code)
            } else {
                format!("{} exited with {}: {}", what, self.exit_code, detail)
            }))
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn build(&self, target: &ProjectTarget) -> Result<CommandOutput>;

    async fn up(&self, target: &ProjectTarget) -> Result<CommandOutput>;

    async fn down(&self, target: &ProjectTarget) -> Result<CommandOutput>;

    async fn ps(&self, target: &ProjectTarget) -> Result<CommandOutput>;

    async fn logs(&self, target: &ProjectTarget, tail: usize) -> Result<CommandOutput>;

    /// Run `script` with `sh -c` inside the container to completion
    async fn exec(&self, target: &ProjectTarget, script: &str) -> Result<CommandOutput>;

    /// Spawn `script` inside the container with piped stdout/stderr
    fn spawn_exec(&self, target: &ProjectTarget, script: &str) -> Result<Child>;
}

/// `docker compose` / `podman compose` backed runner
pub struct ComposeRunner {
    runtime: ContainerRuntime,
}

impl ComposeRunner {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    pub fn docker() -> Self {
        Self::new(ContainerRuntime::Docker)
    }

    pub fn podman() -> Self {
        Self::new(ContainerRuntime::Podman)
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    fn compose_args(target: &ProjectTarget, sub: &[&str]) -> Vec<String> {
        let mut args = vec!["compose".to_string(), "-p".to_string(), target.key.clone()];
        if let Some(file) = &target.compose_file {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args.extend(sub.iter().map(|s| s.to_string()));
        args
    }

    fn exec_args(target: &ProjectTarget, script: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            "-i".to_string(),
            target.container.clone(),
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<CommandOutput> {
        debug!("Running {} {}", self.runtime.command(), args.join(" "));

        let output = Command::new(self.runtime.command())
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::process(format!("Failed to spawn {}: {}", self.runtime.command(), e))
            })?;

        Ok(output.into())
    }

    async fn compose(&self, target: &ProjectTarget, sub: &[&str]) -> Result<CommandOutput> {
        info!(key = %target.key, "{} compose {}", self.runtime.command(), sub.join(" "));
        self.run(Self::compose_args(target, sub)).await
    }
}

#[async_trait]
impl ContainerRunner for ComposeRunner {
    async fn build(&self, target: &ProjectTarget) -> Result<CommandOutput> {
        self.compose(target, &["build"]).await
    }

    async fn up(&self, target: &ProjectTarget) -> Result<CommandOutput> {
        self.compose(target, &["up", "-d"]).await
    }

    async fn down(&self, target: &ProjectTarget) -> Result<CommandOutput> {
        self.compose(target, &["down"]).await
    }

    async fn ps(&self, target: &ProjectTarget) -> Result<CommandOutput> {
        self.compose(target, &["ps"]).await
    }

    async fn logs(&self, target: &ProjectTarget, tail: usize) -> Result<CommandOutput> {
        let tail = tail.to_string();
        self.compose(target, &["logs", "--no-color", "--tail", &tail])
            .await
    }

    async fn exec(&self, target: &ProjectTarget, script: &str) -> Result<CommandOutput> {
        self.run(Self::exec_args(target, script)).await
    }

    fn spawn_exec(&self, target: &ProjectTarget, script: &str) -> Result<Child> {
        Command::new(self.runtime.command())
            .args(Self::exec_args(target, script))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::process(format!("Failed to spawn {}: {}", self.runtime.command(), e))
            })
    }
}
