//! Deployments - compose build/up/down driven through the guarded runner

use crate::container::{CommandOutput, ContainerRunner};
use crate::log::LogEntry;
use crate::operation::{OperationContext, OperationRunner, OperationStatus, Phase, StartOutcome};
use crate::project::{ProjectLookup, ProjectTarget};
use devyard_foundation::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Operation status plus the buffered log for one key
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(flatten)]
    pub status: OperationStatus,
    pub cursor: u64,
    pub log: Vec<LogEntry>,
}

#[derive(Clone)]
pub struct Deployer {
    runner: OperationRunner,
    containers: Arc<dyn ContainerRunner>,
    projects: Arc<dyn ProjectLookup>,
}

impl Deployer {
    pub fn new(
        runner: OperationRunner,
        containers: Arc<dyn ContainerRunner>,
        projects: Arc<dyn ProjectLookup>,
    ) -> Self {
        Self {
            runner,
            containers,
            projects,
        }
    }

    pub fn runner(&self) -> &OperationRunner {
        &self.runner
    }

    /// Build and start the project's containers in the background
    pub fn deploy(&self, key: &str) -> Result<StartOutcome> {
        let target = self.projects.resolve(key)?;
        let containers = Arc::clone(&self.containers);

        Ok(self.runner.start(key, move |ctx| async move {
            ctx.set_phase(Phase::Build, "building images");
            let output = containers.build(&target).await?;
            record(&ctx, output, "compose build")?;

            ctx.set_phase(Phase::Up, "starting containers");
            let output = containers.up(&target).await?;
            record(&ctx, output, "compose up")?;

            info!(key = %target.key, "Deployment running");
            ctx.set_phase(Phase::Running, format!("{} is running", target.container));
            Ok(())
        }))
    }

    /// Stop and remove the project's containers in the background
    pub fn teardown(&self, key: &str) -> Result<StartOutcome> {
        let target = self.projects.resolve(key)?;
        let containers = Arc::clone(&self.containers);

        Ok(self.runner.start(key, move |ctx| async move {
            ctx.set_phase(Phase::Down, "stopping containers");
            let output = containers.down(&target).await?;
            record(&ctx, output, "compose down")?;

            info!(key = %target.key, "Deployment stopped");
            ctx.set_phase(Phase::Stopped, format!("{} stopped", target.container));
            Ok(())
        }))
    }

    pub fn status(&self, key: &str) -> Result<DeploymentStatus> {
        self.projects.resolve(key)?;
        let status = self.runner.status(key);
        let snapshot = self.runner.log().snapshot(key);
        Ok(DeploymentStatus {
            status,
            cursor: snapshot.cursor,
            log: snapshot.entries,
        })
    }

    /// Interrupt the in-flight deploy or teardown for `key`
    pub async fn cancel(&self, key: &str) -> Result<bool> {
        self.projects.resolve(key)?;
        Ok(self.runner.cancel(key).await)
    }

    pub fn operations(&self) -> Vec<OperationStatus> {
        self.runner.statuses()
    }

    pub fn target(&self, key: &str) -> Result<ProjectTarget> {
        self.projects.resolve(key)
    }
}

/// Forward captured output as `line` entries, then fail on non-zero exit
fn record(ctx: &OperationContext, output: CommandOutput, what: &str) -> Result<()> {
    for line in output.lines() {
        ctx.line(line);
    }
    output.check(what).map(|_| ())
}
