//! Guarded Operation Runner - single-flight background work per resource key
//!
//! Lock discipline: `statuses` is always taken before the ring log's own lock
//! and never while holding `tasks`.

use crate::log::{EntryKind, RingLog};
use chrono::{DateTime, Utc};
use devyard_foundation::Result;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Phase vocabulary for deployment runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Build,
    Up,
    Down,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Build => "build",
            Phase::Up => "up",
            Phase::Down => "down",
            Phase::Running => "running",
            Phase::Stopped => "stopped",
            Phase::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Current state of the operation for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub key: String,
    pub phase: Phase,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    /// Single-flight guard
    pub active: bool,
}

impl OperationStatus {
    fn idle(key: &str) -> Self {
        Self {
            key: key.to_string(),
            phase: Phase::Idle,
            message: String::new(),
            updated_at: Utc::now(),
            active: false,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another run was already active; `work` was not invoked
    Skipped,
}

impl StartOutcome {
    pub fn started(&self) -> bool {
        matches!(self, StartOutcome::Started)
    }
}

struct RunnerInner {
    statuses: Mutex<HashMap<String, OperationStatus>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RunnerInner {
    fn set_phase(&self, log: &RingLog, key: &str, phase: Phase, message: &str) {
        {
            let mut statuses = self.statuses.lock();
            let status = statuses
                .entry(key.to_string())
                .or_insert_with(|| OperationStatus::idle(key));
            status.phase = phase;
            status.message = message.to_string();
            status.updated_at = Utc::now();
        }
        log.push(
            key,
            EntryKind::Status,
            serde_json::json!({ "phase": phase, "message": message }),
        );
    }
}

/// Handle given to running work for progress reporting
#[derive(Clone)]
pub struct OperationContext {
    key: Arc<str>,
    log: RingLog,
    inner: Arc<RunnerInner>,
}

impl OperationContext {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Update the status and append a `status` entry
    pub fn set_phase(&self, phase: Phase, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(key = %self.key, phase = %phase, "Operation phase");
        self.inner.set_phase(&self.log, &self.key, phase, message);
    }

    /// Append one line of captured output
    pub fn line(&self, text: impl Into<String>) {
        self.log.push_text(&self.key, EntryKind::Line, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log.push_text(&self.key, EntryKind::Info, text);
    }

    pub fn log(&self) -> &RingLog {
        &self.log
    }
}

/// Clears `active` on every exit path; records an interruption when the
/// task is dropped before finishing
struct ActiveGuard {
    key: String,
    log: RingLog,
    inner: Arc<RunnerInner>,
    finished: bool,
}

impl ActiveGuard {
    fn fail(&self, message: &str) {
        error!(key = %self.key, error = %message, "Operation failed");
        self.log.push_text(&self.key, EntryKind::Error, message);
        self.inner
            .set_phase(&self.log, &self.key, Phase::Error, message);
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.key, "Operation interrupted");
            self.log
                .push_text(&self.key, EntryKind::Interrupted, "interrupted");
            self.inner
                .set_phase(&self.log, &self.key, Phase::Error, "interrupted");
        }

        if let Some(status) = self.inner.statuses.lock().get_mut(&self.key) {
            status.active = false;
            status.updated_at = Utc::now();
        }
    }
}

/// Single-flight runner
#[derive(Clone)]
pub struct OperationRunner {
    log: RingLog,
    inner: Arc<RunnerInner>,
}

impl OperationRunner {
    pub fn new(log: RingLog) -> Self {
        Self {
            log,
            inner: Arc::new(RunnerInner {
                statuses: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn log(&self) -> &RingLog {
        &self.log
    }

    /// Start `work` for `key` unless a run is already active
    ///
    /// Returns immediately; `work` runs on its own task. Its errors and panics
    /// are recorded in the ring log and status, never returned here.
    pub fn start<F, Fut>(&self, key: &str, work: F) -> StartOutcome
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        {
            let mut statuses = self.inner.statuses.lock();
            let status = statuses
                .entry(key.to_string())
                .or_insert_with(|| OperationStatus::idle(key));

            if status.active {
                drop(statuses);
                info!(key = %key, "Operation already running, skipping");
                self.log
                    .push_text(key, EntryKind::Skip, "skip: already running");
                return StartOutcome::Skipped;
            }

            status.active = true;
            status.updated_at = Utc::now();
            self.log.clear(key);
        }

        info!(key = %key, "Operation started");

        let ctx = OperationContext {
            key: Arc::from(key),
            log: self.log.clone(),
            inner: Arc::clone(&self.inner),
        };
        let mut guard = ActiveGuard {
            key: key.to_string(),
            log: self.log.clone(),
            inner: Arc::clone(&self.inner),
            finished: false,
        };

        // Held across spawn so a fast follow-up run cannot be overwritten
        let mut tasks = self.inner.tasks.lock();
        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(work(ctx)).catch_unwind().await {
                Ok(Ok(())) => debug!(key = %guard.key, "Operation finished"),
                Ok(Err(e)) => guard.fail(&e.to_string()),
                Err(panic) => guard.fail(&panic_message(panic.as_ref())),
            }
            guard.finished = true;
        });
        tasks.insert(key.to_string(), handle);

        StartOutcome::Started
    }

    /// Current status for `key`, created idle on first use
    pub fn status(&self, key: &str) -> OperationStatus {
        self.inner
            .statuses
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| OperationStatus::idle(key))
            .clone()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner
            .statuses
            .lock()
            .get(key)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Every key seen so far, sorted
    pub fn statuses(&self) -> Vec<OperationStatus> {
        let mut all: Vec<_> = self.inner.statuses.lock().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Interrupt the active run for `key`, if any
    pub async fn cancel(&self, key: &str) -> bool {
        let handle = self.inner.tasks.lock().remove(key);
        match handle {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                let _ = handle.await;
                true
            }
            _ => false,
        }
    }

    /// Interrupt every in-flight run and wait for their cleanup
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.inner.tasks.lock().drain().collect();
        for (key, handle) in handles {
            if handle.is_finished() {
                continue;
            }
            info!(key = %key, "Interrupting operation for shutdown");
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic in background work".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devyard_foundation::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn wait_idle(runner: &OperationRunner, key: &str) {
        for _ in 0..200 {
            if !runner.is_active(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation for {} never finished", key);
    }

    fn kinds(runner: &OperationRunner, key: &str) -> Vec<EntryKind> {
        runner
            .log()
            .snapshot(key)
            .entries
            .iter()
            .map(|e| e.kind)
            .collect()
    }

    #[tokio::test]
    async fn test_single_flight() {
        let runner = OperationRunner::new(RingLog::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let start = |runner: &OperationRunner| {
            let runs = Arc::clone(&runs);
            let release = Arc::clone(&release);
            runner.start("web", move |ctx| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.set_phase(Phase::Build, "building");
                release.notified().await;
                Ok(())
            })
        };

        assert_eq!(start(&runner), StartOutcome::Started);
        assert_eq!(start(&runner), StartOutcome::Skipped);
        assert!(runner.is_active("web"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();
        wait_idle(&runner, "web").await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(kinds(&runner, "web").contains(&EntryKind::Skip));
        assert_eq!(runner.status("web").phase, Phase::Build);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_from_threads() {
        let runner = OperationRunner::new(RingLog::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut joins = Vec::new();
        for _ in 0..8 {
            let runner = runner.clone();
            let runs = Arc::clone(&runs);
            let release = Arc::clone(&release);
            joins.push(tokio::spawn(async move {
                runner.start("api", move |_ctx| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                })
            }));
        }

        let mut started = 0;
        for join in joins {
            if join.await.unwrap().started() {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();
        wait_idle(&runner, "api").await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_clears_previous_log() {
        let runner = OperationRunner::new(RingLog::new());
        runner.start("web", |ctx| async move {
            ctx.line("first run");
            Ok(())
        });
        wait_idle(&runner, "web").await;

        runner.start("web", |ctx| async move {
            ctx.line("second run");
            Ok(())
        });
        wait_idle(&runner, "web").await;

        let snapshot = runner.log().snapshot("web");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].payload_text(), Some("second run"));
        assert_eq!(snapshot.entries[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_error_is_recorded() {
        let runner = OperationRunner::new(RingLog::new());
        let outcome = runner.start("web", |ctx| async move {
            ctx.set_phase(Phase::Up, "starting containers");
            Err(Error::process("compose up exited with 1"))
        });
        assert!(outcome.started());
        wait_idle(&runner, "web").await;

        let status = runner.status("web");
        assert_eq!(status.phase, Phase::Error);
        assert!(!status.active);
        assert!(status.message.contains("exited with 1"));
        assert!(kinds(&runner, "web").contains(&EntryKind::Error));
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let runner = OperationRunner::new(RingLog::new());
        runner.start("web", |_ctx| async move {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        wait_idle(&runner, "web").await;

        let status = runner.status("web");
        assert_eq!(status.phase, Phase::Error);
        assert_eq!(status.message, "panic: boom");
    }

    #[tokio::test]
    async fn test_shutdown_interrupts() {
        let runner = OperationRunner::new(RingLog::new());
        runner.start("web", |ctx| async move {
            ctx.set_phase(Phase::Build, "building");
            futures::future::pending::<()>().await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        runner.shutdown().await;

        let status = runner.status("web");
        assert!(!status.active);
        assert_eq!(status.phase, Phase::Error);
        assert!(kinds(&runner, "web").contains(&EntryKind::Interrupted));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_one_key() {
        let runner = OperationRunner::new(RingLog::new());
        for key in ["web", "api"] {
            runner.start(key, |ctx| async move {
                ctx.set_phase(Phase::Build, "building");
                futures::future::pending::<()>().await;
                Ok(())
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(runner.cancel("web").await);
        assert!(!runner.cancel("web").await);

        let status = runner.status("web");
        assert!(!status.active);
        assert_eq!(status.phase, Phase::Error);
        assert!(kinds(&runner, "web").contains(&EntryKind::Interrupted));
        assert!(runner.is_active("api"));

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_is_lazy() {
        let runner = OperationRunner::new(RingLog::new());
        assert!(runner.statuses().is_empty());
        let status = runner.status("fresh");
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.active);
        assert_eq!(runner.statuses().len(), 1);
    }
}
