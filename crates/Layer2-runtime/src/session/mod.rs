//! Session Multiplexer - one live shell per session id, shared by many viewers
//!
//! Lifecycle: `connecting → connected → (detached ⇄ connected)* → closed`.
//!
//! Lock discipline: the registry mutex is never held across an await or while
//! writing to a backing shell. Background tasks (setup, output pump) tag their
//! session with a generation number and only touch the registry entry that
//! still carries it, so a closed-and-recreated id is never disturbed by the
//! tasks of its predecessor.

mod protocol;
mod pty;
mod shell;

pub use protocol::{ClientFrame, ControlAction, ServerFrame, SessionMode};
pub use pty::PtyShellConnector;
pub use shell::{ShellConnector, ShellControl, ShellEvent, ShellHandle, TermSize};

use crate::container::{CommandOutput, ContainerRunner};
use crate::log::{EntryKind, RingLog};
use crate::project::{ProjectLookup, ProjectTarget};
use chrono::{DateTime, Utc};
use devyard_foundation::{Error, JsonStore, Result, SessionConfig, SnapshotWriter, SESSIONS_FILE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type ViewerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Detached,
    Closed,
}

/// Listable view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub resource_key: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub viewers: usize,
    /// Restored from a previous run; no live shell behind it
    #[serde(default)]
    pub stale: bool,
}

/// A viewer's end of a session: frames arrive here until the session closes
/// it by dropping the sender
pub struct ViewerConnection {
    pub id: ViewerId,
    pub session_id: String,
    pub frames: mpsc::UnboundedReceiver<ServerFrame>,
}

struct Viewer {
    id: ViewerId,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

struct SessionEntry {
    record: SessionRecord,
    generation: u64,
    size: TermSize,
    /// Attached viewers receiving output
    consumers: Vec<Viewer>,
    /// Viewers queued while the session is connecting
    pending: Vec<Viewer>,
    control: Option<Arc<dyn ShellControl>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionEntry {
    fn send_all(&self, frame: &ServerFrame) {
        for viewer in self.consumers.iter().chain(self.pending.iter()) {
            let _ = viewer.tx.send(frame.clone());
        }
    }

    fn touch(&mut self, status: SessionStatus) {
        self.record.status = status;
        self.record.viewers = self.consumers.len() + self.pending.len();
        self.record.updated_at = Utc::now();
    }
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, SessionEntry>,
    stale: HashMap<String, SessionRecord>,
}

struct Inner {
    registry: Mutex<Registry>,
    connector: Arc<dyn ShellConnector>,
    containers: Arc<dyn ContainerRunner>,
    projects: Arc<dyn ProjectLookup>,
    log: RingLog,
    config: SessionConfig,
    snapshots: SnapshotWriter,
    next_viewer: AtomicU64,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<Inner>,
}

impl SessionMultiplexer {
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        containers: Arc<dyn ContainerRunner>,
        projects: Arc<dyn ProjectLookup>,
        log: RingLog,
        config: SessionConfig,
        snapshots: SnapshotWriter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                connector,
                containers,
                projects,
                log,
                config,
                snapshots,
                next_viewer: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Load the previous run's registry as stale, informational records
    pub fn restore(&self, store: &JsonStore) {
        let records: Vec<SessionRecord> = match store.load_optional(SESSIONS_FILE) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to load session registry");
                return;
            }
        };

        let mut registry = self.inner.registry.lock();
        for mut record in records {
            record.stale = true;
            record.viewers = 0;
            registry.stale.insert(record.id.clone(), record);
        }
        info!(count = registry.stale.len(), "Restored stale session records");
    }

    /// Attach a new viewer to `session_id`, creating the session if needed
    pub fn attach(
        &self,
        session_id: &str,
        resource_key: &str,
        mode: SessionMode,
        size: Option<TermSize>,
    ) -> Result<ViewerConnection> {
        if session_id.trim().is_empty() || resource_key.trim().is_empty() {
            return Err(Error::Validation(
                "sessionId and resourceKey are required".to_string(),
            ));
        }

        if let Some(viewer) = self.join_existing(session_id, resource_key)? {
            return Ok(viewer);
        }

        let target = self.inner.projects.resolve(resource_key)?;

        let (viewer, frames) = self.inner.new_viewer();
        let viewer_id = viewer.id;
        let mut registry = self.inner.registry.lock();

        // Someone else may have created it while the lock was released
        if let Some(entry) = registry.live.get_mut(session_id) {
            if entry.record.resource_key != resource_key {
                return Err(mismatch(session_id, &entry.record.resource_key));
            }
            join(entry, viewer);
        } else {
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            let size = size.unwrap_or_else(|| {
                TermSize::new(self.inner.config.default_cols, self.inner.config.default_rows)
            });

            registry.stale.remove(session_id);
            let mut entry = SessionEntry {
                record: SessionRecord {
                    id: session_id.to_string(),
                    resource_key: resource_key.to_string(),
                    mode,
                    status: SessionStatus::Connecting,
                    created_at: now,
                    updated_at: now,
                    viewers: 1,
                    stale: false,
                },
                generation,
                size,
                consumers: Vec::new(),
                pending: vec![viewer],
                control: None,
                tasks: Vec::new(),
            };

            info!(session_id = %session_id, key = %resource_key, mode = ?mode, "Creating session");
            let inner = Arc::clone(&self.inner);
            let id = session_id.to_string();
            entry.tasks.push(tokio::spawn(async move {
                inner.setup(id, generation, target, mode).await;
            }));
            registry.live.insert(session_id.to_string(), entry);
        }

        self.inner.persist(&registry);
        Ok(ViewerConnection {
            id: viewer_id,
            session_id: session_id.to_string(),
            frames,
        })
    }

    fn join_existing(&self, session_id: &str, resource_key: &str) -> Result<Option<ViewerConnection>> {
        let mut registry = self.inner.registry.lock();
        let Some(entry) = registry.live.get_mut(session_id) else {
            return Ok(None);
        };
        if entry.record.resource_key != resource_key {
            return Err(mismatch(session_id, &entry.record.resource_key));
        }

        let (viewer, frames) = self.inner.new_viewer();
        let id = viewer.id;
        join(entry, viewer);
        debug!(session_id = %session_id, viewer = id, "Viewer joined session");

        self.inner.persist(&registry);
        Ok(Some(ViewerConnection {
            id,
            session_id: session_id.to_string(),
            frames,
        }))
    }

    /// Remove a viewer; the backing shell keeps running
    pub fn detach(&self, session_id: &str, viewer: ViewerId) -> Result<()> {
        let mut registry = self.inner.registry.lock();
        let entry = registry
            .live
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;

        entry.consumers.retain(|v| v.id != viewer);
        entry.pending.retain(|v| v.id != viewer);

        let status = match entry.record.status {
            SessionStatus::Connected if entry.consumers.is_empty() => SessionStatus::Detached,
            status => status,
        };
        entry.touch(status);
        debug!(session_id = %session_id, viewer, status = ?status, "Viewer detached");

        self.inner.persist(&registry);
        Ok(())
    }

    /// Forward input verbatim to the backing shell
    pub fn input(&self, session_id: &str, data: &[u8]) -> Result<()> {
        self.control(session_id)?.write(data)
    }

    /// Resize the shared terminal; before connect the size is kept for setup
    pub fn resize(&self, session_id: &str, size: TermSize) -> Result<()> {
        let control = {
            let mut registry = self.inner.registry.lock();
            let entry = registry
                .live
                .get_mut(session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            entry.size = size;
            entry.control.clone()
        };
        match control {
            Some(control) => control.resize(size),
            None => Ok(()),
        }
    }

    /// Tear down the backing shell and evict the session
    pub fn close(&self, session_id: &str) -> Result<()> {
        let entry = {
            let mut registry = self.inner.registry.lock();
            let entry = registry.live.remove(session_id);
            if entry.is_none() && registry.stale.remove(session_id).is_some() {
                self.inner.persist(&registry);
                return Ok(());
            }
            let entry = entry.ok_or_else(|| Error::not_found("session", session_id))?;
            self.inner.persist(&registry);
            entry
        };

        info!(session_id = %session_id, key = %entry.record.resource_key, "Closing session");
        entry.send_all(&ServerFrame::info("Session closed"));
        for task in &entry.tasks {
            task.abort();
        }
        if let Some(control) = &entry.control {
            control.close();
        }
        self.inner.log.push(
            &entry.record.resource_key,
            EntryKind::Info,
            serde_json::json!({ "session": session_id, "event": "closed" }),
        );
        // Dropping the entry closes every viewer connection
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let registry = self.inner.registry.lock();
        registry
            .live
            .get(session_id)
            .map(|e| e.record.clone())
            .or_else(|| registry.stale.get(session_id).cloned())
    }

    /// Live sessions followed by stale records, oldest first
    pub fn list(&self) -> Vec<SessionRecord> {
        let registry = self.inner.registry.lock();
        let mut records: Vec<SessionRecord> =
            registry.live.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);

        let mut stale: Vec<SessionRecord> = registry.stale.values().cloned().collect();
        stale.sort_by_key(|r| r.created_at);
        records.extend(stale);
        records
    }

    /// Close every live session
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.inner.registry.lock().live.keys().cloned().collect();
        for id in ids {
            let _ = self.close(&id);
        }
    }

    fn control(&self, session_id: &str) -> Result<Arc<dyn ShellControl>> {
        let registry = self.inner.registry.lock();
        let entry = registry
            .live
            .get(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        entry.control.clone().ok_or_else(|| {
            Error::Conflict(format!("session {} is still connecting", session_id))
        })
    }
}

fn mismatch(session_id: &str, owner: &str) -> Error {
    Error::Conflict(format!(
        "session {} belongs to resource {}",
        session_id, owner
    ))
}

fn join(entry: &mut SessionEntry, viewer: Viewer) {
    let status = match entry.record.status {
        SessionStatus::Connecting => {
            entry.pending.push(viewer);
            SessionStatus::Connecting
        }
        _ => {
            entry.consumers.push(viewer);
            SessionStatus::Connected
        }
    };
    entry.touch(status);
}

impl Inner {
    fn new_viewer(&self) -> (Viewer, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_viewer.fetch_add(1, Ordering::SeqCst);
        (Viewer { id, tx }, rx)
    }

    fn persist(&self, registry: &Registry) {
        let records: Vec<&SessionRecord> = registry.live.values().map(|e| &e.record).collect();
        self.snapshots.submit(&records);
    }

    /// Send `frame` to every viewer of the session if it is still `generation`
    fn notify(&self, session_id: &str, generation: u64, frame: ServerFrame) {
        let registry = self.registry.lock();
        if let Some(entry) = registry.live.get(session_id) {
            if entry.generation == generation {
                entry.send_all(&frame);
            }
        }
    }

    /// Remove the session if it is still `generation`, sending `frame` last
    fn terminate(&self, session_id: &str, generation: u64, frame: ServerFrame) {
        let entry = {
            let mut registry = self.registry.lock();
            match registry.live.get(session_id) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            let entry = registry.live.remove(session_id);
            self.persist(&registry);
            entry
        };

        if let Some(entry) = entry {
            entry.send_all(&frame);
            if let Some(control) = &entry.control {
                control.close();
            }
            self.log.push(
                &entry.record.resource_key,
                EntryKind::Info,
                serde_json::json!({ "session": session_id, "event": "ended" }),
            );
        }
    }

    async fn recreate(&self, session_id: &str, generation: u64, target: &ProjectTarget) -> Result<()> {
        self.notify(session_id, generation, ServerFrame::info("Recreating container"));

        let output = self.containers.down(target).await?;
        self.relay(session_id, generation, output, "compose down")?;
        let output = self.containers.build(target).await?;
        self.relay(session_id, generation, output, "compose build")?;
        let output = self.containers.up(target).await?;
        self.relay(session_id, generation, output, "compose up")
    }

    /// Show compose output to the waiting viewers, failing on non-zero exit
    fn relay(&self, session_id: &str, generation: u64, output: CommandOutput, what: &str) -> Result<()> {
        for line in output.lines() {
            self.notify(session_id, generation, ServerFrame::info(line));
        }
        output.check(what).map(|_| ())
    }

    async fn connect(&self, session_id: &str, generation: u64, target: &ProjectTarget) -> Result<ShellHandle> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let size = {
                let registry = self.registry.lock();
                match registry.live.get(session_id) {
                    Some(entry) if entry.generation == generation => entry.size,
                    // Closed while connecting
                    _ => return Err(Error::Connection("session closed during setup".to_string())),
                }
            };

            match self.connector.connect(target, size).await {
                Ok(handle) => return Ok(handle),
                Err(e) if !e.is_retryable() => {
                    warn!(session_id = %session_id, attempt, error = %e, "Shell connect rejected");
                    return Err(e);
                }
                Err(e) => {
                    warn!(session_id = %session_id, attempt, error = %e, "Shell connect failed");
                    self.notify(
                        session_id,
                        generation,
                        ServerFrame::info(format!(
                            "Connection attempt {}/{} failed: {}",
                            attempt, attempts, e
                        )),
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_delay()).await;
                    }
                }
            }
        }

        Err(Error::Connection(format!(
            "giving up after {} attempts: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn setup(self: Arc<Self>, session_id: String, generation: u64, target: ProjectTarget, mode: SessionMode) {
        let result = async {
            if mode == SessionMode::Recreate {
                self.recreate(&session_id, generation, &target).await?;
            }
            self.connect(&session_id, generation, &target).await
        }
        .await;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Session setup failed");
                self.terminate(&session_id, generation, ServerFrame::error(e.to_string()));
                return;
            }
        };

        let ShellHandle { events, control } = handle;
        {
            let mut registry = self.registry.lock();
            let current = matches!(
                registry.live.get(&session_id),
                Some(entry) if entry.generation == generation
            );
            if !current {
                drop(registry);
                control.close();
                return;
            }
            let Some(entry) = registry.live.get_mut(&session_id) else {
                return;
            };

            let pending: Vec<Viewer> = entry.pending.drain(..).collect();
            entry.consumers.extend(pending);
            entry.control = Some(Arc::clone(&control));

            let status = if entry.consumers.is_empty() {
                SessionStatus::Detached
            } else {
                SessionStatus::Connected
            };
            entry.touch(status);
            entry.send_all(&ServerFrame::info(format!("Connected to {}", target.container)));

            let inner = Arc::clone(&self);
            let id = session_id.clone();
            entry.tasks.push(tokio::spawn(async move {
                inner.pump(id, generation, events).await;
            }));
            self.persist(&registry);
        }

        info!(session_id = %session_id, key = %target.key, "Session connected");
        self.log.push(
            &target.key,
            EntryKind::Info,
            serde_json::json!({ "session": session_id, "event": "connected" }),
        );
    }

    /// Fan backing output out to every consumer until the shell ends
    async fn pump(self: Arc<Self>, session_id: String, generation: u64, mut events: mpsc::Receiver<ShellEvent>) {
        let mut decoder = Utf8Carry::default();

        while let Some(event) = events.recv().await {
            match event {
                ShellEvent::Data(bytes) => {
                    let text = decoder.push(&bytes);
                    if !text.is_empty() {
                        self.notify(&session_id, generation, ServerFrame::output(text));
                    }
                }
                ShellEvent::Exit(code) => {
                    self.flush(&session_id, generation, &mut decoder);
                    info!(session_id = %session_id, code = ?code, "Shell exited");
                    let message = match code {
                        Some(code) => format!("Shell exited with code {}", code),
                        None => "Shell exited".to_string(),
                    };
                    self.terminate(&session_id, generation, ServerFrame::info(message));
                    return;
                }
                ShellEvent::Error(message) => {
                    self.flush(&session_id, generation, &mut decoder);
                    error!(session_id = %session_id, error = %message, "Shell connection lost");
                    self.terminate(&session_id, generation, ServerFrame::error(message));
                    return;
                }
            }
        }

        self.flush(&session_id, generation, &mut decoder);
        self.terminate(&session_id, generation, ServerFrame::info("Shell closed"));
    }

    fn flush(&self, session_id: &str, generation: u64, decoder: &mut Utf8Carry) {
        let rest = decoder.finish();
        if !rest.is_empty() {
            self.notify(session_id, generation, ServerFrame::output(rest));
        }
    }
}

/// Incremental UTF-8 decoder holding back an incomplete trailing sequence
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
