//! Snapshot writer - out-of-band persistence of in-memory state
//!
//! Callers hand over a full snapshot after every mutation and never wait for
//! the write. The queue holds at most one pending snapshot: a newer one
//! replaces an older one that has not been written yet. Write failures are
//! logged and dropped.

use super::JsonStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct SnapshotWriter {
    filename: Arc<str>,
    tx: Arc<watch::Sender<Option<serde_json::Value>>>,
}

impl SnapshotWriter {
    /// Start a background writer for `filename` inside `store`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: JsonStore, filename: &str) -> Self {
        let (tx, mut rx) = watch::channel::<Option<serde_json::Value>>(None);
        let name = filename.to_string();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let pending = rx.borrow_and_update().clone();
                let Some(value) = pending else {
                    continue;
                };

                let store = store.clone();
                let file = name.clone();
                let result =
                    tokio::task::spawn_blocking(move || store.save(&file, &value)).await;

                match result {
                    Ok(Ok(())) => debug!(file = %name, "Snapshot written"),
                    Ok(Err(e)) => warn!(file = %name, error = %e, "Snapshot write failed"),
                    Err(e) => warn!(file = %name, error = %e, "Snapshot task failed"),
                }
            }
            debug!(file = %name, "Snapshot writer stopped");
        });

        Self {
            filename: Arc::from(filename),
            tx: Arc::new(tx),
        }
    }

    /// A writer that accepts snapshots and discards them
    pub fn disabled(filename: &str) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            filename: Arc::from(filename),
            tx: Arc::new(tx),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Queue a snapshot; never blocks and never fails
    pub fn submit<T: Serialize + ?Sized>(&self, data: &T) {
        match serde_json::to_value(data) {
            Ok(value) => {
                self.tx.send_replace(Some(value));
            }
            Err(e) => warn!(file = %self.filename, error = %e, "Snapshot serialization failed"),
        }
    }
}
