//! Outbound notifications: session status and throttled output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::session::{Removed, SessionId, SessionStatus};

/// Receives session lifecycle events. Calls are fire-and-forget and must not
/// block; they run on the caller's thread or on the event loop.
///
/// `on_status_change` from the event loop runs with the registry locked, so
/// implementations must not call back into the coordinator.
pub trait StatusObserver: Send + Sync {
    fn on_register(&self, id: SessionId, name: &str, cwd: &Path, display_context: Option<&str>);

    /// Fired exactly once per session, on its transition out of running.
    fn on_status_change(&self, id: SessionId, status: SessionStatus, exit_code: Option<i32>);

    fn on_remove(&self, id: SessionId);
}

/// Consumer of the throttled output path.
pub trait OutputListener: Send + Sync {
    /// Latest output chunk for `id`, at most once per notification window.
    fn on_output(&self, id: SessionId, text: &str);

    fn on_session_removed(&self, _id: SessionId) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StatusObserver for NoopObserver {
    fn on_register(&self, _id: SessionId, _name: &str, _cwd: &Path, _display_context: Option<&str>) {}
    fn on_status_change(&self, _id: SessionId, _status: SessionStatus, _exit_code: Option<i32>) {}
    fn on_remove(&self, _id: SessionId) {}
}

/// What the tracker knows about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub name: String,
    pub cwd: PathBuf,
    pub display_context: Option<String>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
}

/// Aggregate "is anything still running" view over all sessions.
///
/// Every change bumps a revision on a watch channel, so async callers can
/// wait for the next change instead of polling.
#[derive(Clone)]
pub struct ExecutionTracker {
    records: Arc<RwLock<HashMap<SessionId, ExecutionRecord>>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            revision: Arc::new(tx),
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    pub fn any_running(&self) -> bool {
        self.records
            .read()
            .values()
            .any(|r| r.status == SessionStatus::Running)
    }

    pub fn running_count(&self) -> usize {
        self.records
            .read()
            .values()
            .filter(|r| r.status == SessionStatus::Running)
            .count()
    }

    pub fn get(&self, id: &SessionId) -> Option<ExecutionRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn records(&self) -> Vec<(SessionId, ExecutionRecord)> {
        self.records
            .read()
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    /// Subscribe to changes. The value is a revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Wait until `id` has a terminal status or is no longer tracked.
    /// Returns the final record, if it is still known.
    pub async fn wait_finished(&self, id: SessionId) -> Option<ExecutionRecord> {
        let mut rx = self.subscribe();
        loop {
            match self.get(&id) {
                Some(record) if record.status.is_terminal() => return Some(record),
                None => return None,
                Some(_) => {}
            }
            if rx.changed().await.is_err() {
                return self.get(&id);
            }
        }
    }
}

impl StatusObserver for ExecutionTracker {
    fn on_register(&self, id: SessionId, name: &str, cwd: &Path, display_context: Option<&str>) {
        self.records.write().insert(
            id,
            ExecutionRecord {
                name: name.to_string(),
                cwd: cwd.to_path_buf(),
                display_context: display_context.map(str::to_string),
                status: SessionStatus::Running,
                exit_code: None,
            },
        );
        self.bump();
    }

    fn on_status_change(&self, id: SessionId, status: SessionStatus, exit_code: Option<i32>) {
        if let Some(record) = self.records.write().get_mut(&id) {
            record.status = status;
            record.exit_code = exit_code;
        }
        self.bump();
    }

    fn on_remove(&self, id: SessionId) {
        self.records.write().remove(&id);
        self.bump();
    }
}

/// The observer set the coordinator reports to.
#[derive(Clone)]
pub(crate) struct Observers {
    pub status: Arc<dyn StatusObserver>,
    pub output: Option<Arc<dyn OutputListener>>,
}

impl Observers {
    pub fn status_changed(&self, id: SessionId, status: SessionStatus, exit_code: Option<i32>) {
        tracing::info!(session = %id, %status, code = ?exit_code, "session status changed");
        self.status.on_status_change(id, status, exit_code);
    }

    /// Announce a removal. A session that was still running gets its final
    /// status first.
    pub fn removed(&self, removed: &Removed) {
        let id = removed.info.id;
        if removed.interrupted {
            self.status_changed(id, removed.info.status, removed.info.exit_code);
        }
        self.status.on_remove(id);
        if let Some(output) = &self.output {
            output.on_session_removed(id);
        }
    }
}
