use crate::lifecycle::PendingSpawns;
use crate::observer::Observers;
use crate::session::SessionRegistry;

/// "Kill all sessions" for the user action and for shutdown hooks.
///
/// Synchronous and runtime-free, so it can run from a signal handler thread
/// or a `Drop` impl as well as from async code.
#[derive(Clone)]
pub struct BulkController {
    registry: SessionRegistry,
    pending: PendingSpawns,
    observers: Observers,
}

impl BulkController {
    pub(crate) fn new(registry: SessionRegistry, pending: PendingSpawns, observers: Observers) -> Self {
        Self {
            registry,
            pending,
            observers,
        }
    }

    /// Kill every process, dispose every surface, and empty the registry in
    /// one sweep. Each removed session is announced once. Returns how many
    /// sessions were removed; a second call returns 0.
    pub fn kill_all(&self) -> usize {
        self.pending.clear();
        let removed = self.registry.drain();
        for session in &removed {
            self.observers.removed(session);
        }
        if !removed.is_empty() {
            let interrupted = removed.iter().filter(|r| r.interrupted).count();
            tracing::info!(count = removed.len(), interrupted, "killed all sessions");
        }
        removed.len()
    }
}
