use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::pty::ProcessHandle;
use crate::pump::{OutputBuffer, Throttle, DEFAULT_NOTIFY_INTERVAL};
use crate::surface::{Geometry, RenderSurface, SurfaceSlot};

/// Opaque session identifier. Random, so never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Completed
        } else {
            Self::Failed
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to run and how to label it.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Human-facing label. Defaults to the command line.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Owning project label, informational only.
    pub display_context: Option<String>,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        let command = command.into();
        Self {
            name: command.clone(),
            command,
            args: Vec::new(),
            cwd: cwd.into(),
            display_context: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        if !self.args.is_empty() {
            self.name = format!("{} {}", self.command, self.args.join(" "));
        }
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn display_context(mut self, context: impl Into<String>) -> Self {
        self.display_context = Some(context.into());
        self
    }
}

/// Point-in-time view of a session, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub cwd: PathBuf,
    pub display_context: Option<String>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    /// Whether a process handle is attached.
    pub attached: bool,
    pub pid: Option<u32>,
    pub accelerated: bool,
}

/// Exit bookkeeping. A session is finalized once the child has exited *and*
/// the PTY reader has drained, so the exit trailer follows all output.
#[derive(Debug, Default)]
pub(crate) struct ExitProgress {
    pub code: Option<i32>,
    pub reader_closed: bool,
    pub grace_armed: bool,
}

/// A single PTY-backed session: its process, its surface, and its output
/// pump state.
///
/// Sessions live inside the [`SessionRegistry`] and are only mutated under
/// the registry lock.
pub struct Session {
    id: SessionId,
    name: String,
    cwd: PathBuf,
    display_context: Option<String>,
    process: Option<Box<dyn ProcessHandle>>,
    surface: SurfaceSlot,
    status: SessionStatus,
    exit_code: Option<i32>,
    pub(crate) output: OutputBuffer,
    pub(crate) notify: Throttle<String>,
    pub(crate) exit: ExitProgress,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(id: SessionId, request: &SpawnRequest, surface: Box<dyn RenderSurface>) -> Self {
        Self {
            id,
            name: request.name.clone(),
            cwd: request.cwd.clone(),
            display_context: request.display_context.clone(),
            process: None,
            surface: SurfaceSlot::new(id, surface),
            status: SessionStatus::Running,
            exit_code: None,
            output: OutputBuffer::new(),
            notify: Throttle::new(DEFAULT_NOTIFY_INTERVAL),
            exit: ExitProgress::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_attached(&self) -> bool {
        self.process.is_some()
    }

    pub fn surface(&self) -> &SurfaceSlot {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut SurfaceSlot {
        &mut self.surface
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            name: self.name.clone(),
            cwd: self.cwd.clone(),
            display_context: self.display_context.clone(),
            status: self.status,
            exit_code: self.exit_code,
            attached: self.process.is_some(),
            pid: self.process.as_ref().and_then(|p| p.pid()),
            accelerated: self.surface.is_accelerated(),
        }
    }

    /// Forward input to the process. A session without a live process
    /// swallows it.
    pub fn write_input(&self, data: &[u8]) {
        if let Some(process) = &self.process {
            process.write(data);
        }
    }

    pub fn resize(&mut self, geometry: Geometry) {
        self.surface.resize(geometry);
        if let Some(process) = &self.process {
            process.resize(geometry);
        }
    }

    pub(crate) fn set_notify_interval(&mut self, interval: std::time::Duration) {
        self.notify = Throttle::new(interval);
    }

    fn attach(&mut self, handle: Box<dyn ProcessHandle>) -> Result<(), Box<dyn ProcessHandle>> {
        if self.process.is_some() {
            return Err(handle);
        }
        self.process = Some(handle);
        Ok(())
    }

    /// Move to a terminal status. Returns `true` only for the one transition
    /// out of `Running`; later calls are ignored.
    pub(crate) fn finish(&mut self, status: SessionStatus, exit_code: Option<i32>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        true
    }

    /// Release everything the session owns: terminate the process, then the
    /// surface (addons first, buffer last).
    ///
    /// Returns `true` if this interrupted a still-running session.
    fn release(&mut self) -> bool {
        let interrupted = match self.exit.code {
            Some(code) => self.finish(SessionStatus::from_exit_code(code), Some(code)),
            None => self.finish(SessionStatus::Failed, None),
        };
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.surface.dispose();
        interrupted
    }
}

/// A session that has left the registry, with its resources already released.
#[derive(Debug, Clone)]
pub struct Removed {
    pub info: SessionInfo,
    /// The session was still running when removed; its final status was set
    /// by the removal itself.
    pub interrupted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session {0} already has a process attached")]
    AlreadyAttached(SessionId),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
}

struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    /// Insertion order, oldest first.
    order: Vec<SessionId>,
    active: Option<SessionId>,
    max_sessions: Option<usize>,
}

/// The single owner of all live sessions.
///
/// Every mutation goes through one lock, and [`remove`](Self::remove) /
/// [`drain`](Self::drain) are the only ways a session's resources get
/// released.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Each session holds a PTY pair and three blocking threads.
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                order: Vec::new(),
                active: None,
                max_sessions,
            })),
        }
    }

    /// Register a new running session without starting a process. The new
    /// session becomes the active one.
    pub fn create(
        &self,
        request: &SpawnRequest,
        make_surface: impl FnOnce(&SessionId) -> Box<dyn RenderSurface>,
    ) -> Result<SessionId, RegistryError> {
        let mut inner = self.inner.lock();
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        let id = SessionId::new();
        let surface = make_surface(&id);
        inner.sessions.insert(id, Session::new(id, request, surface));
        inner.order.push(id);
        inner.active = Some(id);
        tracing::debug!(session = %id, name = %request.name, "session created");
        Ok(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.inner.lock().sessions.get(id).map(Session::info)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(Session::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> Option<SessionId> {
        self.inner.lock().active
    }

    /// Make `id` the active session (or clear it with `None`), focusing its
    /// surface.
    pub fn set_active(&self, id: Option<SessionId>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        match id {
            Some(id) => {
                let session = inner
                    .sessions
                    .get_mut(&id)
                    .ok_or(RegistryError::NotFound(id))?;
                session.surface.focus();
                inner.active = Some(id);
            }
            None => inner.active = None,
        }
        Ok(())
    }

    /// Run `f` against a live session under the registry lock.
    pub fn with_session<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.sessions.get_mut(id).map(f)
    }

    /// Store the process handle on a session.
    ///
    /// A handle that cannot be stored (session gone, or a handle already
    /// attached) belongs to nobody, so it is killed before returning the
    /// error.
    pub fn attach(&self, id: &SessionId, handle: Box<dyn ProcessHandle>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let rejected = match inner.sessions.get_mut(id) {
            Some(session) => match session.attach(handle) {
                Ok(()) => return Ok(()),
                Err(handle) => (RegistryError::AlreadyAttached(*id), handle),
            },
            None => (RegistryError::NotFound(*id), handle),
        };
        drop(inner);
        let (err, mut handle) = rejected;
        handle.kill();
        Err(err)
    }

    /// Remove a session and release its resources.
    ///
    /// If it was the active session, the most recently created remaining
    /// session becomes active. Returns `None` for unknown ids.
    pub fn remove(&self, id: &SessionId) -> Option<Removed> {
        let mut inner = self.inner.lock();
        let mut session = inner.sessions.remove(id)?;
        inner.order.retain(|s| s != id);
        if inner.active == Some(*id) {
            inner.active = inner.order.last().copied();
            if let Some(next) = inner.active {
                if let Some(next) = inner.sessions.get_mut(&next) {
                    next.surface.focus();
                }
            }
        }
        let interrupted = session.release();
        Some(Removed {
            info: session.info(),
            interrupted,
        })
    }

    /// Remove and release every session in one critical section, oldest
    /// first. Clears the active pointer.
    pub fn drain(&self) -> Vec<Removed> {
        let mut inner = self.inner.lock();
        let order = std::mem::take(&mut inner.order);
        inner.active = None;
        let mut removed = Vec::with_capacity(order.len());
        for id in order {
            if let Some(mut session) = inner.sessions.remove(&id) {
                let interrupted = session.release();
                removed.push(Removed {
                    info: session.info(),
                    interrupted,
                });
            }
        }
        debug_assert!(inner.sessions.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::ContainerHandle;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        disposed: AtomicBool,
        focused: AtomicUsize,
        killed: AtomicUsize,
    }

    struct ProbeSurface(Arc<Probe>);

    impl RenderSurface for ProbeSurface {
        fn open(&mut self, _container: &ContainerHandle) {}
        fn write(&mut self, _text: &str) {}
        fn focus(&mut self) {
            self.0.focused.fetch_add(1, Ordering::SeqCst);
        }
        fn geometry(&self) -> Option<Geometry> {
            None
        }
        fn resize(&mut self, _geometry: Geometry) {}
        fn dispose(&mut self) {
            self.0.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct ProbeProcess(Arc<Probe>);

    impl ProcessHandle for ProbeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }
        fn write(&self, _data: &[u8]) {}
        fn resize(&self, _geometry: Geometry) {}
        fn kill(&mut self) {
            self.0.killed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(name: &str) -> SpawnRequest {
        SpawnRequest::new("sh", "/tmp").name(name)
    }

    fn create(registry: &SessionRegistry, name: &str) -> (SessionId, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let surface_probe = probe.clone();
        let id = registry
            .create(&request(name), move |_| Box::new(ProbeSurface(surface_probe)))
            .unwrap();
        (id, probe)
    }

    #[test]
    fn create_allocates_running_session_without_process() {
        let registry = SessionRegistry::new();
        let (id, _) = create(&registry, "dev");
        let info = registry.get(&id).expect("session should exist");
        assert_eq!(info.name, "dev");
        assert_eq!(info.status, SessionStatus::Running);
        assert!(!info.attached);
        assert_eq!(info.exit_code, None);
    }

    #[test]
    fn ids_are_distinct_and_list_tracks_live_sessions() {
        let registry = SessionRegistry::new();
        let ids: Vec<_> = (0..20).map(|i| create(&registry, &format!("s{i}")).0).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 20);
        assert_eq!(registry.list().len(), 20);

        for id in &ids[..5] {
            registry.remove(id);
        }
        assert_eq!(registry.list().len(), 15);
        assert_eq!(registry.list()[0].id, ids[5], "list keeps insertion order");
    }

    #[test]
    fn newest_session_becomes_active() {
        let registry = SessionRegistry::new();
        let (a, _) = create(&registry, "a");
        assert_eq!(registry.active(), Some(a));
        let (b, _) = create(&registry, "b");
        assert_eq!(registry.active(), Some(b));
    }

    #[test]
    fn removing_active_selects_most_recent_remaining() {
        let registry = SessionRegistry::new();
        let (a, _) = create(&registry, "a");
        let (b, _) = create(&registry, "b");
        let (c, c_probe) = create(&registry, "c");

        registry.set_active(Some(a)).unwrap();
        registry.remove(&a);
        assert_eq!(registry.active(), Some(c));
        assert!(c_probe.focused.load(Ordering::SeqCst) >= 1);

        registry.remove(&c);
        assert_eq!(registry.active(), Some(b));
        registry.remove(&b);
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn removing_inactive_keeps_active() {
        let registry = SessionRegistry::new();
        let (a, _) = create(&registry, "a");
        let (b, _) = create(&registry, "b");
        registry.remove(&a);
        assert_eq!(registry.active(), Some(b));
    }

    #[test]
    fn set_active_rejects_unknown_session() {
        let registry = SessionRegistry::new();
        let err = registry.set_active(Some(SessionId::new())).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
        registry.set_active(None).unwrap();
    }

    #[test]
    fn remove_releases_process_and_surface() {
        let registry = SessionRegistry::new();
        let (id, probe) = create(&registry, "a");
        registry.attach(&id, Box::new(ProbeProcess(probe.clone()))).unwrap();

        let removed = registry.remove(&id).expect("first remove succeeds");
        assert!(removed.interrupted);
        assert_eq!(removed.info.status, SessionStatus::Failed);
        assert_eq!(probe.killed.load(Ordering::SeqCst), 1);
        assert!(probe.disposed.load(Ordering::SeqCst));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn second_remove_is_a_noop() {
        let registry = SessionRegistry::new();
        let (id, probe) = create(&registry, "a");
        registry.attach(&id, Box::new(ProbeProcess(probe.clone()))).unwrap();
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(probe.killed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_twice_is_rejected_and_extra_handle_killed() {
        let registry = SessionRegistry::new();
        let (id, probe) = create(&registry, "a");
        registry.attach(&id, Box::new(ProbeProcess(probe.clone()))).unwrap();

        let extra = Arc::new(Probe::default());
        let err = registry.attach(&id, Box::new(ProbeProcess(extra.clone()))).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyAttached(_)));
        assert_eq!(extra.killed.load(Ordering::SeqCst), 1);
        assert_eq!(probe.killed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attach_to_missing_session_kills_handle() {
        let registry = SessionRegistry::new();
        let probe = Arc::new(Probe::default());
        let err = registry
            .attach(&SessionId::new(), Box::new(ProbeProcess(probe.clone())))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
        assert_eq!(probe.killed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_only_moves_forward() {
        let registry = SessionRegistry::new();
        let (id, _) = create(&registry, "a");
        let first = registry.with_session(&id, |s| s.finish(SessionStatus::Completed, Some(0)));
        assert_eq!(first, Some(true));
        let second = registry.with_session(&id, |s| s.finish(SessionStatus::Failed, Some(1)));
        assert_eq!(second, Some(false));
        let back = registry.with_session(&id, |s| s.finish(SessionStatus::Running, None));
        assert_eq!(back, Some(false));

        let info = registry.get(&id).unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.exit_code, Some(0));
    }

    #[test]
    fn removing_finished_session_is_not_an_interruption() {
        let registry = SessionRegistry::new();
        let (id, _) = create(&registry, "a");
        registry.with_session(&id, |s| s.finish(SessionStatus::Completed, Some(0)));
        let removed = registry.remove(&id).unwrap();
        assert!(!removed.interrupted);
        assert_eq!(removed.info.status, SessionStatus::Completed);
    }

    #[test]
    fn removal_uses_known_exit_code_when_exit_is_still_settling() {
        let registry = SessionRegistry::new();
        let (id, _) = create(&registry, "a");
        registry.with_session(&id, |s| s.exit.code = Some(3));
        let removed = registry.remove(&id).unwrap();
        assert!(removed.interrupted);
        assert_eq!(removed.info.status, SessionStatus::Failed);
        assert_eq!(removed.info.exit_code, Some(3));
    }

    #[test]
    fn max_sessions_is_enforced() {
        let registry = SessionRegistry::with_max_sessions(Some(2));
        create(&registry, "a");
        create(&registry, "b");
        let err = registry
            .create(&request("c"), |_| Box::new(ProbeSurface(Arc::new(Probe::default()))))
            .unwrap_err();
        assert!(matches!(err, RegistryError::MaxSessionsReached));
    }

    #[test]
    fn drain_releases_everything_and_clears_active() {
        let registry = SessionRegistry::new();
        let probes: Vec<_> = (0..3).map(|i| create(&registry, &format!("s{i}"))).collect();
        for (id, probe) in &probes {
            registry.attach(id, Box::new(ProbeProcess(probe.clone()))).unwrap();
        }

        let removed = registry.drain();
        assert_eq!(removed.len(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.active(), None);
        for (_, probe) in &probes {
            assert_eq!(probe.killed.load(Ordering::SeqCst), 1);
            assert!(probe.disposed.load(Ordering::SeqCst));
        }
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn concurrent_creates_and_removes_do_not_lose_updates() {
        let registry = SessionRegistry::with_max_sessions(None);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut kept = 0;
                    for i in 0..50 {
                        let (id, _) = create(&registry, &format!("t{t}-{i}"));
                        if i % 2 == 0 {
                            assert!(registry.remove(&id).is_some());
                        } else {
                            kept += 1;
                        }
                    }
                    kept
                })
            })
            .collect();
        let kept: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(registry.len(), kept);
        assert_eq!(registry.list().len(), kept);
    }

    #[test]
    fn spawn_request_builder_names_from_command_line() {
        let req = SpawnRequest::new("npm", "/srv/app").args(["run", "dev"]);
        assert_eq!(req.name, "npm run dev");
        let req = req.name("dev server").display_context("storefront");
        assert_eq!(req.name, "dev server");
        assert_eq!(req.display_context.as_deref(), Some("storefront"));
    }
}
