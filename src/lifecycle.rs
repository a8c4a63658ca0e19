//! Session lifecycle: spawn → attach → run → exit/kill → dispose.
//!
//! [`Coordinator`] is the caller-facing handle. Its methods are synchronous
//! and only touch the registry through its locked methods. [`EventLoop`] is a
//! single task that owns every timer and applies everything the PTY threads
//! report (output, reader closure, exit, spawn results), in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use crate::bulk::BulkController;
use crate::config::PtyConfig;
use crate::env::{EnvProvider, LoginShellEnv};
use crate::observer::{NoopObserver, Observers, OutputListener, StatusObserver};
use crate::pty::{Launcher, ProcessHandle, PtyLauncher, SpawnError};
use crate::pump::ThrottleDecision;
use crate::session::{
    RegistryError, Session, SessionId, SessionInfo, SessionRegistry, SessionStatus, SpawnRequest,
};
use crate::surface::{ContainerHandle, Geometry, SurfaceFactory};

/// Written into the surface when the launcher fails.
pub fn spawn_failure_trailer(err: &SpawnError) -> String {
    format!("\x1b[31mfailed to start process: {err}\x1b[0m\r\n")
}

/// Written into the surface after the last output of an exited process.
pub fn exit_trailer(code: i32) -> String {
    format!("\r\n\x1b[2m[process exited with code {code}]\x1b[0m\r\n")
}

pub(crate) enum LoopEvent {
    Launch {
        id: SessionId,
        geometry: Geometry,
    },
    Spawned {
        id: SessionId,
        result: Result<Box<dyn ProcessHandle>, SpawnError>,
    },
    Output {
        id: SessionId,
        data: Bytes,
    },
    ReaderClosed {
        id: SessionId,
    },
    Exited {
        id: SessionId,
        code: i32,
    },
}

/// Sink a launched process reports through. Cheap to clone and safe to use
/// from any thread.
#[derive(Clone)]
pub struct ProcessEvents {
    id: SessionId,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl ProcessEvents {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Report a chunk of output. Returns `false` once the event loop is gone,
    /// at which point readers can stop.
    pub fn output(&self, data: Bytes) -> bool {
        self.tx.send(LoopEvent::Output { id: self.id, data }).is_ok()
    }

    /// The PTY reader hit EOF; no more output will follow.
    pub fn closed(&self) {
        let _ = self.tx.send(LoopEvent::ReaderClosed { id: self.id });
    }

    pub fn exited(&self, code: i32) {
        let _ = self.tx.send(LoopEvent::Exited { id: self.id, code });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Flush,
    Notify,
    ExitGrace,
}

/// Registered spawns still waiting for their surface geometry.
#[derive(Clone, Default)]
pub(crate) struct PendingSpawns {
    inner: Arc<Mutex<HashMap<SessionId, SpawnRequest>>>,
}

impl PendingSpawns {
    pub fn insert(&self, id: SessionId, request: SpawnRequest) {
        self.inner.lock().insert(id, request);
    }

    /// Remove and return the pending request. `None` if it was already
    /// consumed or cancelled.
    pub fn take(&self, id: &SessionId) -> Option<SpawnRequest> {
        self.inner.lock().remove(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

struct Shared {
    registry: SessionRegistry,
    pending: PendingSpawns,
    surfaces: Arc<dyn SurfaceFactory>,
    observers: Observers,
    tx: mpsc::UnboundedSender<LoopEvent>,
    cancel: CancellationToken,
    notify_interval: Duration,
}

pub struct CoordinatorBuilder {
    surfaces: Arc<dyn SurfaceFactory>,
    launcher: Option<Arc<dyn Launcher>>,
    env: Option<Arc<dyn EnvProvider>>,
    status: Arc<dyn StatusObserver>,
    output: Option<Arc<dyn OutputListener>>,
    config: PtyConfig,
}

impl CoordinatorBuilder {
    /// Defaults to a [`PtyLauncher`] built from the config.
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Defaults to a [`LoginShellEnv`] over the configured shell, or `$SHELL`.
    pub fn env(mut self, env: Arc<dyn EnvProvider>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.status = observer;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn OutputListener>) -> Self {
        self.output = Some(listener);
        self
    }

    pub fn config(mut self, config: PtyConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the coordinator and its event loop. The loop does nothing until
    /// it is run, typically with `tokio::spawn(event_loop.run())`.
    pub fn build(self) -> (Coordinator, EventLoop) {
        let config = self.config;
        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(PtyLauncher::new(
                config.shell.clone(),
                config.term.clone(),
                config.unset_env.clone(),
            ))
        });
        let env = self.env.unwrap_or_else(|| {
            Arc::new(match &config.shell {
                Some(shell) => LoginShellEnv::new(shell.clone()),
                None => LoginShellEnv::from_user_shell(),
            })
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let observers = Observers {
            status: self.status,
            output: self.output,
        };
        let registry = SessionRegistry::with_max_sessions(config.max_sessions());
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            registry: registry.clone(),
            pending: PendingSpawns::default(),
            surfaces: self.surfaces,
            observers: observers.clone(),
            tx: tx.clone(),
            cancel: cancel.clone(),
            notify_interval: config.notify_interval(),
        });

        let event_loop = EventLoop {
            registry,
            pending: shared.pending.clone(),
            observers,
            launcher,
            env,
            tx,
            rx,
            timers: DelayQueue::new(),
            cancel,
            frame_interval: config.frame_interval(),
            exit_grace: config.exit_grace(),
        };
        (Coordinator { shared }, event_loop)
    }
}

/// Caller-facing handle over all sessions.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn builder(surfaces: Arc<dyn SurfaceFactory>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            surfaces,
            launcher: None,
            env: None,
            status: Arc::new(NoopObserver),
            output: None,
            config: PtyConfig::default(),
        }
    }

    /// Register a session and its pending spawn. Nothing is launched until
    /// the surface is mounted and reports its geometry.
    pub fn spawn(&self, request: SpawnRequest) -> Result<SessionId, RegistryError> {
        let shared = &self.shared;
        let id = shared
            .registry
            .create(&request, |id| shared.surfaces.create(id))?;
        shared
            .registry
            .with_session(&id, |s| s.set_notify_interval(shared.notify_interval));
        shared.observers.status.on_register(
            id,
            &request.name,
            &request.cwd,
            request.display_context.as_deref(),
        );
        tracing::info!(session = %id, name = %request.name, cwd = %request.cwd.display(), "session registered");
        shared.pending.insert(id, request);
        Ok(id)
    }

    /// Mount the session's surface into `container`. Launches the pending
    /// process if the surface now knows its geometry. Returns `false` for
    /// unknown sessions.
    pub fn mount(&self, id: SessionId, container: &ContainerHandle) -> bool {
        let shared = &self.shared;
        let accelerator = shared.surfaces.accelerator();
        let is_active = shared.registry.active() == Some(id);
        let geometry = shared.registry.with_session(&id, |s| {
            let surface = s.surface_mut();
            surface.mount(container, accelerator);
            if is_active {
                surface.focus();
            }
            surface.geometry()
        });
        match geometry {
            None => false,
            Some(geometry) => {
                if let Some(geometry) = geometry {
                    self.request_launch(id, geometry);
                }
                true
            }
        }
    }

    /// Resize the surface and, once attached, the PTY. The first real
    /// geometry also releases a pending launch.
    pub fn resize(&self, id: SessionId, geometry: Geometry) -> bool {
        let found = self
            .shared
            .registry
            .with_session(&id, |s| s.resize(geometry))
            .is_some();
        if found {
            self.request_launch(id, geometry);
        }
        found
    }

    fn request_launch(&self, id: SessionId, geometry: Geometry) {
        if !self.shared.pending.contains(&id) {
            return;
        }
        if self.shared.tx.send(LoopEvent::Launch { id, geometry }).is_err() {
            tracing::warn!(session = %id, "event loop is not running, launch dropped");
        }
    }

    /// Send input to the session's process. A session whose process has not
    /// started yet, or has exited, drops it.
    pub fn write(&self, id: SessionId, data: &[u8]) -> bool {
        self.shared
            .registry
            .with_session(&id, |s| s.write_input(data))
            .is_some()
    }

    /// Kill the process, dispose the surface, and forget the session, without
    /// waiting for the OS. Returns `false` if the session was already gone.
    pub fn kill(&self, id: SessionId) -> bool {
        let was_pending = self.shared.pending.take(&id).is_some();
        match self.shared.registry.remove(&id) {
            Some(removed) => {
                tracing::info!(session = %id, was_pending, "session killed");
                self.shared.observers.removed(&removed);
                true
            }
            None => false,
        }
    }

    pub fn set_active(&self, id: Option<SessionId>) -> Result<(), RegistryError> {
        self.shared.registry.set_active(id)
    }

    pub fn active(&self) -> Option<SessionId> {
        self.shared.registry.active()
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.shared.registry.get(&id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.shared.registry.list()
    }

    /// Whether the session is still waiting for its process to be launched.
    pub fn is_spawning(&self, id: SessionId) -> bool {
        self.shared.pending.contains(&id)
    }

    pub fn pending_spawns(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn bulk(&self) -> BulkController {
        BulkController::new(
            self.shared.registry.clone(),
            self.shared.pending.clone(),
            self.shared.observers.clone(),
        )
    }

    pub fn kill_all(&self) -> usize {
        self.bulk().kill_all()
    }

    /// Kill every session and stop the event loop.
    pub fn shutdown(&self) {
        let killed = self.kill_all();
        tracing::info!(killed, "shutting down");
        self.shared.cancel.cancel();
    }
}

enum Step {
    Event(LoopEvent),
    Timer(SessionId, Timer),
    Stop,
}

/// Single task that applies PTY events and fires timers. Runs until
/// [`Coordinator::shutdown`].
pub struct EventLoop {
    registry: SessionRegistry,
    pending: PendingSpawns,
    observers: Observers,
    launcher: Arc<dyn Launcher>,
    env: Arc<dyn EnvProvider>,
    tx: mpsc::UnboundedSender<LoopEvent>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    timers: DelayQueue<(SessionId, Timer)>,
    cancel: CancellationToken,
    frame_interval: Duration,
    exit_grace: Duration,
}

impl EventLoop {
    pub async fn run(mut self) {
        tracing::debug!("event loop started");
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Stop,
                event = self.rx.recv() => match event {
                    Some(event) => Step::Event(event),
                    None => Step::Stop,
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let (id, timer) = expired.into_inner();
                    Step::Timer(id, timer)
                }
            };
            match step {
                Step::Event(event) => self.handle_event(event),
                Step::Timer(id, timer) => self.handle_timer(id, timer),
                Step::Stop => break,
            }
        }
        self.drain_on_stop();
        tracing::debug!("event loop stopped");
    }

    /// Close the channel and kill whatever finished launching in the
    /// meantime. Launches still running see the closed channel and kill
    /// their own process.
    fn drain_on_stop(&mut self) {
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            if let LoopEvent::Spawned { id, result: Ok(mut handle) } = event {
                tracing::debug!(session = %id, pid = ?handle.pid(), "killing process launched during shutdown");
                handle.kill();
            }
        }
    }

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Launch { id, geometry } => self.launch(id, geometry),
            LoopEvent::Spawned { id, result } => self.spawned(id, result),
            LoopEvent::Output { id, data } => self.output(id, data),
            LoopEvent::ReaderClosed { id } => {
                let ready = self.registry.with_session(&id, |s| {
                    s.exit.reader_closed = true;
                    s.exit.code.is_some()
                });
                if ready == Some(true) {
                    self.finalize(id);
                }
            }
            LoopEvent::Exited { id, code } => {
                tracing::debug!(session = %id, code, "process exited");
                let state = self.registry.with_session(&id, |s| {
                    s.exit.code = Some(code);
                    let arm = !s.exit.reader_closed && !s.exit.grace_armed;
                    s.exit.grace_armed |= arm;
                    (s.exit.reader_closed, arm)
                });
                match state {
                    Some((true, _)) => self.finalize(id),
                    Some((false, true)) => {
                        self.timers.insert((id, Timer::ExitGrace), self.exit_grace);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Consume the pending spawn and start the process off the loop.
    fn launch(&mut self, id: SessionId, geometry: Geometry) {
        let Some(request) = self.pending.take(&id) else {
            return;
        };
        tracing::debug!(session = %id, %geometry, command = %request.command, "launching");
        let launcher = self.launcher.clone();
        let env = self.env.clone();
        let tx = self.tx.clone();
        let events = ProcessEvents {
            id,
            tx: self.tx.clone(),
        };
        tokio::task::spawn_blocking(move || {
            let result = env
                .shell_env()
                .map_err(SpawnError::from)
                .and_then(|env| launcher.launch(&request, geometry, env, events));
            if let Err(mpsc::error::SendError(LoopEvent::Spawned { result: Ok(mut handle), .. })) =
                tx.send(LoopEvent::Spawned { id, result })
            {
                tracing::debug!(session = %id, pid = ?handle.pid(), "event loop gone, killing launched process");
                handle.kill();
            }
        });
    }

    fn spawned(&mut self, id: SessionId, result: Result<Box<dyn ProcessHandle>, SpawnError>) {
        match result {
            Ok(handle) => {
                let pid = handle.pid();
                match self.registry.attach(&id, handle) {
                    Ok(()) => tracing::info!(session = %id, ?pid, "process attached"),
                    Err(RegistryError::NotFound(_)) => {
                        tracing::debug!(session = %id, ?pid, "session removed while spawning, process killed")
                    }
                    Err(e) => tracing::error!(session = %id, error = %e, "failed to attach process"),
                }
            }
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "spawn failed");
                let trailer = spawn_failure_trailer(&err);
                let observers = &self.observers;
                self.registry.with_session(&id, |s| {
                    s.surface_mut().write(&trailer);
                    if s.finish(SessionStatus::Failed, None) {
                        observers.status_changed(id, SessionStatus::Failed, None);
                    }
                });
            }
        }
    }

    fn output(&mut self, id: SessionId, data: Bytes) {
        let now = Instant::now();
        let notify = self.observers.output.is_some();
        let outcome = self.registry.with_session(&id, |s| {
            if s.status().is_terminal() {
                return None;
            }
            let schedule_flush = s.output.push(&data);
            let decision = notify.then(|| s.notify.call(now, String::from_utf8_lossy(&data).into_owned()));
            Some((schedule_flush, decision))
        });
        let Some(Some((schedule_flush, decision))) = outcome else {
            tracing::trace!(session = %id, bytes = data.len(), "dropping late output");
            return;
        };
        if schedule_flush {
            self.timers.insert((id, Timer::Flush), self.frame_interval);
        }
        match decision {
            Some(ThrottleDecision::Deliver(text)) => self.deliver(id, &text),
            Some(ThrottleDecision::Schedule(delay)) => {
                self.timers.insert((id, Timer::Notify), delay);
            }
            Some(ThrottleDecision::Coalesced) | None => {}
        }
    }

    fn deliver(&self, id: SessionId, text: &str) {
        if let Some(listener) = &self.observers.output {
            listener.on_output(id, text);
        }
    }

    fn handle_timer(&mut self, id: SessionId, timer: Timer) {
        match timer {
            Timer::Flush => {
                self.registry.with_session(&id, |s| {
                    if let Some(text) = s.output.take() {
                        s.surface_mut().write(&text);
                    }
                });
            }
            Timer::Notify => {
                let now = Instant::now();
                let payload = self.registry.with_session(&id, |s| s.notify.fire(now)).flatten();
                if let Some(text) = payload {
                    self.deliver(id, &text);
                }
            }
            Timer::ExitGrace => {
                tracing::debug!(session = %id, "pty still open after exit, finalizing");
                self.finalize(id);
            }
        }
    }

    /// Flush what is left, write the exit trailer, and publish the final
    /// status. Runs at most once per session.
    ///
    /// The status is published under the registry lock, so a concurrent
    /// kill either sees the finished session or removes it before it can
    /// finish.
    fn finalize(&mut self, id: SessionId) {
        let observers = &self.observers;
        self.registry.with_session(&id, |s| {
            if let Some((status, code)) = finish_exited(s) {
                observers.status_changed(id, status, Some(code));
            }
        });
    }
}

fn finish_exited(session: &mut Session) -> Option<(SessionStatus, i32)> {
    if session.status().is_terminal() {
        return None;
    }
    let code = session.exit.code?;
    if let Some(rest) = session.output.take_all() {
        session.surface_mut().write(&rest);
    }
    session.surface_mut().write(&exit_trailer(code));
    let status = SessionStatus::from_exit_code(code);
    session.finish(status, Some(code)).then_some((status, code))
}
