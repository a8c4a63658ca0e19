#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ptyhub::env::InheritedEnv;
use ptyhub::lifecycle::{Coordinator, ProcessEvents};
use ptyhub::observer::{OutputListener, StatusObserver};
use ptyhub::pty::{Launcher, ProcessHandle, SpawnError};
use ptyhub::session::{SessionId, SessionStatus, SpawnRequest};
use ptyhub::surface::{AddonError, ContainerHandle, Geometry, RenderAddon, RenderSurface, SurfaceFactory};
use ptyhub::PtyConfig;
use tokio::time::Instant;

// ── Observer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    Register { id: SessionId, name: String },
    Status { id: SessionId, status: SessionStatus, code: Option<i32> },
    Remove { id: SessionId },
}

/// Records every status observer call in order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self, id: SessionId) -> Vec<(SessionStatus, Option<i32>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::Status { id: sid, status, code } if *sid == id => Some((*status, *code)),
                _ => None,
            })
            .collect()
    }

    pub fn removes(&self, id: SessionId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ObserverEvent::Remove { id: sid } if *sid == id))
            .count()
    }
}

impl StatusObserver for RecordingObserver {
    fn on_register(&self, id: SessionId, name: &str, _cwd: &Path, _display_context: Option<&str>) {
        self.events.lock().push(ObserverEvent::Register {
            id,
            name: name.to_string(),
        });
    }

    fn on_status_change(&self, id: SessionId, status: SessionStatus, exit_code: Option<i32>) {
        self.events.lock().push(ObserverEvent::Status {
            id,
            status,
            code: exit_code,
        });
    }

    fn on_remove(&self, id: SessionId) {
        self.events.lock().push(ObserverEvent::Remove { id });
    }
}

/// Records throttled output deliveries and when they happened.
#[derive(Default)]
pub struct RecordingListener {
    outputs: Mutex<Vec<(SessionId, String, Instant)>>,
    removed: Mutex<Vec<SessionId>>,
}

impl RecordingListener {
    pub fn outputs(&self, id: SessionId) -> Vec<String> {
        self.deliveries(id).into_iter().map(|(text, _)| text).collect()
    }

    pub fn deliveries(&self, id: SessionId) -> Vec<(String, Instant)> {
        self.outputs
            .lock()
            .iter()
            .filter(|(sid, _, _)| *sid == id)
            .map(|(_, text, at)| (text.clone(), *at))
            .collect()
    }

    pub fn removed(&self) -> Vec<SessionId> {
        self.removed.lock().clone()
    }
}

impl OutputListener for RecordingListener {
    fn on_output(&self, id: SessionId, text: &str) {
        self.outputs.lock().push((id, text.to_string(), Instant::now()));
    }

    fn on_session_removed(&self, id: SessionId) {
        self.removed.lock().push(id);
    }
}

// ── Surfaces ────────────────────────────────────────────────────────

#[derive(Default)]
struct SurfaceState {
    writes: Vec<String>,
    log: Vec<String>,
    geometry: Option<Geometry>,
}

/// Surface that records writes and calls. Reports its geometry after
/// `open` only when created `sized`; otherwise only after a resize.
#[derive(Clone)]
pub struct RecordingSurface {
    state: Arc<Mutex<SurfaceState>>,
    sized: Option<Geometry>,
}

impl RecordingSurface {
    pub fn text(&self) -> String {
        self.state.lock().writes.concat()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

impl RenderSurface for RecordingSurface {
    fn open(&mut self, container: &ContainerHandle) {
        let mut state = self.state.lock();
        state.log.push(format!("open:{}", container.as_str()));
        if let Some(geometry) = self.sized {
            state.geometry = Some(geometry);
        }
    }

    fn write(&mut self, text: &str) {
        self.state.lock().writes.push(text.to_string());
    }

    fn focus(&mut self) {
        self.state.lock().log.push("focus".into());
    }

    fn geometry(&self) -> Option<Geometry> {
        self.state.lock().geometry
    }

    fn resize(&mut self, geometry: Geometry) {
        let mut state = self.state.lock();
        state.log.push(format!("resize:{geometry}"));
        state.geometry = Some(geometry);
    }

    fn dispose(&mut self) {
        self.state.lock().log.push("dispose:surface".into());
    }
}

pub struct TestAddon {
    fail: bool,
    log: Arc<Mutex<SurfaceState>>,
}

impl RenderAddon for TestAddon {
    fn name(&self) -> &str {
        "gpu"
    }

    fn activate(&mut self, _surface: &mut dyn RenderSurface) -> Result<(), AddonError> {
        if self.fail {
            return Err(AddonError::InitFailed {
                addon: "gpu".into(),
                reason: "context lost".into(),
            });
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.log.lock().log.push("dispose:gpu".into());
    }
}

/// Which accelerator, if any, the factory offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    None,
    Working,
    Broken,
}

pub struct RecordingSurfaceFactory {
    sized: Option<Geometry>,
    accel: Accel,
    surfaces: Mutex<HashMap<SessionId, RecordingSurface>>,
    /// State of the most recently created surface, for the addon.
    last: Mutex<Option<Arc<Mutex<SurfaceState>>>>,
}

impl RecordingSurfaceFactory {
    /// Surfaces that report 80x24 as soon as they are opened.
    pub fn sized() -> Arc<Self> {
        Self::build(Some(Geometry::default()), Accel::None)
    }

    /// Surfaces that only learn their geometry from a resize.
    pub fn r#unsized() -> Arc<Self> {
        Self::build(None, Accel::None)
    }

    pub fn with_accelerator(accel: Accel) -> Arc<Self> {
        Self::build(Some(Geometry::default()), accel)
    }

    fn build(sized: Option<Geometry>, accel: Accel) -> Arc<Self> {
        Arc::new(Self {
            sized,
            accel,
            surfaces: Mutex::new(HashMap::new()),
            last: Mutex::new(None),
        })
    }

    pub fn surface(&self, id: SessionId) -> RecordingSurface {
        self.surfaces
            .lock()
            .get(&id)
            .cloned()
            .expect("surface should have been created")
    }
}

impl SurfaceFactory for RecordingSurfaceFactory {
    fn create(&self, id: &SessionId) -> Box<dyn RenderSurface> {
        let surface = RecordingSurface {
            state: Arc::new(Mutex::new(SurfaceState::default())),
            sized: self.sized,
        };
        *self.last.lock() = Some(surface.state.clone());
        self.surfaces.lock().insert(*id, surface.clone());
        Box::new(surface)
    }

    fn accelerator(&self) -> Option<Box<dyn RenderAddon>> {
        let log = self.last.lock().clone()?;
        match self.accel {
            Accel::None => None,
            Accel::Working => Some(Box::new(TestAddon { fail: false, log })),
            Accel::Broken => Some(Box::new(TestAddon { fail: true, log })),
        }
    }
}

// ── Launcher ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeProcessState {
    pub input: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<Geometry>>,
    pub kills: AtomicUsize,
}

impl FakeProcessState {
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().clone()
    }
}

struct FakeProcess(Arc<FakeProcessState>);

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(1)
    }

    fn write(&self, data: &[u8]) {
        self.0.input.lock().extend_from_slice(data);
    }

    fn resize(&self, geometry: Geometry) {
        self.0.resizes.lock().push(geometry);
    }

    fn kill(&mut self) {
        self.0.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// A launched fake: the test drives output and exit through `events`.
#[derive(Clone)]
pub struct FakeRun {
    pub request: SpawnRequest,
    pub geometry: Geometry,
    pub events: ProcessEvents,
    pub process: Arc<FakeProcessState>,
}

/// Launcher that starts nothing. Each launch is recorded so the test can
/// play the process's part.
#[derive(Default)]
pub struct FakeLauncher {
    runs: Mutex<HashMap<SessionId, FakeRun>>,
    launches: AtomicUsize,
    fail_next: Mutex<Option<SpawnError>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, err: SpawnError) {
        *self.fail_next.lock() = Some(err);
    }

    /// Block every following launch for `delay` before it returns.
    pub fn delay_launches(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn run(&self, id: SessionId) -> Option<FakeRun> {
        self.runs.lock().get(&id).cloned()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        request: &SpawnRequest,
        geometry: Geometry,
        _env: HashMap<String, String>,
        events: ProcessEvents,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        let process = Arc::new(FakeProcessState::default());
        self.runs.lock().insert(
            events.id(),
            FakeRun {
                request: request.clone(),
                geometry,
                events,
                process: process.clone(),
            },
        );
        Ok(Box::new(FakeProcess(process)))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub coordinator: Coordinator,
    pub surfaces: Arc<RecordingSurfaceFactory>,
    pub launcher: Arc<FakeLauncher>,
    pub observer: Arc<RecordingObserver>,
    pub listener: Arc<RecordingListener>,
    pub event_loop: tokio::task::JoinHandle<()>,
}

impl Harness {
    pub fn new(surfaces: Arc<RecordingSurfaceFactory>) -> Self {
        Self::with_config(surfaces, PtyConfig::default())
    }

    pub fn with_config(surfaces: Arc<RecordingSurfaceFactory>, config: PtyConfig) -> Self {
        let launcher = FakeLauncher::new();
        let observer = Arc::new(RecordingObserver::default());
        let listener = Arc::new(RecordingListener::default());
        let (coordinator, event_loop) = Coordinator::builder(surfaces.clone())
            .launcher(launcher.clone())
            .env(Arc::new(InheritedEnv))
            .observer(observer.clone())
            .listener(listener.clone())
            .config(config)
            .build();
        Self {
            coordinator,
            surfaces,
            launcher,
            observer,
            listener,
            event_loop: tokio::spawn(event_loop.run()),
        }
    }

    /// Spawn and mount a session, then wait for the fake launch.
    pub async fn start(&self, command: &str) -> (SessionId, FakeRun) {
        let id = self
            .coordinator
            .spawn(SpawnRequest::new(command, "/tmp"))
            .expect("spawn should register");
        assert!(self.coordinator.mount(id, &ContainerHandle::new("pane")));
        let launcher = self.launcher.clone();
        wait_until(|| launcher.run(id).is_some()).await;
        let run = self.launcher.run(id).expect("launched");
        wait_until(|| self.coordinator.get(id).is_some_and(|s| s.attached)).await;
        (id, run)
    }

    pub async fn wait_status(&self, id: SessionId, status: SessionStatus) {
        wait_until(|| self.coordinator.get(id).is_some_and(|s| s.status == status)).await;
    }
}

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Let the event loop drain what is queued without moving a paused clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Poll `cond` every few milliseconds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", WAIT_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
