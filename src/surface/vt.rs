use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{ContainerHandle, Geometry, RenderSurface, SurfaceFactory};
use crate::session::SessionId;

struct VtState {
    /// Dropped on dispose.
    vt: Option<avt::Vt>,
    geometry: Geometry,
    container: Option<ContainerHandle>,
    focused: bool,
    disposed: bool,
    writes: usize,
}

/// Headless surface backed by the `avt` terminal emulator.
///
/// Clones share the same buffer, so a caller can keep a clone around to read
/// the screen after the session has written into it.
#[derive(Clone)]
pub struct VtSurface {
    state: Arc<Mutex<VtState>>,
}

impl VtSurface {
    pub fn new(geometry: Geometry, scrollback: usize) -> Self {
        let vt = avt::Vt::builder()
            .size(geometry.cols as usize, geometry.rows as usize)
            .scrollback_limit(scrollback)
            .build();
        Self {
            state: Arc::new(Mutex::new(VtState {
                vt: Some(vt),
                geometry,
                container: None,
                focused: false,
                disposed: false,
                writes: 0,
            })),
        }
    }

    /// Plain text of scrollback plus screen, one line per row, with trailing
    /// blank lines removed. Empty once disposed.
    pub fn text(&self) -> String {
        let state = self.state.lock();
        let Some(vt) = state.vt.as_ref() else {
            return String::new();
        };
        let mut lines: Vec<String> = vt.lines().map(|l| l.text().trim_end().to_string()).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    /// Number of `write` calls received, i.e. the number of flushes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn is_focused(&self) -> bool {
        self.state.lock().focused
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl RenderSurface for VtSurface {
    fn open(&mut self, container: &ContainerHandle) {
        self.state.lock().container = Some(container.clone());
    }

    fn write(&mut self, text: &str) {
        let mut state = self.state.lock();
        let Some(vt) = state.vt.as_mut() else {
            return;
        };
        let _ = vt.feed_str(text);
        state.writes += 1;
    }

    fn focus(&mut self) {
        self.state.lock().focused = true;
    }

    fn geometry(&self) -> Option<Geometry> {
        let state = self.state.lock();
        state.container.as_ref().map(|_| state.geometry)
    }

    fn resize(&mut self, geometry: Geometry) {
        let mut state = self.state.lock();
        if state.geometry == geometry {
            return;
        }
        if let Some(vt) = state.vt.as_mut() {
            let _ = vt.resize(geometry.cols as usize, geometry.rows as usize);
        }
        state.geometry = geometry;
    }

    fn dispose(&mut self) {
        let mut state = self.state.lock();
        state.vt = None;
        state.disposed = true;
        state.focused = false;
    }
}

/// Creates a [`VtSurface`] per session and keeps a weak handle to each so
/// output can be inspected by id while the session holds its surface.
pub struct VtSurfaceFactory {
    geometry: Geometry,
    scrollback: usize,
    surfaces: Mutex<HashMap<SessionId, Weak<Mutex<VtState>>>>,
}

impl VtSurfaceFactory {
    pub fn new(geometry: Geometry, scrollback: usize) -> Self {
        Self {
            geometry,
            scrollback,
            surfaces: Mutex::new(HashMap::new()),
        }
    }

    /// The live surface of `id`. `None` once its session dropped it.
    pub fn surface(&self, id: &SessionId) -> Option<VtSurface> {
        let state = self.surfaces.lock().get(id)?.upgrade()?;
        Some(VtSurface { state })
    }

    /// Number of surfaces still held by a session.
    pub fn live(&self) -> usize {
        self.surfaces
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl SurfaceFactory for VtSurfaceFactory {
    fn create(&self, id: &SessionId) -> Box<dyn RenderSurface> {
        let surface = VtSurface::new(self.geometry, self.scrollback);
        let mut surfaces = self.surfaces.lock();
        surfaces.retain(|_, w| w.strong_count() > 0);
        surfaces.insert(*id, Arc::downgrade(&surface.state));
        Box::new(surface)
    }
}
