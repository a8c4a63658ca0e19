use std::io::Write;

use super::{ContainerHandle, Geometry, RenderSurface, SurfaceFactory};
use crate::session::SessionId;
use crate::terminal::terminal_size;

/// Passes session output straight through to the local terminal.
///
/// Used by the CLI, where the local terminal emulator is the renderer.
pub struct StdoutSurface {
    fallback: Geometry,
    geometry: Option<Geometry>,
    disposed: bool,
}

impl StdoutSurface {
    pub fn new(fallback: Geometry) -> Self {
        Self {
            fallback,
            geometry: None,
            disposed: false,
        }
    }
}

impl RenderSurface for StdoutSurface {
    fn open(&mut self, _container: &ContainerHandle) {
        self.geometry = Some(terminal_size().unwrap_or(self.fallback));
    }

    fn write(&mut self, text: &str) {
        if self.disposed {
            return;
        }
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            tracing::debug!(?e, "stdout write failed");
        }
    }

    fn focus(&mut self) {}

    fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    fn resize(&mut self, geometry: Geometry) {
        self.geometry = Some(geometry);
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }
}

pub struct StdoutSurfaceFactory {
    fallback: Geometry,
}

impl StdoutSurfaceFactory {
    pub fn new(fallback: Geometry) -> Self {
        Self { fallback }
    }
}

impl SurfaceFactory for StdoutSurfaceFactory {
    fn create(&self, _id: &SessionId) -> Box<dyn RenderSurface> {
        Box::new(StdoutSurface::new(self.fallback))
    }
}
