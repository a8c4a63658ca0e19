//! The render-surface seam.
//!
//! A surface is whatever draws a session's terminal output: a terminal widget
//! in a UI, a headless emulator, or the local terminal. The core only ever
//! writes text into it, asks for its geometry, focuses it, and disposes it.

mod stdout;
mod vt;

pub use stdout::{StdoutSurface, StdoutSurfaceFactory};
pub use vt::{VtSurface, VtSurfaceFactory};

use thiserror::Error;

use crate::session::SessionId;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Opaque reference to where a surface gets mounted (a pane, a DOM node...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Error, Debug)]
pub enum AddonError {
    #[error("{addon} is not supported by this surface")]
    Unsupported { addon: String },

    #[error("{addon} failed to initialize: {reason}")]
    InitFailed { addon: String, reason: String },
}

/// A terminal display that session output is written into.
pub trait RenderSurface: Send {
    /// Attach the surface to its container. Geometry is usually unknown until
    /// this has happened.
    fn open(&mut self, container: &ContainerHandle);

    fn write(&mut self, text: &str);

    fn focus(&mut self);

    /// Real geometry of the mounted surface, or `None` if it has not been
    /// laid out yet.
    fn geometry(&self) -> Option<Geometry>;

    fn resize(&mut self, geometry: Geometry);

    /// Release the terminal buffer. Called exactly once, after all addons
    /// have been disposed.
    fn dispose(&mut self);
}

/// Optional rendering capability (e.g. GPU acceleration) loaded onto a
/// surface after it is opened.
pub trait RenderAddon: Send {
    fn name(&self) -> &str;

    fn activate(&mut self, surface: &mut dyn RenderSurface) -> Result<(), AddonError>;

    fn dispose(&mut self);
}

/// Creates one surface per session.
pub trait SurfaceFactory: Send + Sync {
    fn create(&self, id: &SessionId) -> Box<dyn RenderSurface>;

    /// An acceleration addon to try on every newly mounted surface.
    fn accelerator(&self) -> Option<Box<dyn RenderAddon>> {
        None
    }
}

/// A session's surface together with the addons loaded on it.
///
/// Owns the release order: addons are disposed in reverse load order, then
/// the surface itself. Writes after disposal are dropped.
pub struct SurfaceSlot {
    id: SessionId,
    surface: Box<dyn RenderSurface>,
    addons: Vec<Box<dyn RenderAddon>>,
    mounted: bool,
    disposed: bool,
}

impl SurfaceSlot {
    pub fn new(id: SessionId, surface: Box<dyn RenderSurface>) -> Self {
        Self {
            id,
            surface,
            addons: Vec::new(),
            mounted: false,
            disposed: false,
        }
    }

    /// Open the surface in `container` and try the optional accelerator.
    ///
    /// An accelerator that fails to activate is dropped and the surface keeps
    /// its baseline renderer.
    pub fn mount(&mut self, container: &ContainerHandle, accelerator: Option<Box<dyn RenderAddon>>) {
        if self.disposed {
            return;
        }
        if !self.mounted {
            self.surface.open(container);
            self.mounted = true;
        }
        if let Some(mut addon) = accelerator {
            match addon.activate(self.surface.as_mut()) {
                Ok(()) => {
                    tracing::debug!(session = %self.id, addon = addon.name(), "render addon active");
                    self.addons.push(addon);
                }
                Err(e) => {
                    tracing::warn!(session = %self.id, error = %e, "render addon unavailable, using baseline renderer");
                    addon.dispose();
                }
            }
        }
    }

    pub fn write(&mut self, text: &str) {
        if self.disposed || text.is_empty() {
            return;
        }
        self.surface.write(text);
    }

    pub fn focus(&mut self) {
        if self.mounted && !self.disposed {
            self.surface.focus();
        }
    }

    pub fn geometry(&self) -> Option<Geometry> {
        if self.disposed {
            return None;
        }
        self.surface.geometry()
    }

    pub fn resize(&mut self, geometry: Geometry) {
        if !self.disposed {
            self.surface.resize(geometry);
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn is_accelerated(&self) -> bool {
        !self.addons.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        while let Some(mut addon) = self.addons.pop() {
            addon.dispose();
        }
        self.surface.dispose();
        self.disposed = true;
    }
}
