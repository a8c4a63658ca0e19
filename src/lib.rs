pub mod bulk;
pub mod config;
pub mod env;
pub mod lifecycle;
pub mod observer;
pub mod ports;
pub mod pty;
pub mod pump;
pub mod session;
pub mod surface;
pub mod terminal;

pub use bulk::BulkController;
pub use config::PtyConfig;
pub use lifecycle::{Coordinator, CoordinatorBuilder, EventLoop, ProcessEvents};
pub use observer::{ExecutionTracker, OutputListener, StatusObserver};
pub use pty::{Launcher, ProcessHandle, PtyLauncher, SpawnError};
pub use session::{RegistryError, SessionId, SessionInfo, SessionRegistry, SessionStatus, SpawnRequest};
pub use surface::{ContainerHandle, Geometry, RenderAddon, RenderSurface, SurfaceFactory};
