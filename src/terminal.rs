use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

use crate::surface::Geometry;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
///
/// Raw mode is needed so keystrokes (including Ctrl+C) reach the session's
/// PTY instead of being handled by the local terminal.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current size of the local terminal, if stdout is attached to one.
pub fn terminal_size() -> Option<Geometry> {
    let (cols, rows) = size().ok()?;
    if cols == 0 || rows == 0 {
        return None;
    }
    Some(Geometry::new(cols, rows))
}
