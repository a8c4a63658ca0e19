use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::VOLTA_RECURSION_GUARD;
use crate::session::SessionRegistry;
use crate::surface::Geometry;

/// Runtime settings, loaded from TOML. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Login shell used to wrap commands. `$SHELL` when unset.
    pub shell: Option<String>,
    /// `TERM` for spawned processes.
    pub term: String,
    /// Render flush cadence.
    pub frame_interval_ms: u64,
    /// Window of the throttled output notification.
    pub notify_interval_ms: u64,
    /// How long to wait for the PTY to drain after the child exits.
    pub exit_grace_ms: u64,
    /// Scrollback lines kept by headless surfaces.
    pub scrollback: usize,
    /// Session cap. 0 disables it.
    pub max_sessions: usize,
    /// Variables unset in every launched command.
    pub unset_env: Vec<String>,
    /// Geometry used when the surface cannot report one.
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: None,
            term: "xterm-256color".to_string(),
            frame_interval_ms: 16,
            notify_interval_ms: 100,
            exit_grace_ms: 250,
            scrollback: 10_000,
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
            unset_env: vec![VOLTA_RECURSION_GUARD.to_string()],
            cols: 80,
            rows: 24,
        }
    }
}

impl PtyConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, or from the default location when `None`. A missing
    /// file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid("frame_interval_ms must be positive".into()));
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(ConfigError::Invalid("cols and rows must be positive".into()));
        }
        if self.term.is_empty() {
            return Err(ConfigError::Invalid("term must not be empty".into()));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn max_sessions(&self) -> Option<usize> {
        (self.max_sessions > 0).then_some(self.max_sessions)
    }

    pub fn fallback_geometry(&self) -> Geometry {
        Geometry::new(self.cols, self.rows)
    }
}

/// `$XDG_CONFIG_HOME/ptyhub/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ptyhub").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
