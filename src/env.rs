//! Environment providers for launched processes.
//!
//! A GUI-launched host process usually has a minimal environment; tools like
//! version managers only show up in `PATH` after the user's login profile has
//! run. [`LoginShellEnv`] captures that environment once and reuses it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("failed to run {shell}: {source}")]
    Launch {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{shell} exited with {status} while printing its environment")]
    ShellFailed { shell: String, status: String },
}

/// Supplies the environment map a spawned process starts with.
pub trait EnvProvider: Send + Sync {
    fn shell_env(&self) -> Result<HashMap<String, String>, EnvError>;

    /// The login shell the environment is captured from, if any.
    fn login_shell(&self) -> Option<&str> {
        None
    }
}

/// The current process environment, as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct InheritedEnv;

impl EnvProvider for InheritedEnv {
    fn shell_env(&self) -> Result<HashMap<String, String>, EnvError> {
        Ok(std::env::vars().collect())
    }
}

/// Environment of an interactive login shell, captured with
/// `<shell> -l -c env` on first use and cached.
#[derive(Debug)]
pub struct LoginShellEnv {
    shell: String,
    home: Option<PathBuf>,
    cache: Mutex<Option<HashMap<String, String>>>,
}

impl LoginShellEnv {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            home: None,
            cache: Mutex::new(None),
        }
    }

    /// Run the capture with `HOME` set to `dir`, so the profile found there
    /// is the one sourced.
    pub fn home(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home = Some(dir.into());
        self
    }

    /// Use `$SHELL`, falling back to `/bin/sh`.
    pub fn from_user_shell() -> Self {
        Self::new(std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()))
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    fn capture(&self) -> Result<HashMap<String, String>, EnvError> {
        let mut command = Command::new(&self.shell);
        command
            .args(["-l", "-c", "env"])
            .stdin(Stdio::null())
            .stderr(Stdio::null());
        if let Some(home) = &self.home {
            command.env("HOME", home);
        }
        let output = command
            .output()
            .map_err(|source| EnvError::Launch {
                shell: self.shell.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(EnvError::ShellFailed {
                shell: self.shell.clone(),
                status: output.status.to_string(),
            });
        }
        Ok(parse_env_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl EnvProvider for LoginShellEnv {
    fn shell_env(&self) -> Result<HashMap<String, String>, EnvError> {
        let mut cache = self.cache.lock();
        if let Some(env) = cache.as_ref() {
            return Ok(env.clone());
        }
        let env = self.capture()?;
        tracing::debug!(shell = %self.shell, vars = env.len(), "captured login shell environment");
        *cache = Some(env.clone());
        Ok(env)
    }

    fn login_shell(&self) -> Option<&str> {
        Some(&self.shell)
    }
}

/// Parse `env` output. Lines without `=` continue the previous value
/// (multi-line values such as exported shell functions).
pub fn parse_env_output(output: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let mut last: Option<String> = None;
    for line in output.lines() {
        match line.split_once('=') {
            Some((key, value)) if is_var_name(key) => {
                env.insert(key.to_string(), value.to_string());
                last = Some(key.to_string());
            }
            _ => {
                if let Some(value) = last.as_ref().and_then(|k| env.get_mut(k)) {
                    value.push('\n');
                    value.push_str(line);
                }
            }
        }
    }
    env
}

fn is_var_name(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}
