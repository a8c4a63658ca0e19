//! Process launcher: runs a command inside a login shell attached to a PTY.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::lifecycle::ProcessEvents;
use crate::session::SpawnRequest;
use crate::surface::Geometry;

/// Recursion guard set by Volta's shims. Must not leak into launched commands.
pub const VOLTA_RECURSION_GUARD: &str = "_VOLTA_TOOL_RECURSION";

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("login shell not found: {0}")]
    ShellNotFound(String),

    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirectory(PathBuf),

    #[error("environment lookup failed: {0}")]
    Environment(#[from] crate::env::EnvError),

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to start pty thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Control surface of a running child process.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Send input. Silently dropped once the process has exited.
    fn write(&self, data: &[u8]);

    fn resize(&self, geometry: Geometry);

    /// Terminate the process. Does not wait for it to go away.
    fn kill(&mut self);
}

/// Starts processes for sessions.
///
/// Implementations report output, reader closure, and exit through `events`
/// from whatever threads they like; the event loop serializes them.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        request: &SpawnRequest,
        geometry: Geometry,
        env: HashMap<String, String>,
        events: ProcessEvents,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}

/// Single-quote `s` for a POSIX shell: `it's` → `'it'\''s'`.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// The `-c` script for the login shell: unset the guard variables, then
/// `exec` the quoted command line.
pub fn login_script(command: &str, args: &[String], unset_env: &[String]) -> String {
    let mut script = String::new();
    for var in unset_env.iter().filter(|v| is_env_name(v)) {
        script.push_str("unset ");
        script.push_str(var);
        script.push_str("; ");
    }
    script.push_str("exec ");
    script.push_str(&shell_quote(command));
    for arg in args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script
}

/// Full argv of the wrapped invocation: `<shell> -l -c '<script>'`.
pub fn wrapped_command_line(shell: &str, command: &str, args: &[String], unset_env: &[String]) -> Vec<String> {
    vec![
        shell.to_string(),
        "-l".to_string(),
        "-c".to_string(),
        login_script(command, args, unset_env),
    ]
}

/// Resolve `program` the way the shell would, against `path` and relative to `cwd`.
fn resolve(program: &str, path: &str, cwd: &Path) -> Option<PathBuf> {
    which::which_in(program, Some(path), cwd).ok()
}

/// Launches through `<shell> -l -c 'exec ...'` on a native PTY.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    shell: Option<String>,
    term: String,
    unset_env: Vec<String>,
}

impl Default for PtyLauncher {
    fn default() -> Self {
        Self {
            shell: None,
            term: "xterm-256color".to_string(),
            unset_env: vec![VOLTA_RECURSION_GUARD.to_string()],
        }
    }
}

impl PtyLauncher {
    pub fn new(shell: Option<String>, term: impl Into<String>, unset_env: Vec<String>) -> Self {
        Self {
            shell,
            term: term.into(),
            unset_env,
        }
    }

    /// Configured shell, else `$SHELL` from the provided environment, else `/bin/sh`.
    fn resolve_shell(&self, env: &HashMap<String, String>, path: &str, cwd: &Path) -> Result<PathBuf, SpawnError> {
        let shell = self
            .shell
            .clone()
            .or_else(|| env.get("SHELL").cloned())
            .unwrap_or_else(|| "/bin/sh".to_string());
        resolve(&shell, path, cwd).ok_or(SpawnError::ShellNotFound(shell))
    }

    /// Build the PTY command for `request`, validating everything the shell
    /// would otherwise only report as exit code 127.
    pub fn build_command(&self, request: &SpawnRequest, env: &HashMap<String, String>) -> Result<CommandBuilder, SpawnError> {
        if !request.cwd.is_dir() {
            return Err(SpawnError::WorkingDirectory(request.cwd.clone()));
        }
        let path = env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        if resolve(&request.command, &path, &request.cwd).is_none() {
            return Err(SpawnError::NotFound(request.command.clone()));
        }
        let shell = self.resolve_shell(env, &path, &request.cwd)?;

        let argv = wrapped_command_line(
            &shell.to_string_lossy(),
            &request.command,
            &request.args,
            &self.unset_env,
        );
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.cwd(&request.cwd);
        for (key, value) in env {
            cmd.env(key, value);
        }
        for var in &self.unset_env {
            cmd.env_remove(var);
        }
        cmd.env("TERM", &self.term);
        Ok(cmd)
    }
}

impl Launcher for PtyLauncher {
    fn launch(
        &self,
        request: &SpawnRequest,
        geometry: Geometry,
        env: HashMap<String, String>,
        events: ProcessEvents,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let cmd = self.build_command(request, &env)?;
        let process = PtyProcess::spawn(cmd, geometry, events)?;
        Ok(Box::new(process))
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_io_thread(name: &str, f: impl FnOnce() + Send + 'static) -> Result<(), SpawnError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(drop)
        .map_err(SpawnError::Thread)
}

/// A child process on a native PTY plus its I/O threads.
///
/// Three dedicated threads are started: a reader that forwards output and
/// then reports closure, a writer fed by an input channel, and a waiter that
/// reports the exit code. All three end on their own once the child is gone,
/// and none of them occupies the tokio blocking pool.
pub struct PtyProcess {
    pid: Option<u32>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("exited", &self.exited.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Spawn `cmd` on a fresh PTY.
    pub fn spawn(cmd: CommandBuilder, geometry: Geometry, events: ProcessEvents) -> Result<Self, SpawnError> {
        let pair = native_pty_system()
            .openpty(pty_size(geometry))
            .map_err(SpawnError::OpenPty)?;
        let mut child = pair.slave.spawn_command(cmd).map_err(SpawnError::SpawnCommand)?;
        // Only the child keeps the slave open, so the reader sees EOF/EIO
        // once it (and anything it forked) is gone.
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .map_err(SpawnError::CloneReader)
            .and_then(|reader| {
                let writer = pair.master.take_writer().map_err(SpawnError::TakeWriter)?;
                Ok((reader, writer))
            });
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(e);
            }
        };

        let pid = child.process_id();
        let killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Bytes>();

        let reader_events = events.clone();
        let reader_started = spawn_io_thread("ptyhub-pty-reader", move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if !reader_events.output(Bytes::copy_from_slice(&buf[..n])) {
                                break;
                            }
                        }
                        // EIO once the slave side is closed.
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader thread panicked: {:?}", e);
            }
            reader_events.closed();
        });
        let io_started = reader_started.and_then(|()| {
            spawn_io_thread("ptyhub-pty-writer", move || {
                let mut writer = writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            })
        });
        if let Err(e) = io_started {
            let _ = child.kill();
            return Err(e);
        }

        let waiter_exited = exited.clone();
        let mut waiter_killer = child.clone_killer();
        let waiter_started = spawn_io_thread("ptyhub-pty-waiter", move || {
            let code = match child.wait() {
                Ok(status) => {
                    tracing::debug!(?status, "session child exited");
                    i32::try_from(status.exit_code()).unwrap_or(i32::MAX)
                }
                Err(e) => {
                    tracing::error!(?e, "error waiting for session child");
                    -1
                }
            };
            waiter_exited.store(true, Ordering::Release);
            events.exited(code);
        });
        if let Err(e) = waiter_started {
            let _ = waiter_killer.kill();
            return Err(e);
        }

        Ok(Self {
            pid,
            master: Arc::new(Mutex::new(pair.master)),
            killer,
            input_tx,
            exited,
        })
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

impl ProcessHandle for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) {
        if self.has_exited() {
            return;
        }
        // Closed channel means the writer already hit EIO; nothing to report.
        let _ = self.input_tx.send(Bytes::copy_from_slice(data));
    }

    fn resize(&self, geometry: Geometry) {
        if let Err(e) = self.master.lock().resize(pty_size(geometry)) {
            tracing::debug!(pid = ?self.pid, error = %e, "pty resize failed");
        }
    }

    /// SIGKILL the child's process group, so whatever the login shell started
    /// goes too. portable_pty calls setsid(), making the child a group leader.
    fn kill(&mut self) {
        if self.has_exited() {
            tracing::debug!(pid = ?self.pid, "child already exited, skipping kill");
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if pid != 0 && pid <= i32::MAX as u32 {
                // SAFETY: plain signal delivery to a process group we created.
                let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
                if rc == 0 {
                    return;
                }
            }
        }
        if let Err(e) = self.killer.kill() {
            tracing::debug!(pid = ?self.pid, ?e, "kill failed");
        }
    }
}
