//! ptyhub - run a command in a managed PTY session.
//!
//! The command runs inside the user's login shell, attached to the local
//! terminal. ptyhub exits with the command's exit code.

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser as ClapParser;
use ptyhub::{
    config::{ConfigError, PtyConfig},
    env::{EnvProvider, InheritedEnv, LoginShellEnv},
    observer::ExecutionTracker,
    ports::PortDetector,
    session::{RegistryError, SessionId, SpawnRequest},
    surface::{ContainerHandle, StdoutSurfaceFactory},
    terminal::{self, RawModeGuard},
    Coordinator,
};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when the command could not be started.
const EXIT_SPAWN_FAILED: i32 = 127;
/// Exit code when interrupted before the command finished.
const EXIT_INTERRUPTED: i32 = 130;

/// ptyhub - run a command in a managed PTY session
#[derive(ClapParser, Debug)]
#[command(name = "ptyhub", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, env = "PTYHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Working directory for the command (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Login shell used to wrap the command (overrides config and $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Session name (defaults to the command line)
    #[arg(long)]
    name: Option<String>,

    /// Owning project label
    #[arg(long)]
    project: Option<String>,

    /// Use this process's environment instead of capturing the login shell's
    #[arg(long)]
    inherit_env: bool,

    /// Command to run
    command: String,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Error, Debug)]
pub enum PtyhubError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("session error: {0}")]
    Registry(#[from] RegistryError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialize tracing with stderr output. Stdout carries the session.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ptyhub=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    // Exit directly: the stdin forwarder may still be blocked in read().
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ptyhub: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, PtyhubError> {
    let mut config = PtyConfig::load_or_default(cli.config.as_deref())?;
    if cli.shell.is_some() {
        config.shell = cli.shell;
    }
    let cwd = match cli.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    let env: Arc<dyn EnvProvider> = match (cli.inherit_env, &config.shell) {
        (true, _) => Arc::new(InheritedEnv),
        (false, Some(shell)) => Arc::new(LoginShellEnv::new(shell.clone())),
        (false, None) => Arc::new(LoginShellEnv::from_user_shell()),
    };
    let tracker = ExecutionTracker::new();
    let ports = Arc::new(PortDetector::new());
    let surfaces = Arc::new(StdoutSurfaceFactory::new(config.fallback_geometry()));

    let (coordinator, event_loop) = Coordinator::builder(surfaces)
        .env(env)
        .observer(Arc::new(tracker.clone()))
        .listener(ports.clone())
        .config(config)
        .build();
    let loop_task = tokio::spawn(event_loop.run());

    let mut request = SpawnRequest::new(cli.command, cwd).args(cli.args);
    if let Some(name) = cli.name {
        request = request.name(name);
    }
    if let Some(project) = cli.project {
        request = request.display_context(project);
    }
    let id = coordinator.spawn(request)?;

    // Raw mode so keystrokes, Ctrl+C included, reach the child.
    let raw_mode = if std::io::stdin().is_terminal() {
        Some(RawModeGuard::new()?)
    } else {
        None
    };
    coordinator.mount(id, &ContainerHandle::new("stdout"));
    spawn_stdin_forwarder(coordinator.clone(), id)?;

    let record = tokio::select! {
        record = tracker.wait_finished(id) => record,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            None
        }
    };

    if let Some(port) = ports.port(&id) {
        tracing::info!(port, "session announced a listening port");
    }
    coordinator.shutdown();
    if let Err(e) = loop_task.await {
        tracing::error!(?e, "event loop task failed");
    }
    drop(raw_mode);

    Ok(match record {
        Some(record) => record.exit_code.unwrap_or(EXIT_SPAWN_FAILED),
        None => EXIT_INTERRUPTED,
    })
}

/// Forward local stdin to the session on a dedicated thread. Stops at EOF or
/// once the session is gone.
fn spawn_stdin_forwarder(coordinator: Coordinator, id: SessionId) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("ptyhub-stdin".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !coordinator.write(id, &buf[..n]) {
                            break;
                        }
                    }
                }
            }
        })?;
    Ok(())
}
