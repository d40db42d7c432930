//! Session supervisor spawned by aexpect clients.
//!
//! Reads its bootstrap from stdin, populates the session directory, forks
//! the target command under a fresh PTY, announces readiness on stdout, and
//! then forwards bytes between the child and the session's FIFOs until the
//! child exits. The exclusive lock on `lock-server-running` is held for the
//! whole lifetime of this process; its release is the termination signal
//! clients wait on.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

mod bootstrap;
mod pty;
mod server;

use aexpect_lock::{FileLock, wait_for_lock};
use aexpect_session::SessionDir;
use server::Server;

#[derive(Parser)]
#[command(name = "aexpect-helper", version)]
#[command(about = "Supervise a command under a pseudo terminal for aexpect clients")]
struct Cli {
    /// Root directory for session state (defaults to $TMPDIR, then /tmp)
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let stdin = std::io::stdin();
    let bootstrap = bootstrap::read_bootstrap(&mut stdin.lock())?;

    let root = cli.base_dir.unwrap_or_else(aexpect_session::default_root);
    let dir = SessionDir::with_root(&root, &bootstrap.session_id);
    dir.create()?;

    // Keep the guard alive so buffered log lines reach server-log.
    let _log_guard = init_logging(&dir);
    info!(
        id = %bootstrap.session_id,
        command = %bootstrap.command,
        echo = bootstrap.echo,
        consumers = ?bootstrap.consumers,
        "starting session helper"
    );

    let Some(_running_lock) =
        FileLock::try_acquire(&dir.lock_server_running(), "session helper")?
    else {
        bail!(
            "another helper already serves session '{}'",
            bootstrap.session_id
        );
    };

    let mut server = Server::initialise(dir.clone(), &bootstrap)?;

    // The client blocks on this exact line before opening its pipes.
    println!("Server {} ready", bootstrap.session_id);
    std::io::stdout()
        .flush()
        .context("failed to flush ready line")?;

    // Wait for the client to finish attaching its consumer pipes; the lock
    // is released once every reader is open.
    wait_for_lock(&dir.lock_client_starting())?;

    let status = server.run()?;
    info!(status, "session helper exiting");
    Ok(())
}

/// Route diagnostics to the session's `server-log` file.
fn init_logging(dir: &SessionDir) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(dir.path(), "server-log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init()
        .ok()?;
    Some(guard)
}
