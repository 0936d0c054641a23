//! `buildgovd`, the build governor daemon.
//!
//! Zero-argument invocation runs in console mode with verbose startup
//! logging. `--background` is the quiet mode shims auto-start, with a
//! 30-minute idle shutdown; `--service` is quiet without idle shutdown,
//! for host-managed lifetimes.

use std::sync::Arc;

use anyhow::Context;
use buildgov_core::classify::ClassifierConfig;
use buildgov_core::memory::SystemProbe;
use buildgov_core::pool::{PoolConfig, TokenPool};
use buildgov_core::protocol::endpoint;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use buildgov_daemon::{config, instance, maintenance, server};

#[derive(Debug, Parser)]
#[command(
    name = "buildgovd",
    version,
    about = "Build admission governor: gates parallel compiler/linker \
             invocations on host commit pressure"
)]
struct Cli {
    /// Quiet mode with a 30-minute idle auto-shutdown. Used by shim
    /// auto-start.
    #[arg(long, conflicts_with = "service")]
    background: bool,

    /// Quiet mode without idle shutdown, for a host-managed lifetime.
    #[arg(long)]
    service: bool,
}

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.background || cli.service);

    match run(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "governor startup failed");
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let budget = config::budget_from_env().context("budget configuration invalid")?;

    // Single-instance discipline: the holder of the instance lock is the
    // governor. Losing the race is a clean exit, not an error; shims
    // routinely start several of us at once.
    let lock_path = endpoint::instance_lock_path();
    let Some(_instance_lock) =
        instance::acquire(&lock_path).context("instance lock unavailable")?
    else {
        info!("another governor instance is running; exiting");
        return Ok(0);
    };

    let pool = Arc::new(TokenPool::new(
        PoolConfig {
            budget,
            ..PoolConfig::default()
        },
        ClassifierConfig::default(),
        Arc::new(SystemProbe::new()),
    ));

    let socket_path = endpoint::socket_path();
    let server = server::GovernorServer::bind(&socket_path, Arc::clone(&pool))
        .with_context(|| format!("cannot bind {}", socket_path.display()))?;

    let status = pool.status();
    info!(
        total_tokens = status.total_tokens,
        commit_ratio = format!("{:.2}", status.snapshot.commit_ratio),
        throttle = %status.throttle_level,
        background = cli.background,
        service = cli.service,
        "governor ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let idle_limit = cli.background.then_some(maintenance::BACKGROUND_IDLE_LIMIT);
    let sweeper = tokio::spawn(maintenance::run(
        Arc::clone(&pool),
        idle_limit,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    let serve = tokio::spawn(server.serve(shutdown_rx));

    tokio::select! {
        _ = wait_for_signal() => {
            info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
        // Idle shutdown (background mode) flips the flag from inside the
        // maintenance task; nothing to do here but fall through.
        _ = watch_flag(shutdown_tx.subscribe()) => {}
    }

    let _ = serve.await;
    let _ = sweeper.await;
    // Remove the socket so the next governor's stale-file cleanup is a
    // no-op and half-open clients fail fast.
    let _ = std::fs::remove_file(&socket_path);
    info!("governor stopped");
    Ok(0)
}

async fn watch_flag(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
