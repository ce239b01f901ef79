//! `ganeti-nld`: per-node NBMA link daemon binary. Wires [`cli::Cli`] and
//! [`daemon::Daemon`] together, matching the teacher's
//! `gnosis_vpn-root/src/main.rs` shape (tracing init, signal-driven
//! shutdown, `exitcode`-based process exit) simplified to a single-process
//! daemon with no privilege-separated worker.

use std::process;

use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod cli;
mod daemon;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_LOG_FILTER: &str = "info";

fn setup_logging(log_level: Option<&str>) {
    let filter = log_level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).unwrap_or_else(|error| {
        tracing::error!(?error, "failed to install SIGINT handler");
        process::exit(exitcode::OSERR);
    });
    let mut sigterm = signal(SignalKind::terminate()).unwrap_or_else(|error| {
        tracing::error!(?error, "failed to install SIGTERM handler");
        process::exit(exitcode::OSERR);
    });
    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}

async fn run() -> Result<(), exitcode::ExitCode> {
    let args = cli::parse();
    setup_logging(args.log_level.as_deref());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    let daemon = daemon::Daemon::build(&args).await.map_err(|error| {
        tracing::error!(?error, "failed to initialize daemon");
        exitcode::CONFIG
    })?;

    daemon.run(shutdown_signal()).await.map_err(|error| {
        tracing::error!(?error, "daemon exited with an error");
        exitcode::SOFTWARE
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    match run().await {
        Ok(()) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
