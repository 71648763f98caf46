mod config;
#[cfg(windows)]
mod pipe_win;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_bridge::Bridge;
use relay_transport::PipeOpener;
use tracing_subscriber::EnvFilter;

use config::Cli;

/// How long to wait for the bridge's worker threads to stop on shutdown
/// before giving up and exiting anyway.
const SHUTDOWN_JOIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(err) = run(cli) {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let bind_addrs = cli.bind_addrs().context("invalid bind address")?;
    let opener = build_pipe_opener()?;

    let keep_alive = cli.keep_alive_secs.map(std::time::Duration::from_secs);
    let bridge =
        Bridge::start(opener, cli.read_pipe_name(), cli.write_pipe_name(), &bind_addrs, keep_alive);

    install_shutdown_handler(Arc::clone(&bridge));

    tracing::info!(
        host = %cli.host,
        pipe = %cli.pipe_name,
        binds = ?bind_addrs,
        "relay starting"
    );

    while !bridge.is_shutdown() {
        bridge.pump();
    }

    if !bridge.join(SHUTDOWN_JOIN_TIMEOUT) {
        tracing::warn!("bridge worker threads did not stop within the shutdown timeout");
    }
    tracing::info!("relay stopped");
    Ok(())
}

#[cfg(windows)]
fn build_pipe_opener() -> anyhow::Result<Box<dyn PipeOpener>> {
    Ok(Box::new(pipe_win::WindowsPipeOpener))
}

#[cfg(not(windows))]
fn build_pipe_opener() -> anyhow::Result<Box<dyn PipeOpener>> {
    anyhow::bail!(
        "named-pipe transport requires a Windows SMB session; this build has no pipe backend"
    )
}

fn install_shutdown_handler(bridge: Arc<Bridge>) {
    ctrlc::set_handler(move || {
        tracing::warn!("caught interrupt, shutting down");
        bridge.request_termination();
    })
    .expect("failed to install Ctrl-C handler");
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
