//! `podvm-forwarder` runs inside every pod VM.
//!
//! It reads the daemon configuration the worker node placed in the VM's user data, rebuilds the
//! pod network and relays the agent protocol from the worker to the local agent.

use anyhow::Context;
use clap::Parser;
use peerpod::{
    cli::ForwarderArgs,
    forwarder::{Daemon, DaemonConfig},
    utils::cancel_on_signal,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ForwarderArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = DaemonConfig::load(&args.config)
        .await
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    tracing::info!(
        pod = %config.get_pod_name(),
        namespace = %config.get_pod_namespace(),
        listen = %args.listen,
        "starting podvm-forwarder {}",
        env!("CARGO_PKG_VERSION")
    );

    let daemon = Daemon::from_config(
        &config,
        args.listen,
        args.tls_config(),
        &args.kata_agent_socket,
        &args.kata_agent_namespace,
        args.host_interface.clone(),
    );

    let ctx = CancellationToken::new();
    cancel_on_signal(ctx.clone())?;

    daemon.start(ctx).await.context("agent protocol forwarder failed")?;

    tracing::info!("podvm-forwarder stopped");
    Ok(())
}
