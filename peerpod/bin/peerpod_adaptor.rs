//! `peerpod-adaptor` is the worker node daemon of peer pods.
//!
//! It serves the remote hypervisor surface the container runtime drives sandboxes through, and
//! runs each sandbox on a pod VM provisioned from the configured provider.
//!
//! ```bash
//! peerpod-adaptor \
//!     --config /etc/peerpod/adaptor.toml \
//!     --provider pool \
//!     --pool-ips 192.168.122.10-192.168.122.20 \
//!     --tunnel-type vxlan
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use peerpod::{
    cli::AdaptorArgs,
    cloud::CloudService,
    hypervisor::Server,
    podnetwork::WorkerNode,
    provider::ProviderRegistry,
    utils::cancel_on_signal,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AdaptorArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = args
        .server_config()
        .await
        .context("failed to load the adaptor configuration")?;
    tracing::info!(
        socket = %config.get_socket_path().display(),
        pods_dir = %config.get_pods_dir().display(),
        provider = %config.get_provider(),
        tunnel = %config.get_network().get_tunnel_type(),
        tls = config.get_tls_config().is_some(),
        "starting peerpod-adaptor {}",
        env!("CARGO_PKG_VERSION")
    );

    let provider = ProviderRegistry::with_builtin()
        .create(config.get_provider(), &config)
        .await
        .with_context(|| format!("failed to create the {} provider", config.get_provider()))?;
    let network = Arc::new(WorkerNode::new(config.get_network().clone()));
    let cloud = CloudService::new(provider, network, config)
        .context("failed to create the cloud service")?;
    let server = Server::new(Arc::new(cloud));

    let ctx = CancellationToken::new();
    cancel_on_signal(ctx.clone())?;

    let served = server.start(ctx).await;
    server.shutdown().await?;
    served.context("hypervisor server failed")?;

    tracing::info!("peerpod-adaptor stopped");
    Ok(())
}
