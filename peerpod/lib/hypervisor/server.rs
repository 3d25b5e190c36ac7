use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cloud::CloudService,
    ttrpc::Server as TtrpcServer,
    PeerpodError, PeerpodResult,
};

use super::{HypervisorService, PodVmInfoService, HYPERVISOR_SERVICE, POD_VM_INFO_SERVICE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The worker daemon's RPC endpoint: the hypervisor and pod VM info surfaces on one unix socket.
pub struct Server {
    cloud: Arc<CloudService>,
    socket_path: PathBuf,
    ready: CancellationToken,
    stop: CancellationToken,
    stopped: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Server {
    /// Creates a server for `cloud`, listening on the configured socket.
    pub fn new(cloud: Arc<CloudService>) -> Self {
        let socket_path = cloud.config().get_socket_path().clone();
        Self {
            cloud,
            socket_path,
            ready: CancellationToken::new(),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// The sandbox lifecycle service behind the surfaces.
    pub fn cloud(&self) -> &Arc<CloudService> {
        &self.cloud
    }

    /// Serves until `ctx` is cancelled, [`Server::shutdown`] is called or serving fails.
    ///
    /// The provider configuration is verified first when the adaptor is configured to.
    pub async fn start(&self, ctx: CancellationToken) -> PeerpodResult<()> {
        if *self.cloud.config().get_enable_cloud_config_verify() {
            self.cloud.config_verifier().await.inspect_err(|e| {
                error!(error = %e, "provider configuration is invalid");
            })?;
        }

        let listener = TtrpcServer::bind_unix(&self.socket_path).await?;
        let serving = self.stop.child_token();
        let server = TtrpcServer::new()
            .register(
                HYPERVISOR_SERVICE,
                Arc::new(HypervisorService::new(self.cloud.clone(), serving.clone())),
            )
            .register(
                POD_VM_INFO_SERVICE,
                Arc::new(PodVmInfoService::new(self.cloud.clone(), serving.clone())),
            );

        let mut task = tokio::spawn({
            let serving = serving.clone();
            async move { server.serve_unix(listener, serving).await }
        });

        self.ready.cancel();
        info!(socket = %self.socket_path.display(), "server started");

        let result = tokio::select! {
            _ = ctx.cancelled() => self.shutdown().await,
            _ = self.stop.cancelled() => Ok(()),
            served = &mut task => served.map_err(PeerpodError::from).and_then(|result| result),
        };

        serving.cancel();
        result
    }

    /// Waits until the server accepts connections.
    pub async fn ready(&self) {
        self.ready.cancelled().await
    }

    /// Stops serving and tears the lifecycle service down. Later calls do nothing.
    pub async fn shutdown(&self) -> PeerpodResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down server");
        self.stop.cancel();
        self.cloud.teardown().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
