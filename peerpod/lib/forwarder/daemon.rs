use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::{
    agent::{AGENT_SERVICE, HEALTH_SERVICE},
    podnetwork::PodNode,
    tls::TlsConfig,
    ttrpc::Server,
    PeerpodError, PeerpodResult,
};

use super::{DaemonConfig, Interceptor};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The pod VM end of a sandbox's agent connection.
///
/// Rebuilds the pod network inside the VM, then serves the agent surface on TCP for the worker's
/// agent proxy, over mutual TLS when certificates are configured. The daemon turns ready once and
/// stops once.
pub struct Daemon {
    listen_addr: SocketAddr,
    tls: Option<TlsConfig>,
    interceptor: Arc<Interceptor>,
    pod_node: Option<PodNode>,
    local_addr: OnceLock<SocketAddr>,
    ready: CancellationToken,
    stop: CancellationToken,
    stopped: AtomicBool,
    span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Daemon {
    /// Creates a daemon listening on `listen_addr`.
    ///
    /// TLS material the pod VM lacks is taken from `config`; `tls` of `None` serves plain TCP.
    pub fn new(
        config: &DaemonConfig,
        listen_addr: SocketAddr,
        mut tls: Option<TlsConfig>,
        interceptor: Interceptor,
        pod_node: Option<PodNode>,
    ) -> Self {
        if let Some(tls) = tls.as_mut() {
            config.apply_tls(tls);
        }

        let span = info_span!(
            "forwarder",
            pod = %config.get_pod_name(),
            namespace = %config.get_pod_namespace(),
        );
        Self {
            listen_addr,
            tls,
            interceptor: Arc::new(interceptor),
            pod_node,
            local_addr: OnceLock::new(),
            ready: CancellationToken::new(),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            span,
        }
    }

    /// Creates a daemon for `config` relaying to the agent at `agent_socket`.
    ///
    /// The pod network is rebuilt in the namespace at `pod_ns_path` when `config` carries one;
    /// `host_interface` names the VM interface facing the worker.
    pub fn from_config(
        config: &DaemonConfig,
        listen_addr: SocketAddr,
        tls: Option<TlsConfig>,
        agent_socket: impl Into<PathBuf>,
        pod_ns_path: impl Into<PathBuf>,
        host_interface: Option<String>,
    ) -> Self {
        let pod_ns_path = pod_ns_path.into();
        let pod_node = config
            .get_pod_network()
            .clone()
            .map(|network| PodNode::new(pod_ns_path.clone(), host_interface, network));
        let interceptor = Interceptor::for_agent_socket(agent_socket, pod_ns_path);
        Self::new(config, listen_addr, tls, interceptor, pod_node)
    }

    /// Sets the pod network up and serves until [`Daemon::shutdown`] is called, `ctx` is cancelled
    /// or serving fails. The pod network is torn down before returning.
    pub async fn start(&self, ctx: CancellationToken) -> PeerpodResult<()> {
        async {
            if let Some(node) = &self.pod_node {
                node.setup().await.map_err(|e| {
                    PeerpodError::Internal(format!("failed to set up pod network: {e}"))
                })?;
            }

            let result = self.serve(&ctx).await;

            if let Some(node) = &self.pod_node {
                if let Err(e) = node.teardown().await {
                    warn!(error = %e, "failed to tear down pod network");
                }
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }

    async fn serve(&self, ctx: &CancellationToken) -> PeerpodResult<()> {
        let acceptor = match &self.tls {
            Some(tls) => {
                info!("TLS is configured");
                Some(TlsAcceptor::from(tls.server_config().await?))
            }
            None => None,
        };

        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);
        info!(address = %local_addr, "agent protocol forwarder is listening");

        let server = Server::new()
            .register(AGENT_SERVICE, self.interceptor.clone())
            .register(HEALTH_SERVICE, self.interceptor.clone());

        let serving = CancellationToken::new();
        let mut task = tokio::spawn(
            serve_tcp(server, listener, acceptor, serving.clone()).instrument(self.span.clone()),
        );

        self.ready.cancel();

        let result = tokio::select! {
            _ = ctx.cancelled() => {
                self.shutdown();
                Ok(())
            }
            _ = self.stop.cancelled() => Ok(()),
            served = &mut task => served.map_err(PeerpodError::from).and_then(|result| result),
        };

        serving.cancel();
        self.interceptor.close().await;
        result
    }

    /// Waits until the daemon accepts connections.
    pub async fn ready(&self) {
        self.ready.cancelled().await
    }

    /// The address the daemon accepts connections on, once it is ready.
    pub async fn addr(&self) -> SocketAddr {
        self.ready().await;
        self.local_addr.get().copied().unwrap_or(self.listen_addr)
    }

    /// Stops the daemon. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(parent: &self.span, "shutting down agent protocol forwarder");
        self.stop.cancel();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Accepts connections until `shutdown` is cancelled, completing the TLS handshake first when an
/// acceptor is given.
async fn serve_tcp(
    server: Server,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> PeerpodResult<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };
        debug!(%peer, "accepted connection");

        let server = server.clone();
        let acceptor = acceptor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(
            async move {
                let served = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => server.serve_connection(stream, shutdown).await,
                        Err(e) => {
                            warn!(%peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => server.serve_connection(stream, shutdown).await,
                };
                if let Err(e) = served {
                    warn!(%peer, error = %e, "connection failed");
                }
            }
            .in_current_span(),
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
