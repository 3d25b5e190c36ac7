use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::{
    agent::{Redirector, AGENT_SERVICE, HEALTH_SERVICE},
    tls::CaService,
    ttrpc::Server,
    PeerpodError, PeerpodResult,
};

use super::{PodVmDialer, ProxyFactory, ProxyService, PODVM_SERVER_NAME};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The worker end of a sandbox's agent connection.
///
/// Serves the agent surface on the sandbox's unix socket and forwards it to the forwarder of the
/// pod VM. The proxy turns ready once, after the pod VM answered and the socket is served, and
/// stops once.
#[derive(Debug)]
pub struct AgentProxy {
    factory: ProxyFactory,
    server_name: String,
    socket_path: PathBuf,
    ready: CancellationToken,
    stop: CancellationToken,
    stopped: AtomicBool,
    span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentProxy {
    pub(super) fn new(factory: ProxyFactory, server_name: String, socket_path: PathBuf) -> Self {
        let span = info_span!("agent_proxy", server_name = %server_name);
        Self {
            factory,
            server_name,
            socket_path,
            ready: CancellationToken::new(),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            span,
        }
    }

    /// The pod VM's instance name.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The unix socket the agent surface is served on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The authority that issues the pod VM's server certificate, if any.
    pub fn ca_service(&self) -> Option<&CaService> {
        self.factory.ca_service()
    }

    /// The client certificate chain the pod VM must require, if it is shipped in the user data.
    pub fn client_ca(&self) -> Option<String> {
        self.factory.client_ca()
    }

    /// Serves the agent surface until [`AgentProxy::shutdown`] is called, `ctx` is cancelled or
    /// serving fails.
    ///
    /// The pod VM forwarder at `server_addr` is dialed before the proxy turns ready; failing to
    /// reach it within the proxy timeout fails the call. The socket is removed once serving ends.
    pub async fn start(&self, server_addr: SocketAddr, ctx: CancellationToken) -> PeerpodResult<()> {
        async {
            let server_name = if self.factory.ca_service.is_some() {
                self.server_name.as_str()
            } else {
                PODVM_SERVER_NAME
            };
            let mut dialer = PodVmDialer::new(server_addr, self.factory.proxy_timeout);
            if let Some(tls) = &self.factory.tls {
                dialer = dialer.with_tls(tls, server_name).await?;
            }

            let listener = Server::bind_unix(&self.socket_path).await?;
            info!(socket = %self.socket_path.display(), "listening");

            let redirector = Arc::new(Redirector::new(Arc::new(dialer)));
            let result = self.serve(listener, redirector.clone(), &ctx).await;
            redirector.close().await;
            self.remove_socket().await;
            result
        }
        .instrument(self.span.clone())
        .await
    }

    async fn serve(
        &self,
        listener: UnixListener,
        redirector: Arc<Redirector>,
        ctx: &CancellationToken,
    ) -> PeerpodResult<()> {
        tokio::select! {
            _ = ctx.cancelled() => {
                self.shutdown();
                return Ok(());
            }
            _ = self.stop.cancelled() => return Ok(()),
            connected = redirector.connect() => {
                connected.map_err(|e| {
                    PeerpodError::Unavailable(format!("error connecting to agent: {e}"))
                })?;
            }
        }

        let service = Arc::new(ProxyService::new(
            redirector,
            self.factory.pause_image.clone(),
            self.factory.direct_volumes_dir.clone(),
            self.factory.pull_image_before_create,
            self.span.clone(),
        ));
        let server = Server::new()
            .register(AGENT_SERVICE, service.clone())
            .register(HEALTH_SERVICE, service);

        let serving = CancellationToken::new();
        let mut task = tokio::spawn({
            let serving = serving.clone();
            async move { server.serve_unix(listener, serving).await }
        });

        self.ready.cancel();
        info!("agent proxy is ready");

        let result = tokio::select! {
            _ = ctx.cancelled() => {
                self.shutdown();
                Ok(())
            }
            _ = self.stop.cancelled() => Ok(()),
            served = &mut task => served.map_err(PeerpodError::from).and_then(|result| result),
        };

        serving.cancel();
        result
    }

    async fn remove_socket(&self) {
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => debug!(socket = %self.socket_path.display(), "removed agent socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(socket = %self.socket_path.display(), error = %e, "failed to remove agent socket")
            }
        }
    }

    /// Waits until the proxy serves the agent surface.
    pub async fn ready(&self) {
        self.ready.cancelled().await
    }

    /// Whether the proxy serves the agent surface.
    pub fn is_ready(&self) -> bool {
        self.ready.is_cancelled()
    }

    /// Stops the proxy. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(parent: &self.span, "shutting down agent proxy");
        self.stop.cancel();
    }

    /// Whether [`AgentProxy::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `proxy` in a background task, logging how it ends.
pub fn spawn_agent_proxy(
    proxy: Arc<AgentProxy>,
    server_addr: SocketAddr,
    ctx: CancellationToken,
) -> tokio::task::JoinHandle<PeerpodResult<()>> {
    tokio::spawn(async move {
        proxy
            .start(server_addr, ctx)
            .await
            .inspect_err(|e| warn!(parent: &proxy.span, error = %e, "agent proxy failed"))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use prost::Message;
    use tokio::net::{TcpListener, UnixStream};
    use tokio_rustls::TlsAcceptor;

    use crate::{
        agent::CreateSandboxRequest,
        config::ServerConfig,
        tls::TlsConfig,
        ttrpc::{Client, Request, Service, Status},
    };

    use super::*;

    #[derive(Default)]
    struct RecordingAgent {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Service for RecordingAgent {
        async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((request.method, request.payload));
            }
            Ok(Vec::new())
        }
    }

    /// Serves `agent` on TCP the way a pod VM forwarder does.
    async fn spawn_pod_vm(
        agent: Arc<RecordingAgent>,
        acceptor: Option<TlsAcceptor>,
    ) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let server = Server::new()
            .register(AGENT_SERVICE, agent.clone())
            .register(HEALTH_SERVICE, agent);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = server.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(stream).await {
                                let _ = server.serve_connection(stream, CancellationToken::new()).await;
                            }
                        }
                        None => {
                            let _ = server.serve_connection(stream, CancellationToken::new()).await;
                        }
                    }
                });
            }
        });
        Ok(address)
    }

    async fn create_sandbox_through(proxy: &AgentProxy) -> anyhow::Result<()> {
        let client = Client::new(UnixStream::connect(proxy.socket_path()).await?);
        let request = CreateSandboxRequest {
            hostname: "pod".into(),
            dns: vec!["nameserver 10.96.0.10".into()],
            ..Default::default()
        };
        client
            .call::<_, crate::ttrpc::Empty>(AGENT_SERVICE, "CreateSandbox", &request, None)
            .await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_agent_proxy_forwards_over_tcp() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let agent = Arc::new(RecordingAgent::default());
        let address = spawn_pod_vm(agent.clone(), None).await?;

        let factory = ProxyFactory::new(&ServerConfig::default())?;
        let proxy = Arc::new(factory.create("podvm-test", dir.path().join("sb").join("agent.ttrpc")));
        let task = spawn_agent_proxy(proxy.clone(), address, CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(10), proxy.ready()).await?;
        assert!(proxy.is_ready());
        create_sandbox_through(&proxy).await?;

        let calls = agent.calls.lock().map(|c| c.clone()).unwrap_or_default();
        assert_eq!(calls.len(), 1);
        assert!(CreateSandboxRequest::decode(calls[0].1.as_slice())?.dns.is_empty());

        assert!(proxy.socket_path().exists());
        proxy.shutdown();
        proxy.shutdown();
        task.await??;
        assert!(proxy.is_shut_down());
        assert!(!proxy.socket_path().exists());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_agent_proxy_mutual_tls_with_generated_ca() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = ServerConfig::builder()
            .tls_config(TlsConfig::default())
            .build();
        let factory = ProxyFactory::new(&config)?;
        let proxy = Arc::new(factory.create("podvm-test-1234", dir.path().join("agent.ttrpc")));

        let issued = proxy
            .ca_service()
            .ok_or_else(|| anyhow::anyhow!("no CA service"))?
            .issue(proxy.server_name())?;
        let client_ca = proxy.client_ca().ok_or_else(|| anyhow::anyhow!("no client CA"))?;
        let pod_vm_tls = TlsConfig::builder()
            .cert_data(issued.cert_pem)
            .key_data(issued.key_pem)
            .ca_data(client_ca)
            .build();
        let acceptor = TlsAcceptor::from(pod_vm_tls.server_config().await?);

        let agent = Arc::new(RecordingAgent::default());
        let address = spawn_pod_vm(agent.clone(), Some(acceptor)).await?;

        let ctx = CancellationToken::new();
        let task = spawn_agent_proxy(proxy.clone(), address, ctx.clone());
        tokio::time::timeout(Duration::from_secs(10), proxy.ready()).await?;
        create_sandbox_through(&proxy).await?;
        assert_eq!(agent.calls.lock().map(|c| c.len()).unwrap_or_default(), 1);

        ctx.cancel();
        task.await??;
        assert!(proxy.is_shut_down());
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_proxy_fails_when_pod_vm_is_unreachable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let reserved = TcpListener::bind("127.0.0.1:0").await?;
        let address = reserved.local_addr()?;
        drop(reserved);

        let config = ServerConfig::builder()
            .proxy_timeout(Duration::from_millis(300))
            .build();
        let factory = ProxyFactory::new(&config)?;
        let proxy = Arc::new(factory.create("podvm-test", dir.path().join("agent.ttrpc")));

        let result = spawn_agent_proxy(proxy.clone(), address, CancellationToken::new()).await?;
        assert_eq!(result.unwrap_err().kind(), crate::ErrorKind::Unavailable);
        assert!(!proxy.is_ready());
        assert!(!proxy.socket_path().exists());
        Ok(())
    }
}
