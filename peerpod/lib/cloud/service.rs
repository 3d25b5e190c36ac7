use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Span};

use crate::{
    config::ServerConfig, podnetwork::WorkerNetwork, provider::Provider, proxy::ProxyFactory,
    PeerpodError, PeerpodResult,
};

use super::Sandbox;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The version reported to the container runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The sandbox lifecycle service.
///
/// Owns the live sandboxes and sequences the provider, the worker network and the agent proxies
/// for each of them. The sandbox map is only locked for reads and writes of the map itself, never
/// across provider calls, network configuration or other I/O.
pub struct CloudService {
    pub(super) provider: Arc<dyn Provider>,
    pub(super) network: Arc<dyn WorkerNetwork>,
    pub(super) proxy_factory: ProxyFactory,
    pub(super) config: ServerConfig,
    pub(super) sandboxes: Mutex<BTreeMap<String, Sandbox>>,

    /// Signalled whenever a sandbox's instance changes.
    pub(super) changed: Notify,

    /// Cancelled when the service shuts down; parents every agent proxy.
    pub(super) shutdown: CancellationToken,
    pub(super) span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudService {
    /// Creates the service.
    pub fn new(
        provider: Arc<dyn Provider>,
        network: Arc<dyn WorkerNetwork>,
        config: ServerConfig,
    ) -> PeerpodResult<Self> {
        let proxy_factory = ProxyFactory::new(&config)?;
        Ok(Self {
            provider,
            network,
            proxy_factory,
            config,
            sandboxes: Mutex::new(BTreeMap::new()),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
            span: info_span!("cloud"),
        })
    }

    /// The adaptor configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The service version.
    pub fn version(&self) -> &'static str {
        VERSION
    }

    /// The number of live sandboxes.
    pub async fn sandbox_count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    /// The instance id of the pod VM hosting `namespace/name`.
    ///
    /// Without `wait`, a pod whose VM has not been started yet is [`PeerpodError::NotFound`].
    /// With `wait`, the call blocks until the pod VM is started or `ctx` is cancelled, in which
    /// case it fails with [`PeerpodError::DeadlineExceeded`].
    pub async fn get_instance_id(
        &self,
        namespace: &str,
        name: &str,
        wait: bool,
        ctx: &CancellationToken,
    ) -> PeerpodResult<String> {
        loop {
            // Registered before the lookup so an instance set in between is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let sandboxes = self.sandboxes.lock().await;
                let started = sandboxes
                    .values()
                    .find(|sandbox| {
                        sandbox.is_pod(namespace, name) && !sandbox.get_instance_id().is_empty()
                    });
                if let Some(sandbox) = started {
                    return Ok(sandbox.get_instance_id().clone());
                }
            }

            if !wait {
                return Err(PeerpodError::NotFound(format!(
                    "no pod VM started for pod {namespace}/{name}"
                )));
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(PeerpodError::DeadlineExceeded(format!(
                        "waiting for the pod VM of pod {namespace}/{name}"
                    )));
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Applies `update` to a live sandbox under the map lock.
    pub(super) async fn update_sandbox(
        &self,
        sandbox_id: &str,
        update: impl FnOnce(&mut Sandbox),
    ) -> PeerpodResult<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes.get_mut(sandbox_id).ok_or_else(|| {
            PeerpodError::NotFound(format!("sandbox {sandbox_id} does not exist"))
        })?;
        update(sandbox);
        Ok(())
    }

    /// Checks the provider configuration.
    pub async fn config_verifier(&self) -> PeerpodResult<()> {
        self.provider.config_verifier().await
    }

    /// Stops every agent proxy and releases provider-wide resources.
    ///
    /// Pod VMs of live sandboxes are left running; they are released by `StopVM` or by the
    /// provider's own garbage collection.
    pub async fn teardown(&self) -> PeerpodResult<()> {
        self.shutdown.cancel();
        {
            let sandboxes = self.sandboxes.lock().await;
            for sandbox in sandboxes.values() {
                sandbox.get_proxy().shutdown();
            }
            if !sandboxes.is_empty() {
                warn!(
                    parent: &self.span,
                    count = sandboxes.len(),
                    "shutting down with live sandboxes"
                );
            }
        }

        info!(parent: &self.span, "tearing down provider");
        self.provider.teardown().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        path::{Path, PathBuf},
        time::Duration,
    };

    use tokio::net::TcpListener;

    use crate::{
        cloud::testing::{
            cloud_service, pod_annotations, spawn_pod_vm, FakeNetwork, FakeProvider,
        },
        ErrorKind,
    };

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_sandbox_lifecycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let port = spawn_pod_vm().await?;
        let provider = Arc::new(FakeProvider::default());
        let network = Arc::new(FakeNetwork::default());
        let service = Arc::new(cloud_service(
            dir.path(),
            port,
            provider.clone(),
            network.clone(),
        )?);

        let socket = service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;
        assert_eq!(socket, dir.path().join("sandbox-1").join("agent.ttrpc"));
        assert_eq!(service.sandbox_count().await, 1);

        let ctx = CancellationToken::new();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let service = service.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    service.get_instance_id("default", "nginx", true, &ctx).await
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(10), service.start_vm("sandbox-1", &ctx)).await??;
        for waiter in waiters {
            assert_eq!(waiter.await??, "i-sandbox-1");
        }
        assert!(tokio::net::UnixStream::connect(&socket).await.is_ok());

        let setups = network.setups.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(setups, vec![(PathBuf::from("/run/netns/cni-1"), vec![Ipv4Addr::LOCALHOST])]);

        service.stop_vm("sandbox-1").await?;
        assert_eq!(service.sandbox_count().await, 0);
        assert_eq!(
            provider.deleted.lock().map(|d| d.clone()).unwrap_or_default(),
            vec!["i-sandbox-1".to_string()]
        );
        assert_eq!(network.teardowns.lock().map(|t| t.len()).unwrap_or_default(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_after_provider_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = Arc::new(FakeProvider {
            fail_create: true,
            ..Default::default()
        });
        let network = Arc::new(FakeNetwork::default());
        let service = cloud_service(dir.path(), 1, provider.clone(), network.clone())?;

        service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;
        let error = service
            .start_vm("sandbox-1", &CancellationToken::new())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("start should fail"))?;
        assert_eq!(error.kind(), ErrorKind::Unavailable);

        service.stop_vm("sandbox-1").await?;
        assert_eq!(service.sandbox_count().await, 0);
        assert!(provider.deleted.lock().map(|d| d.is_empty()).unwrap_or_default());
        assert!(network.setups.lock().map(|s| s.is_empty()).unwrap_or_default());
        assert!(network.teardowns.lock().map(|t| t.is_empty()).unwrap_or_default());
        Ok(())
    }

    #[tokio::test]
    async fn test_get_instance_id_without_started_vm() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = cloud_service(
            dir.path(),
            1,
            Arc::new(FakeProvider::default()),
            Arc::new(FakeNetwork::default()),
        )?;
        service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;

        let ctx = CancellationToken::new();
        let not_started = service.get_instance_id("default", "nginx", false, &ctx).await;
        assert_eq!(not_started.err().map(|e| e.kind()), Some(ErrorKind::NotFound));

        let unknown = service.get_instance_id("default", "redis", false, &ctx).await;
        assert_eq!(unknown.err().map(|e| e.kind()), Some(ErrorKind::NotFound));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let waited = service.get_instance_id("default", "nginx", true, &ctx).await;
        assert_eq!(waited.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_vm_interrupted_by_context() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let reserved = TcpListener::bind("127.0.0.1:0").await?;
        let port = reserved.local_addr()?.port();
        drop(reserved);

        let service = cloud_service(
            dir.path(),
            port,
            Arc::new(FakeProvider::default()),
            Arc::new(FakeNetwork::default()),
        )?;
        service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let result = service.start_vm("sandbox-1", &ctx).await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
        {
            let sandboxes = service.sandboxes.lock().await;
            let sandbox = sandboxes
                .get("sandbox-1")
                .ok_or_else(|| anyhow::anyhow!("sandbox missing"))?;
            assert!(sandbox.get_proxy().is_shut_down());
        }

        service.stop_vm("sandbox-1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_start_vm_interrupted_while_creating_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = Arc::new(FakeProvider {
            create_delay: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        let service = cloud_service(
            dir.path(),
            0,
            provider.clone(),
            Arc::new(FakeNetwork::default()),
        )?;
        service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = service.start_vm("sandbox-1", &ctx).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
        assert!(provider.created.lock().map(|c| c.is_empty()).unwrap_or_default());

        service.stop_vm("sandbox-1").await?;
        assert!(provider.deleted.lock().map(|d| d.is_empty()).unwrap_or_default());
        Ok(())
    }

    #[tokio::test]
    async fn test_teardown_stops_proxies_and_provider() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = Arc::new(FakeProvider::default());
        let network = Arc::new(FakeNetwork::default());
        let service = cloud_service(dir.path(), 1, provider.clone(), network)?;
        service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;

        service.teardown().await?;
        assert!(provider.torn_down.lock().map(|t| *t).unwrap_or_default());
        let sandboxes = service.sandboxes.lock().await;
        assert!(sandboxes.values().all(|sandbox| sandbox.get_proxy().is_shut_down()));
        Ok(())
    }
}
