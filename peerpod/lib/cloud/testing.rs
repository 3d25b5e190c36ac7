//! Fakes for exercising the sandbox lifecycle without a cloud or network privileges.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{AGENT_SERVICE, HEALTH_SERVICE},
    config::ServerConfig,
    podnetwork::WorkerNetwork,
    provider::{Instance, InstanceTypeSpec, Provider},
    ttrpc::{Request, Server, Service, Status},
    tunneler::NetworkConfig,
    PeerpodError, PeerpodResult,
};

use super::{CloudService, SANDBOX_NAME, SANDBOX_NAMESPACE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A provider whose instances all live at `127.0.0.1`.
#[derive(Default)]
pub(crate) struct FakeProvider {
    pub(crate) fail_create: bool,
    pub(crate) create_delay: Option<Duration>,
    pub(crate) created: Mutex<Vec<(String, String, String)>>,
    pub(crate) deleted: Mutex<Vec<String>>,
    pub(crate) torn_down: Mutex<bool>,
}

/// A worker network that records calls instead of touching the kernel.
#[derive(Default)]
pub(crate) struct FakeNetwork {
    pub(crate) setups: Mutex<Vec<(PathBuf, Vec<Ipv4Addr>)>>,
    pub(crate) teardowns: Mutex<Vec<PathBuf>>,
}

struct NullAgent;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves a pod VM forwarder on an ephemeral local port and returns the port.
pub(crate) async fn spawn_pod_vm() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address: SocketAddr = listener.local_addr()?;
    let agent = Arc::new(NullAgent);
    let server = Server::new()
        .register(AGENT_SERVICE, agent.clone())
        .register(HEALTH_SERVICE, agent);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.serve_connection(stream, CancellationToken::new()).await;
            });
        }
    });
    Ok(address.port())
}

pub(crate) fn pod_annotations(name: &str) -> HashMap<String, String> {
    HashMap::from([
        (SANDBOX_NAME.to_string(), name.to_string()),
        (SANDBOX_NAMESPACE.to_string(), "default".to_string()),
    ])
}

/// A service keeping its sandboxes under `pods_dir` and dialing pod VMs on `port`.
pub(crate) fn cloud_service(
    pods_dir: &Path,
    port: u16,
    provider: Arc<FakeProvider>,
    network: Arc<FakeNetwork>,
) -> anyhow::Result<CloudService> {
    let config = ServerConfig::builder()
        .pods_dir(pods_dir)
        .forwarder_port(port)
        .proxy_timeout(Duration::from_secs(10))
        .build();
    Ok(CloudService::new(provider, network, config)?)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Provider for FakeProvider {
    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        user_data: &str,
        _spec: &InstanceTypeSpec,
    ) -> PeerpodResult<Instance> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create {
            return Err(PeerpodError::Unavailable("no capacity".into()));
        }
        if let Ok(mut created) = self.created.lock() {
            created.push((pod_name.into(), sandbox_id.into(), user_data.into()));
        }
        Ok(Instance::builder()
            .id(format!("i-{sandbox_id}"))
            .name(format!("podvm-{pod_name}"))
            .ips(vec![Ipv4Addr::LOCALHOST])
            .build())
    }

    async fn delete_instance(
        &self,
        _ctx: &CancellationToken,
        instance_id: &str,
    ) -> PeerpodResult<()> {
        if let Ok(mut deleted) = self.deleted.lock() {
            deleted.push(instance_id.into());
        }
        Ok(())
    }

    async fn teardown(&self) -> PeerpodResult<()> {
        if let Ok(mut torn_down) = self.torn_down.lock() {
            *torn_down = true;
        }
        Ok(())
    }

    async fn config_verifier(&self) -> PeerpodResult<()> {
        Ok(())
    }
}

#[async_trait]
impl WorkerNetwork for FakeNetwork {
    async fn inspect(&self, _ns_path: &Path) -> PeerpodResult<NetworkConfig> {
        Ok(NetworkConfig::builder()
            .pod_ip("172.16.0.2/24".parse().map_err(PeerpodError::custom)?)
            .interface_name("eth0")
            .worker_node_ip("10.224.0.4/16".parse().map_err(PeerpodError::custom)?)
            .mtu(1500)
            .build())
    }

    async fn setup(
        &self,
        ns_path: &Path,
        pod_node_ips: &[Ipv4Addr],
        _config: &NetworkConfig,
    ) -> PeerpodResult<()> {
        if let Ok(mut setups) = self.setups.lock() {
            setups.push((ns_path.to_path_buf(), pod_node_ips.to_vec()));
        }
        Ok(())
    }

    async fn teardown(&self, ns_path: &Path, _config: &NetworkConfig) -> PeerpodResult<()> {
        if let Ok(mut teardowns) = self.teardowns.lock() {
            teardowns.push(ns_path.to_path_buf());
        }
        Ok(())
    }
}

#[async_trait]
impl Service for NullAgent {
    async fn handle(&self, _request: Request) -> Result<Vec<u8>, Status> {
        Ok(Vec::new())
    }
}
