use std::{net::Ipv4Addr, path::Path};

use crate::{tunneler::NetworkConfig, PeerpodResult};

use super::WorkerNode;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The worker half of pod networking as the sandbox lifecycle sees it.
#[async_trait::async_trait]
pub trait WorkerNetwork: Send + Sync + 'static {
    /// Describes the pod network of the namespace at `ns_path`.
    async fn inspect(&self, ns_path: &Path) -> PeerpodResult<NetworkConfig>;

    /// Connects the namespace to the pod VM reachable at `pod_node_ips`.
    async fn setup(
        &self,
        ns_path: &Path,
        pod_node_ips: &[Ipv4Addr],
        config: &NetworkConfig,
    ) -> PeerpodResult<()>;

    /// Disconnects the namespace from its pod VM.
    async fn teardown(&self, ns_path: &Path, config: &NetworkConfig) -> PeerpodResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl WorkerNetwork for WorkerNode {
    async fn inspect(&self, ns_path: &Path) -> PeerpodResult<NetworkConfig> {
        WorkerNode::inspect(self, ns_path).await
    }

    async fn setup(
        &self,
        ns_path: &Path,
        pod_node_ips: &[Ipv4Addr],
        config: &NetworkConfig,
    ) -> PeerpodResult<()> {
        WorkerNode::setup(self, ns_path, pod_node_ips, config).await
    }

    async fn teardown(&self, ns_path: &Path, config: &NetworkConfig) -> PeerpodResult<()> {
        WorkerNode::teardown(self, ns_path, config).await
    }
}
