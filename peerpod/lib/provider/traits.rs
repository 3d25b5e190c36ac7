use tokio_util::sync::CancellationToken;

use crate::PeerpodResult;

use super::{Instance, InstanceTypeSpec};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// An IaaS backend that provisions pod VMs.
///
/// Providers are opaque to the sandbox lifecycle service; it calls them without retrying and
/// surfaces their errors unchanged. `ctx` is cancelled when the caller gives up; long-running
/// provider calls should stop at that point.
#[async_trait::async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Provisions a pod VM for the sandbox and returns it once the provider considers it created.
    ///
    /// `user_data` is the serialized cloud-config handed to the VM at first boot.
    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        user_data: &str,
        spec: &InstanceTypeSpec,
    ) -> PeerpodResult<Instance>;

    /// Releases a pod VM.
    async fn delete_instance(
        &self,
        ctx: &CancellationToken,
        instance_id: &str,
    ) -> PeerpodResult<()>;

    /// Releases provider-wide resources when the adaptor shuts down.
    async fn teardown(&self) -> PeerpodResult<()>;

    /// Checks that the provider's configuration is usable.
    async fn config_verifier(&self) -> PeerpodResult<()>;
}
