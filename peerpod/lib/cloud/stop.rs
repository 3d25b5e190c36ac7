use tracing::{info, info_span, warn, Instrument};

use crate::{PeerpodError, PeerpodResult};

use super::{CloudService, SandboxState};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudService {
    /// Releases a sandbox: stops its agent proxy, deletes its pod VM and disconnects the pod
    /// network, in that order.
    ///
    /// Every step after the lookup is best effort; failures are logged and the sandbox is removed
    /// regardless. A sandbox that never got an instance skips the deletion, one whose tunnel was
    /// never set up skips the teardown.
    pub async fn stop_vm(&self, sandbox_id: &str) -> PeerpodResult<()> {
        async {
            let (proxy, instance_id, net_ns_path, network, network_setup) = {
                let mut sandboxes = self.sandboxes.lock().await;
                let sandbox = sandboxes.get_mut(sandbox_id).ok_or_else(|| {
                    warn!("stopping unknown sandbox");
                    PeerpodError::NotFound(format!("sandbox {sandbox_id} does not exist"))
                })?;
                sandbox.set_state(SandboxState::Stopping);
                (
                    sandbox.get_proxy().clone(),
                    sandbox.get_instance_id().clone(),
                    sandbox.get_net_ns_path().clone(),
                    sandbox.get_network().clone(),
                    *sandbox.get_network_setup(),
                )
            };

            proxy.shutdown();

            if !instance_id.is_empty() {
                let ctx = self.shutdown.child_token();
                match self.provider.delete_instance(&ctx, &instance_id).await {
                    Ok(()) => info!(instance_id = %instance_id, "deleted instance"),
                    Err(e) => {
                        warn!(instance_id = %instance_id, error = %e, "failed to delete instance")
                    }
                }
            }

            if network_setup {
                if let Err(e) = self.network.teardown(&net_ns_path, &network).await {
                    warn!(
                        netns = %net_ns_path.display(),
                        error = %e,
                        "failed to tear down pod network"
                    );
                }
            }

            self.sandboxes.lock().await.remove(sandbox_id);
            self.changed.notify_waiters();
            info!("stopped sandbox");
            Ok(())
        }
        .instrument(info_span!(parent: &self.span, "stop_vm", sandbox_id))
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        cloud::testing::{cloud_service, FakeNetwork, FakeProvider},
        ErrorKind,
    };

    #[tokio::test]
    async fn test_stop_unknown_sandbox() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = Arc::new(FakeProvider::default());
        let network = Arc::new(FakeNetwork::default());
        let service = cloud_service(dir.path(), 1, provider.clone(), network)?;

        let result = service.stop_vm("missing").await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        assert!(provider.deleted.lock().map(|d| d.is_empty()).unwrap_or_default());
        Ok(())
    }
}
