use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::{proxy::spawn_agent_proxy, PeerpodError, PeerpodResult};

use super::{CloudService, SandboxState};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudService {
    /// Provisions the pod VM of a sandbox, connects the pod network to it and starts the agent
    /// proxy.
    ///
    /// Returns once the agent proxy serves. Cancelling `ctx` before then, including while the
    /// provider is still creating the instance, fails with [`PeerpodError::DeadlineExceeded`] and
    /// shuts down whatever was started. A failed provider call is surfaced unchanged
    /// and leaves the sandbox registered without an instance.
    pub async fn start_vm(&self, sandbox_id: &str, ctx: &CancellationToken) -> PeerpodResult<()> {
        async {
            let (pod_name, net_ns_path, spec, network, user_data, proxy) = {
                let sandboxes = self.sandboxes.lock().await;
                let sandbox = sandboxes.get(sandbox_id).ok_or_else(|| {
                    PeerpodError::NotFound(format!("sandbox {sandbox_id} does not exist"))
                })?;
                (
                    sandbox.get_pod_name().clone(),
                    sandbox.get_net_ns_path().clone(),
                    sandbox.get_spec().clone(),
                    sandbox.get_network().clone(),
                    sandbox.get_user_data().clone(),
                    sandbox.get_proxy().clone(),
                )
            };

            let create =
                self.provider.create_instance(ctx, &pod_name, sandbox_id, &user_data, &spec);
            let instance = tokio::select! {
                _ = ctx.cancelled() => {
                    warn!("creation of the instance interrupted");
                    return Err(PeerpodError::DeadlineExceeded(format!(
                        "start of sandbox {sandbox_id} interrupted while creating its instance"
                    )));
                }
                created = create => {
                    created.inspect_err(|e| warn!(error = %e, "failed to create an instance"))?
                }
            };

            self.update_sandbox(sandbox_id, |sandbox| {
                sandbox.set_instance(instance.get_id(), instance.get_name());
            })
            .await?;
            self.changed.notify_waiters();
            info!(
                instance = %instance.get_name(),
                instance_id = %instance.get_id(),
                "created an instance"
            );

            let primary_ip = instance.primary_ip().ok_or_else(|| {
                PeerpodError::Unavailable(format!(
                    "instance {} has no IP address",
                    instance.get_name()
                ))
            })?;

            self.update_sandbox(sandbox_id, |sandbox| sandbox.set_network_setup())
                .await?;
            self.network
                .setup(&net_ns_path, instance.get_ips(), &network)
                .await
                .inspect_err(|e| {
                    warn!(
                        netns = %net_ns_path.display(),
                        error = %e,
                        "failed to set up pod network tunnel"
                    )
                })?;

            let server_addr =
                SocketAddr::new(primary_ip.into(), *self.config.get_forwarder_port());
            let mut task =
                spawn_agent_proxy(proxy.clone(), server_addr, self.shutdown.child_token());

            tokio::select! {
                _ = ctx.cancelled() => {
                    warn!("start of the instance interrupted, cleaning up");
                    proxy.shutdown();
                    return Err(PeerpodError::DeadlineExceeded(format!(
                        "start of sandbox {sandbox_id} interrupted"
                    )));
                }
                result = &mut task => {
                    proxy.shutdown();
                    return match result {
                        Ok(Ok(())) => Err(PeerpodError::Unavailable(
                            "agent proxy stopped before it was ready".into(),
                        )),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(e.into()),
                    };
                }
                _ = proxy.ready() => {}
            }

            self.update_sandbox(sandbox_id, |sandbox| sandbox.set_state(SandboxState::Started))
                .await?;
            info!("agent proxy is ready");
            Ok(())
        }
        .instrument(info_span!(parent: &self.span, "start_vm", sandbox_id))
        .await
    }
}
