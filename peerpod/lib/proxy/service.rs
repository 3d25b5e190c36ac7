use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use prost::Message;
use tracing::{debug, info, warn, Instrument, Span};

use crate::{
    agent::{
        agent_method, annotate_volume_targets, csi_volume_targets, image_name, is_agent_method,
        pulls_in_guest, set_oci_annotation, strip_dns, AgentMethod, ContainerRequest,
        CreateContainerRequest, CreateSandboxRequest, PullImageRequest, PullImageResponse,
        Redirector, SetPolicyRequest, CRI_IMAGE_NAME,
    },
    ttrpc::{Request, Service, Status},
    utils::{self, retry_times, ExponentialBackoff},
    PeerpodError, PeerpodResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many times `PullImage` is attempted before `CreateContainer` fails.
const PULL_IMAGE_ATTEMPTS: u32 = 10;

/// The prefix of image references that are bare digests.
const DIGEST_PREFIX: &str = "sha256:";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The agent surface served on the worker: applies the worker-side request policy and forwards
/// everything through the [`Redirector`].
pub struct ProxyService {
    redirector: Arc<Redirector>,
    pause_image: String,
    direct_volumes_dir: PathBuf,
    pull_image_before_create: bool,
    pull_backoff: ExponentialBackoff,
    span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProxyService {
    /// Creates a service forwarding through `redirector`.
    pub fn new(
        redirector: Arc<Redirector>,
        pause_image: impl Into<String>,
        direct_volumes_dir: impl Into<PathBuf>,
        pull_image_before_create: bool,
        span: Span,
    ) -> Self {
        Self {
            redirector,
            pause_image: pause_image.into(),
            direct_volumes_dir: direct_volumes_dir.into(),
            pull_image_before_create,
            pull_backoff: utils::default_policy(),
            span,
        }
    }

    /// Overrides the delays between `PullImage` attempts.
    pub fn with_pull_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.pull_backoff = backoff;
        self
    }

    /// Rewrites a `CreateContainer` payload: records CSI volume targets and, when enabled, pulls
    /// the container image through the agent first.
    async fn create_container(
        &self,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> PeerpodResult<Vec<u8>> {
        let view = CreateContainerRequest::decode(payload)?;
        info!(container_id = %view.container_id, "CreateContainer");
        for mount in view.mounts() {
            debug!(destination = %mount.destination, source = %mount.source, kind = %mount.r#type, "mount");
        }
        for storage in &view.storages {
            debug!(
                mount_point = %storage.mount_point,
                source = %storage.source,
                fstype = %storage.fstype,
                driver = %storage.driver,
                "storage"
            );
        }

        let targets = csi_volume_targets(&view, &self.direct_volumes_dir);
        if !targets.is_empty() {
            info!(container_id = %view.container_id, ?targets, "recording CSI volume targets");
        }
        let mut payload = annotate_volume_targets(payload, &view, &targets)?;

        if !self.pull_image_before_create {
            return Ok(payload);
        }

        if pulls_in_guest(&view.storages) {
            info!(container_id = %view.container_id, "image is pulled in the guest, skipping PullImage");
            return Ok(payload);
        }

        let annotations = view
            .oci
            .as_ref()
            .map(|oci| oci.annotations.clone())
            .unwrap_or_default();
        let Some(image) = image_name(&annotations, &self.pause_image) else {
            warn!(container_id = %view.container_id, "container image name is not annotated, skipping PullImage");
            return Ok(payload);
        };

        if image.starts_with(DIGEST_PREFIX) {
            warn!(container_id = %view.container_id, %image, "cannot resolve a digest to an image name, skipping PullImage");
            return Ok(payload);
        }

        self.pull_image(&image, &view.container_id, timeout).await?;
        payload = set_oci_annotation(&payload, CRI_IMAGE_NAME, &image)?;
        Ok(payload)
    }

    async fn pull_image(
        &self,
        image: &str,
        container_id: &str,
        timeout: Option<Duration>,
    ) -> PeerpodResult<()> {
        info!(%image, %container_id, "calling PullImage before CreateContainer");
        let request = PullImageRequest {
            image: image.to_string(),
            container_id: container_id.to_string(),
        };

        let response = retry_times(PULL_IMAGE_ATTEMPTS, self.pull_backoff.clone(), || {
            self.redirector
                .call::<_, PullImageResponse>("PullImage", &request, timeout)
        })
        .await
        .inspect_err(|e| warn!(%image, error = %e, "PullImage failed"))?;

        info!(%image, image_ref = %response.image_ref, "pulled image");
        Ok(())
    }

    async fn handle_inner(&self, mut request: Request) -> Result<Vec<u8>, Status> {
        match agent_method(&request.service, &request.method) {
            AgentMethod::CreateContainer => {
                request.payload = self
                    .create_container(&request.payload, request.timeout())
                    .await?;
            }
            AgentMethod::CreateSandbox => {
                let view = CreateSandboxRequest::decode(request.payload.as_slice())
                    .map_err(PeerpodError::from)?;
                info!(sandbox_id = %view.sandbox_id, hostname = %view.hostname, dns = ?view.dns, "CreateSandbox");
                request.payload = strip_dns(&request.payload)?;
            }
            AgentMethod::SetPolicy => {
                let view = SetPolicyRequest::decode(request.payload.as_slice())
                    .map_err(PeerpodError::from)?;
                info!(policy = %view.policy, "SetPolicy");
            }
            AgentMethod::StartContainer | AgentMethod::RemoveContainer => {
                let view = ContainerRequest::decode(request.payload.as_slice())
                    .map_err(PeerpodError::from)?;
                info!(method = %request.method, container_id = %view.container_id, "container request");
            }
            AgentMethod::DestroySandbox => info!("DestroySandbox"),
            AgentMethod::PullImage | AgentMethod::Other => {}
        }

        let method = request.method.clone();
        self.redirector
            .forward(request)
            .await
            .inspect_err(|status| debug!(%method, code = status.code, message = %status.message, "agent call failed"))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Service for ProxyService {
    async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
        if !is_agent_method(&request.service, &request.method) {
            return Err(Status::unimplemented(&request.service, &request.method));
        }
        self.handle_inner(request).instrument(self.span.clone()).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use base64::{engine::general_purpose::URL_SAFE, Engine};
    use tokio_util::sync::CancellationToken;

    use crate::{
        agent::{
            AgentStream, Dialer, Mount, OciSpec, Storage, AGENT_SERVICE, IMAGE_GUEST_PULL_DRIVER,
            VOLUME_TARGET_PATH_KEY,
        },
        ttrpc::Server,
    };

    use super::*;

    /// Records the decoded requests an agent receives.
    #[derive(Default)]
    struct RecordingAgent {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
        failing_pulls: Mutex<u32>,
    }

    #[async_trait]
    impl Service for RecordingAgent {
        async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((request.method.clone(), request.payload.clone()));
            }
            if request.method == "PullImage" {
                if let Ok(mut failing) = self.failing_pulls.lock() {
                    if *failing > 0 {
                        *failing -= 1;
                        return Err(Status::new(14, "registry unavailable"));
                    }
                }
                return Ok(PullImageResponse {
                    image_ref: "resolved".into(),
                }
                .encode_to_vec());
            }
            Ok(Vec::new())
        }
    }

    struct InMemoryDialer(Arc<RecordingAgent>);

    #[async_trait]
    impl Dialer for InMemoryDialer {
        async fn dial(&self) -> PeerpodResult<Box<dyn AgentStream>> {
            let (near, far) = tokio::io::duplex(1 << 16);
            let server = Server::new().register(AGENT_SERVICE, self.0.clone());
            tokio::spawn(async move { server.serve_connection(far, CancellationToken::new()).await });
            Ok(Box::new(near))
        }
    }

    fn service(agent: &Arc<RecordingAgent>, volumes: &std::path::Path, pull: bool) -> ProxyService {
        let redirector = Arc::new(Redirector::new(Arc::new(InMemoryDialer(agent.clone()))));
        ProxyService::new(redirector, "", volumes, pull, Span::none()).with_pull_backoff(
            utils::exponential_policy(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn request(method: &str, payload: Vec<u8>) -> Request {
        Request {
            service: AGENT_SERVICE.into(),
            method: method.into(),
            payload,
            ..Default::default()
        }
    }

    fn calls(agent: &RecordingAgent) -> Vec<(String, Vec<u8>)> {
        agent.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn create_container(image: &str, mounts: Vec<Mount>, storages: Vec<Storage>) -> Vec<u8> {
        CreateContainerRequest {
            container_id: "c1".into(),
            storages,
            oci: Some(OciSpec {
                mounts,
                annotations: HashMap::from([(
                    "io.kubernetes.cri.image-name".to_string(),
                    image.to_string(),
                )]),
                linux: None,
            }),
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn test_create_sandbox_strips_dns() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let agent = Arc::new(RecordingAgent::default());
        let service = service(&agent, dir.path(), false);

        let payload = CreateSandboxRequest {
            hostname: "pod".into(),
            dns: vec!["nameserver 10.96.0.10".into()],
            sandbox_id: "sb".into(),
            ..Default::default()
        }
        .encode_to_vec();
        service.handle(request("CreateSandbox", payload)).await.map_err(|s| anyhow::anyhow!(s.message))?;

        let calls = calls(&agent);
        assert_eq!(calls.len(), 1);
        let forwarded = CreateSandboxRequest::decode(calls[0].1.as_slice())?;
        assert!(forwarded.dns.is_empty());
        assert_eq!(forwarded.hostname, "pod");
        assert_eq!(forwarded.sandbox_id, "sb");
        Ok(())
    }

    #[tokio::test]
    async fn test_create_container_records_volume_targets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = "/var/lib/kubelet/pods/uid/volumes/kubernetes.io~csi/pvc-1/mount";
        std::fs::create_dir(dir.path().join(URL_SAFE.encode(source)))?;

        let agent = Arc::new(RecordingAgent::default());
        let service = service(&agent, dir.path(), false);
        let mounts = vec![
            Mount {
                destination: "/etc/hosts".into(),
                source: "/run/hosts".into(),
                r#type: "bind".into(),
            },
            Mount {
                destination: "/data".into(),
                source: source.into(),
                r#type: "bind".into(),
            },
        ];
        service
            .handle(request("CreateContainer", create_container("nginx", mounts, vec![])))
            .await
            .map_err(|s| anyhow::anyhow!(s.message))?;

        let calls = calls(&agent);
        assert_eq!(calls.len(), 1);
        let forwarded = CreateContainerRequest::decode(calls[0].1.as_slice())?;
        assert_eq!(forwarded.annotation(VOLUME_TARGET_PATH_KEY), Some(source));
        assert_eq!(forwarded.mounts().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_container_pulls_image_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let agent = Arc::new(RecordingAgent {
            failing_pulls: Mutex::new(2),
            ..Default::default()
        });
        let service = service(&agent, dir.path(), true);

        service
            .handle(request("CreateContainer", create_container("docker.io/nginx:1", vec![], vec![])))
            .await
            .map_err(|s| anyhow::anyhow!(s.message))?;

        let calls = calls(&agent);
        let methods: Vec<_> = calls.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, ["PullImage", "PullImage", "PullImage", "CreateContainer"]);

        let pull = PullImageRequest::decode(calls[0].1.as_slice())?;
        assert_eq!(pull.image, "docker.io/nginx:1");
        assert_eq!(pull.container_id, "c1");

        let forwarded = CreateContainerRequest::decode(calls[3].1.as_slice())?;
        assert_eq!(forwarded.annotation(CRI_IMAGE_NAME), Some("docker.io/nginx:1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_container_skips_pull_for_guest_pull_and_digests() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let agent = Arc::new(RecordingAgent::default());
        let service = service(&agent, dir.path(), true);

        let guest_pull = vec![Storage {
            driver: IMAGE_GUEST_PULL_DRIVER.into(),
            ..Default::default()
        }];
        service
            .handle(request("CreateContainer", create_container("nginx", vec![], guest_pull)))
            .await
            .map_err(|s| anyhow::anyhow!(s.message))?;
        service
            .handle(request("CreateContainer", create_container("sha256:abcd", vec![], vec![])))
            .await
            .map_err(|s| anyhow::anyhow!(s.message))?;

        let methods: Vec<_> = calls(&agent).into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, ["CreateContainer", "CreateContainer"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_methods_are_not_forwarded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let agent = Arc::new(RecordingAgent::default());
        let service = service(&agent, dir.path(), false);

        let status = service
            .handle(request("NoSuchMethod", Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(status.code, 12);
        assert!(calls(&agent).is_empty());
        Ok(())
    }
}
