use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use procfs::{
    process::{MountInfos, Process},
    FromRead,
};
use prost::Message;
use tokio::net::UnixStream;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::{
    agent::{
        add_network_namespace, agent_method, is_agent_method, AgentMethod, AgentStream,
        ContainerRequest, CreateContainerRequest, CreateSandboxRequest, Dialer, Redirector,
        VOLUME_TARGET_PATH_KEY,
    },
    config::{AGENT_DIAL_TIMEOUT, VOLUME_MOUNT_WAIT_INTERVAL, VOLUME_MOUNT_WAIT_TIMEOUT},
    ttrpc::{Request, Service, Status},
    utils::{self, retry_until, ExponentialBackoff},
    PeerpodError, PeerpodResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const BIND_MOUNT_TYPE: &str = "bind";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Dials the agent's unix socket inside the pod VM, retrying while the agent is starting.
#[derive(Debug, Clone)]
pub struct AgentSocketDialer {
    socket_path: PathBuf,
    timeout: Duration,
    backoff: ExponentialBackoff,
}

/// Serves the agent surface on the pod VM and relays it to the local agent.
///
/// `CreateContainer` is adjusted on the way: the container joins the pod network namespace, missing
/// bind mount sources are created, and the call is held back until the CSI volumes it uses are
/// mounted.
pub struct Interceptor {
    redirector: Arc<Redirector>,
    pod_ns_path: PathBuf,
    mountinfo_path: Option<PathBuf>,
    mount_wait_timeout: Duration,
    mount_wait_interval: Duration,
    span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentSocketDialer {
    /// Creates a dialer for the agent socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: AGENT_DIAL_TIMEOUT,
            backoff: utils::default_policy(),
        }
    }

    /// Gives up dialing after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Interceptor {
    /// Creates an interceptor relaying through `redirector`. Containers join the network namespace
    /// at `pod_ns_path`.
    pub fn new(redirector: Arc<Redirector>, pod_ns_path: impl Into<PathBuf>) -> Self {
        Self {
            redirector,
            pod_ns_path: pod_ns_path.into(),
            mountinfo_path: None,
            mount_wait_timeout: VOLUME_MOUNT_WAIT_TIMEOUT,
            mount_wait_interval: VOLUME_MOUNT_WAIT_INTERVAL,
            span: info_span!("interceptor"),
        }
    }

    /// Creates an interceptor for the agent listening on `agent_socket`.
    pub fn for_agent_socket(agent_socket: impl Into<PathBuf>, pod_ns_path: impl Into<PathBuf>) -> Self {
        let dialer = AgentSocketDialer::new(agent_socket);
        Self::new(Arc::new(Redirector::new(Arc::new(dialer))), pod_ns_path)
    }

    /// Reads the mount table from `path` instead of the forwarder's own `mountinfo`.
    pub fn with_mountinfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo_path = Some(path.into());
        self
    }

    /// Sets how long and how often `CreateContainer` checks for its volume mounts.
    pub fn with_mount_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.mount_wait_timeout = timeout;
        self.mount_wait_interval = interval;
        self
    }

    /// Closes the agent connection.
    pub async fn close(&self) {
        self.redirector.close().await
    }

    async fn create_container(&self, payload: &[u8]) -> PeerpodResult<Vec<u8>> {
        let view = CreateContainerRequest::decode(payload)?;
        info!(container_id = %view.container_id, "CreateContainer");

        let payload = add_network_namespace(payload, &self.pod_ns_path)?;
        debug!(ns = %self.pod_ns_path.display(), "container joins the pod network namespace");

        let targets: Vec<&str> = view
            .annotation(VOLUME_TARGET_PATH_KEY)
            .map(|value| value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        for mount in view.mounts() {
            if mount.r#type == BIND_MOUNT_TYPE && !Path::new(&mount.source).exists() {
                info!(source = %mount.source, "mount source does not exist, creating it");
                if let Err(e) = tokio::fs::create_dir_all(&mount.source).await {
                    warn!(source = %mount.source, error = %e, "failed to create mount source");
                }
            }

            if targets.contains(&mount.source.as_str()) {
                self.wait_for_mount(Path::new(&mount.source)).await?;
            }
        }

        Ok(payload)
    }

    async fn wait_for_mount(&self, path: &Path) -> PeerpodResult<()> {
        info!(path = %path.display(), "waiting for a device to be mounted");
        let policy = utils::fixed_policy(self.mount_wait_interval);
        retry_until("volume mount check", self.mount_wait_timeout, policy, || async {
            let source = self.mountinfo_path.clone();
            let mounts =
                tokio::task::spawn_blocking(move || read_mountinfo(source.as_deref())).await??;
            if is_mounted(&mounts, path) {
                Ok(())
            } else {
                Err(PeerpodError::NotFound(format!(
                    "no device is mounted to {}",
                    path.display()
                )))
            }
        })
        .await
        .inspect(|_| info!(path = %path.display(), "device is mounted"))
        .inspect_err(|e| warn!(path = %path.display(), error = %e, "volume was not mounted"))
    }

    async fn handle_inner(&self, mut request: Request) -> Result<Vec<u8>, Status> {
        match agent_method(&request.service, &request.method) {
            AgentMethod::CreateContainer => {
                request.payload = self.create_container(&request.payload).await?;
            }
            AgentMethod::CreateSandbox => {
                let view = CreateSandboxRequest::decode(request.payload.as_slice())
                    .map_err(PeerpodError::from)?;
                info!(sandbox_id = %view.sandbox_id, hostname = %view.hostname, "CreateSandbox");
            }
            AgentMethod::StartContainer | AgentMethod::RemoveContainer => {
                let view = ContainerRequest::decode(request.payload.as_slice())
                    .map_err(PeerpodError::from)?;
                info!(method = %request.method, container_id = %view.container_id, "container request");
            }
            AgentMethod::DestroySandbox => info!("DestroySandbox"),
            _ => {}
        }

        let method = request.method.clone();
        self.redirector
            .forward(request)
            .await
            .inspect_err(|status| warn!(%method, code = status.code, message = %status.message, "agent call failed"))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads the mount table at `path`, or the calling process's own when `path` is `None`.
pub fn read_mountinfo(path: Option<&Path>) -> PeerpodResult<MountInfos> {
    let mounts = match path {
        Some(path) => MountInfos::from_file(path)?,
        None => Process::myself()?.mountinfo()?,
    };
    Ok(mounts)
}

/// Whether `path` is a mount point in `mounts`.
pub fn is_mounted(mounts: &MountInfos, path: &Path) -> bool {
    let cleaned: PathBuf = path.components().collect();
    mounts.iter().any(|mount| mount.mount_point == cleaned)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Dialer for AgentSocketDialer {
    async fn dial(&self) -> PeerpodResult<Box<dyn AgentStream>> {
        info!(socket = %self.socket_path.display(), "connecting to the agent");
        let stream = retry_until("agent connection", self.timeout, self.backoff.clone(), || async {
            Ok(UnixStream::connect(&self.socket_path).await?)
        })
        .await
        .inspect_err(|e| warn!(socket = %self.socket_path.display(), error = %e, "failed to connect to the agent"))?;

        info!(socket = %self.socket_path.display(), "connected to the agent");
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Service for Interceptor {
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
