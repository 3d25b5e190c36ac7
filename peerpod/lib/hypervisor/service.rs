use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::{
    cloud::CloudService,
    ttrpc::{Empty, Request, Service, Status},
    PeerpodError, PeerpodResult,
};

use super::{
    CreateVmRequest, CreateVmResponse, GetInfoRequest, GetInfoResponse, StartVmRequest,
    StopVmRequest, VersionResponse, HYPERVISOR_SERVICE, POD_VM_INFO_SERVICE,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The hypervisor surface the container runtime drives sandboxes through.
#[derive(Clone)]
pub struct HypervisorService {
    cloud: Arc<CloudService>,
    shutdown: CancellationToken,
}

/// Tells which pod VM hosts a pod.
#[derive(Clone)]
pub struct PodVmInfoService {
    cloud: Arc<CloudService>,
    shutdown: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorService {
    /// Creates the surface. In-flight calls are interrupted when `shutdown` is cancelled.
    pub fn new(cloud: Arc<CloudService>, shutdown: CancellationToken) -> Self {
        Self { cloud, shutdown }
    }

    async fn create_vm(&self, request: CreateVmRequest) -> PeerpodResult<CreateVmResponse> {
        let socket_path = self
            .cloud
            .create_vm(
                &request.id,
                &request.annotations,
                Path::new(&request.network_namespace_path),
            )
            .await?;
        Ok(CreateVmResponse {
            agent_socket_path: socket_path.display().to_string(),
        })
    }

    /// Runs `StartVM` detached from the request so that an abandoned request still cancels its
    /// context and lets the agent proxy be shut down.
    async fn start_vm(&self, request: StartVmRequest) -> PeerpodResult<Empty> {
        let ctx = self.shutdown.child_token();
        let _cancel_on_drop = ctx.clone().drop_guard();
        let cloud = self.cloud.clone();
        tokio::spawn(async move { cloud.start_vm(&request.id, &ctx).await }).await??;
        Ok(Empty {})
    }

    async fn stop_vm(&self, request: StopVmRequest) -> PeerpodResult<Empty> {
        self.cloud.stop_vm(&request.id).await?;
        Ok(Empty {})
    }
}

impl PodVmInfoService {
    /// Creates the surface. Waiting calls fail once `shutdown` is cancelled.
    pub fn new(cloud: Arc<CloudService>, shutdown: CancellationToken) -> Self {
        Self { cloud, shutdown }
    }

    /// Waits on a per-request context, so a waiting call ends when its request is abandoned.
    async fn get_info(&self, request: GetInfoRequest) -> PeerpodResult<GetInfoResponse> {
        let ctx = self.shutdown.child_token();
        let _cancel_on_drop = ctx.clone().drop_guard();
        let vm_id = self
            .cloud
            .get_instance_id(&request.pod_namespace, &request.pod_name, request.wait, &ctx)
            .await?;
        Ok(GetInfoResponse { vm_id })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn decode<M: Message + Default>(payload: &[u8]) -> Result<M, Status> {
    M::decode(payload).map_err(|e| Status::from(PeerpodError::from(e)))
}

fn encode<M: Message>(result: PeerpodResult<M>) -> Result<Vec<u8>, Status> {
    result.map(|message| message.encode_to_vec()).map_err(Status::from)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Service for HypervisorService {
    async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
        match request.method.as_str() {
            "Version" => encode(Ok(VersionResponse {
                version: self.cloud.version().to_string(),
            })),
            "CreateVM" => encode(self.create_vm(decode(&request.payload)?).await),
            "StartVM" => encode(self.start_vm(decode(&request.payload)?).await),
            "StopVM" => encode(self.stop_vm(decode(&request.payload)?).await),
            method => Err(Status::unimplemented(HYPERVISOR_SERVICE, method)),
        }
    }
}

#[async_trait]
impl Service for PodVmInfoService {
    async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
        match request.method.as_str() {
            "GetInfo" => encode(self.get_info(decode(&request.payload)?).await),
            method => Err(Status::unimplemented(POD_VM_INFO_SERVICE, method)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        cloud::testing::{FakeNetwork, FakeProvider},
        config::ServerConfig,
        ErrorKind,
    };

    use super::*;

    fn info_service(dir: &Path, shutdown: CancellationToken) -> anyhow::Result<PodVmInfoService> {
        let config = ServerConfig::builder()
            .socket_path(dir.join("hypervisor.sock"))
            .pods_dir(dir.join("pods"))
            .build();
        let cloud = CloudService::new(
            Arc::new(FakeProvider::default()),
            Arc::new(FakeNetwork::default()),
            config,
        )?;
        Ok(PodVmInfoService::new(Arc::new(cloud), shutdown))
    }

    fn waiting_request() -> GetInfoRequest {
        GetInfoRequest {
            pod_name: "nginx".into(),
            pod_namespace: "default".into(),
            wait: true,
        }
    }

    #[tokio::test]
    async fn test_abandoned_get_info_leaves_shutdown_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let shutdown = CancellationToken::new();
        let service = info_service(dir.path(), shutdown.clone())?;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), service.get_info(waiting_request()))
                .await;
        assert!(abandoned.is_err());
        assert!(!shutdown.is_cancelled());

        let waiting = tokio::spawn({
            let service = service.clone();
            async move { service.get_info(waiting_request()).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), waiting).await??;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
        Ok(())
    }
}
