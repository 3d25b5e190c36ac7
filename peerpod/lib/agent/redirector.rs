use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use prost::Message;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    ttrpc::{Client, Request, Service, Status},
    PeerpodError, PeerpodResult,
};

use super::{is_agent_method, AGENT_SERVICE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A byte stream an agent connection can run over.
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the connection to the agent a [`Redirector`] forwards to.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Establishes a new connection.
    async fn dial(&self) -> PeerpodResult<Box<dyn AgentStream>>;
}

/// Forwards the agent surface to a peer agent over a lazily dialed ttrpc connection.
///
/// The first call dials the peer; concurrent callers wait for that single attempt and share its
/// outcome. A failed dial is not retried.
pub struct Redirector {
    dialer: Arc<dyn Dialer>,
    state: Mutex<ConnState>,
}

enum ConnState {
    Idle,
    Connected(Client),
    Failed(String),
    Closed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Redirector {
    /// Creates a redirector that dials through `dialer` on first use.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            state: Mutex::new(ConnState::Idle),
        }
    }

    /// Returns the connected client, dialing the peer if no attempt has been made yet.
    pub async fn connect(&self) -> PeerpodResult<Client> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnState::Connected(client) => return Ok(client.clone()),
            ConnState::Failed(reason) => {
                return Err(PeerpodError::Unavailable(format!(
                    "agent connection is not established: {reason}"
                )))
            }
            ConnState::Closed => {
                return Err(PeerpodError::Unavailable(
                    "agent connection is not connected".into(),
                ))
            }
            ConnState::Idle => {}
        }

        match self.dialer.dial().await {
            Ok(stream) => {
                debug!("agent connection established");
                let client = Client::new(stream);
                *state = ConnState::Connected(client.clone());
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "failed to connect to the agent");
                *state = ConnState::Failed(e.to_string());
                Err(PeerpodError::Unavailable(format!(
                    "agent connection is not established: {e}"
                )))
            }
        }
    }

    /// Relays one request and returns the peer's response payload or error status.
    pub async fn forward(&self, request: Request) -> Result<Vec<u8>, Status> {
        let client = self.connect().await.map_err(Status::from)?;
        let response = client.request(request).await.map_err(Status::from)?;
        match response.status {
            Some(status) if !status.is_ok() => Err(status),
            _ => Ok(response.payload),
        }
    }

    /// Calls an agent service method with typed messages.
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        message: &Req,
        timeout: Option<Duration>,
    ) -> PeerpodResult<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let client = self.connect().await?;
        client.call(AGENT_SERVICE, method, message, timeout).await
    }

    /// Closes the connection. Later calls fail.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let ConnState::Connected(client) = &*state {
            info!("closing agent connection");
            client.close();
        }
        *state = ConnState::Closed;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T> AgentStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[async_trait]
impl Service for Redirector {
    async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
        if !is_agent_method(&request.service, &request.method) {
            return Err(Status::unimplemented(&request.service, &request.method));
        }
        self.forward(request).await
    }
}

impl fmt::Debug for Redirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.try_lock() {
            Ok(state) => match &*state {
                ConnState::Idle => "idle",
                ConnState::Connected(_) => "connected",
                ConnState::Failed(_) => "failed",
                ConnState::Closed => "closed",
            },
            Err(_) => "connecting",
        };
        f.debug_struct("Redirector").field("state", &state).finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::{agent::HEALTH_SERVICE, ttrpc::Server};

    use super::*;

    /// An agent that answers every method with its own name.
    struct FakeAgent;

    #[async_trait]
    impl Service for FakeAgent {
        async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
            if request.method == "DestroySandbox" {
                return Err(Status::new(9, "sandbox is busy"));
            }
            Ok(request.method.encode_to_vec())
        }
    }

    /// Dials an in-memory [`FakeAgent`], counting dials.
    #[derive(Default)]
    struct FakeDialer {
        dials: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self) -> PeerpodResult<Box<dyn AgentStream>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err(PeerpodError::Unavailable("agent is down".into()));
            }

            let (near, far) = tokio::io::duplex(1 << 16);
            let server = Server::new()
                .register(AGENT_SERVICE, Arc::new(FakeAgent))
                .register(HEALTH_SERVICE, Arc::new(FakeAgent));
            tokio::spawn(async move { server.serve_connection(far, CancellationToken::new()).await });
            Ok(Box::new(near))
        }
    }

    fn request(service: &str, method: &str) -> Request {
        Request {
            service: service.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_redirector_dials_once_under_concurrency() -> anyhow::Result<()> {
        let dialer = Arc::new(FakeDialer::default());
        let redirector = Arc::new(Redirector::new(dialer.clone()));

        let methods = ["CreateSandbox", "StartContainer", "ReadStdout", "ListRoutes"];
        let calls: Vec<_> = methods
            .into_iter()
            .map(|method| {
                let redirector = redirector.clone();
                tokio::spawn(async move { redirector.handle(request(AGENT_SERVICE, method)).await })
            })
            .collect();

        for (call, method) in calls.into_iter().zip(methods) {
            let payload = call.await?.map_err(|s| anyhow::anyhow!(s.message))?;
            assert_eq!(String::decode(payload.as_slice())?, method);
        }
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        let version = redirector.handle(request(HEALTH_SERVICE, "Version")).await;
        assert!(version.is_ok());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_redirector_relays_status_and_rejects_unknown_methods() -> anyhow::Result<()> {
        let redirector = Redirector::new(Arc::new(FakeDialer::default()));

        let status = redirector
            .handle(request(AGENT_SERVICE, "DestroySandbox"))
            .await
            .unwrap_err();
        assert_eq!(status, Status::new(9, "sandbox is busy"));

        let status = redirector
            .handle(request(AGENT_SERVICE, "NoSuchMethod"))
            .await
            .unwrap_err();
        assert_eq!(status.code, 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_redirector_failed_dial_is_sticky() -> anyhow::Result<()> {
        let dialer = Arc::new(FakeDialer {
            fail: true,
            ..Default::default()
        });
        let redirector = Redirector::new(dialer.clone());

        for _ in 0..2 {
            let status = redirector
                .handle(request(AGENT_SERVICE, "CreateSandbox"))
                .await
                .unwrap_err();
            assert_eq!(status.code, 14);
        }
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_redirector_close() -> anyhow::Result<()> {
        let redirector = Redirector::new(Arc::new(FakeDialer::default()));
        let client = redirector.connect().await?;

        redirector.close().await;
        assert!(client.is_closed());
        assert!(redirector.connect().await.is_err());
        assert!(format!("{redirector:?}").contains("closed"));
        Ok(())
    }
}
