use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixListener,
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, error, trace, warn};

use crate::{PeerpodError, PeerpodResult};

use super::{Frame, FrameCodec, FrameType, Request, Response, Status};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const RESPONSE_QUEUE_SIZE: usize = 64;

/// The gRPC code for a request that could not be decoded.
const CODE_INVALID_ARGUMENT: i32 = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A ttrpc service: handles the methods of one service name.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handles one request, returning the encoded response message or an error status.
    ///
    /// Unknown methods should answer [`Status::unimplemented`].
    async fn handle(&self, request: Request) -> Result<Vec<u8>, Status>;
}

/// Dispatches requests to the [`Service`] registered for their service name.
#[derive(Clone, Default)]
pub struct Server {
    services: HashMap<String, Arc<dyn Service>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Server {
    /// Creates a server with no services.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`, replacing any earlier registration.
    pub fn register(mut self, name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        self.services.insert(name.into(), service);
        self
    }

    /// The registered service names.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Binds a unix socket at `path`, removing a stale socket first.
    pub async fn bind_unix(path: &Path) -> PeerpodResult<UnixListener> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        Ok(UnixListener::bind(path)?)
    }

    /// Accepts connections from `listener` until `shutdown` is cancelled.
    pub async fn serve_unix(
        &self,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> PeerpodResult<()> {
        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept ttrpc connection");
                        continue;
                    }
                },
            };

            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, shutdown).await {
                    warn!(error = %e, "ttrpc connection failed");
                }
            });
        }

        Ok(())
    }

    /// Serves requests on one connection until the peer hangs up or `shutdown` is cancelled.
    ///
    /// Every request runs in its own task, so a slow method does not hold up the others. Requests
    /// still running when the connection ends are abandoned and their handlers dropped.
    pub async fn serve_connection<S>(&self, stream: S, shutdown: CancellationToken) -> PeerpodResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, FrameCodec);
        let mut sink = FramedWrite::new(writer, FrameCodec);
        let (responses_tx, mut responses_rx) = mpsc::channel::<Frame>(RESPONSE_QUEUE_SIZE);
        let connection = shutdown.child_token();
        let _abandon_requests = connection.clone().drop_guard();

        let writer = tokio::spawn(async move {
            while let Some(frame) = responses_rx.recv().await {
                sink.send(frame).await?;
            }
            PeerpodResult::Ok(())
        });

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                frame = frames.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };

            if frame.kind != FrameType::Request {
                debug!(stream_id = frame.stream_id, kind = ?frame.kind, "ignoring non-request frame");
                continue;
            }

            let server = self.clone();
            let responses_tx = responses_tx.clone();
            let connection = connection.clone();
            tokio::spawn(async move {
                let response = tokio::select! {
                    _ = connection.cancelled() => {
                        debug!(stream_id = frame.stream_id, "connection closed, abandoning request");
                        return;
                    }
                    response = server.dispatch(frame.payload.as_ref()) => response,
                };
                let frame = Frame::response(frame.stream_id, response.encode_to_vec());
                if responses_tx.send(frame).await.is_err() {
                    trace!("connection closed before the response was written");
                }
            });
        };

        connection.cancel();
        drop(responses_tx);
        if shutdown.is_cancelled() {
            writer.abort();
        } else if let Ok(Err(e)) = writer.await {
            debug!(error = %e, "failed to write ttrpc response");
        }

        result
    }

    /// Decodes a request, runs its handler under the request deadline and wraps the outcome.
    async fn dispatch(&self, payload: &[u8]) -> Response {
        let request = match Request::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                return error_response(Status::new(
                    CODE_INVALID_ARGUMENT,
                    format!("invalid ttrpc request: {e}"),
                ))
            }
        };

        let Some(service) = self.services.get(&request.service).cloned() else {
            return error_response(Status::unimplemented(&request.service, &request.method));
        };

        let service_name = request.service.clone();
        let method = request.method.clone();
        trace!(service = %service_name, method = %method, "handling request");

        let outcome = match request.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, service.handle(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Status::from(PeerpodError::DeadlineExceeded(format!(
                    "/{service_name}/{method} did not finish within {timeout:?}"
                )))),
            },
            None => service.handle(request).await,
        };

        match outcome {
            Ok(payload) => Response {
                status: None,
                payload,
            },
            Err(status) => {
                if status.code == super::CODE_UNIMPLEMENTED {
                    debug!(service = %service_name, %method, "unimplemented method");
                } else {
                    error!(service = %service_name, %method, code = status.code, message = %status.message, "request failed");
                }
                error_response(status)
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn error_response(status: Status) -> Response {
    Response {
        status: Some(status),
        payload: Vec::new(),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use tokio::sync::oneshot;

    use crate::ttrpc::Client;

    use super::*;

    struct Echo;

    /// Parks every `Hold` call forever while owning `held`, so dropping the handler is observable.
    struct Holder {
        started: Mutex<Option<oneshot::Sender<()>>>,
        held: Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl Service for Holder {
        async fn handle(&self, _request: Request) -> Result<Vec<u8>, Status> {
            let held = self.held.lock().ok().and_then(|mut held| held.take());
            if let Some(started) = self.started.lock().ok().and_then(|mut started| started.take()) {
                let _ = started.send(());
            }
            std::future::pending::<()>().await;
            drop(held);
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Service for Echo {
        async fn handle(&self, request: Request) -> Result<Vec<u8>, Status> {
            match request.method.as_str() {
                "Echo" => Ok(request.payload),
                "Sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Vec::new())
                }
                "Fail" => Err(PeerpodError::NotFound("nothing here".into()).into()),
                _ => Err(Status::unimplemented(&request.service, &request.method)),
            }
        }
    }

    fn spawn_server() -> (Client, CancellationToken) {
        let (near, far) = tokio::io::duplex(1 << 16);
        let shutdown = CancellationToken::new();
        let server = Server::new().register("test.Echo", Arc::new(Echo));
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve_connection(far, shutdown).await }
        });
        (Client::new(near), shutdown)
    }

    #[tokio::test]
    async fn test_server_dispatches_by_service_and_method() -> anyhow::Result<()> {
        let (client, _shutdown) = spawn_server();

        let echoed: String = client
            .call("test.Echo", "Echo", &"ping".to_string(), None)
            .await?;
        assert_eq!(echoed, "ping");

        let err = client
            .call::<_, String>("test.Echo", "Fail", &String::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = client
            .call::<_, String>("test.Echo", "Missing", &String::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 12);

        let err = client
            .call::<_, String>("test.Other", "Echo", &String::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_enforces_request_deadline() -> anyhow::Result<()> {
        let (client, _shutdown) = spawn_server();

        let request = Request {
            service: "test.Echo".into(),
            method: "Sleep".into(),
            timeout_nano: Duration::from_millis(50).as_nanos() as i64,
            ..Default::default()
        };
        // The client gives up at the same deadline; either side may report first.
        let outcome = client.request(request).await;
        match outcome {
            Ok(response) => assert_eq!(response.status.map(|s| s.code), Some(4)),
            Err(e) => assert!(matches!(e, PeerpodError::DeadlineExceeded(_))),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_server_handles_concurrent_requests() -> anyhow::Result<()> {
        let (client, _shutdown) = spawn_server();

        let slow = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call::<_, String>(
                        "test.Echo",
                        "Sleep",
                        &String::new(),
                        Some(Duration::from_secs(10)),
                    )
                    .await
            }
        });

        let fast: String = tokio::time::timeout(
            Duration::from_secs(1),
            client.call("test.Echo", "Echo", &"fast".to_string(), None),
        )
        .await??;
        assert_eq!(fast, "fast");
        slow.abort();
        Ok(())
    }

    #[tokio::test]
    async fn test_serve_unix_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("echo.sock");
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, b"stale")?;

        let listener = Server::bind_unix(&path).await?;
        let shutdown = CancellationToken::new();
        let server = Server::new().register("test.Echo", Arc::new(Echo));
        let serving = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve_unix(listener, shutdown).await }
        });

        let client = Client::new(tokio::net::UnixStream::connect(&path).await?);
        let echoed: String = client
            .call("test.Echo", "Echo", &"over unix".to_string(), None)
            .await?;
        assert_eq!(echoed, "over unix");

        shutdown.cancel();
        serving.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_server_drops_handlers_when_peer_hangs_up() -> anyhow::Result<()> {
        let (started_tx, started_rx) = oneshot::channel();
        let (held_tx, held_rx) = oneshot::channel();
        let holder = Holder {
            started: Mutex::new(Some(started_tx)),
            held: Mutex::new(Some(held_tx)),
        };

        let (near, far) = tokio::io::duplex(1 << 16);
        let server = Server::new().register("test.Hold", Arc::new(holder));
        let serving = tokio::spawn(async move {
            server.serve_connection(far, CancellationToken::new()).await
        });

        let client = Client::new(near);
        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call::<_, String>("test.Hold", "Hold", &String::new(), None)
                    .await
            }
        });
        tokio::time::timeout(Duration::from_secs(5), started_rx).await??;

        client.close();
        assert!(call.await?.is_err());
        tokio::time::timeout(Duration::from_secs(5), serving).await???;

        let released = tokio::time::timeout(Duration::from_secs(5), held_rx).await?;
        assert!(released.is_err(), "the handler still runs after the peer hung up");
        Ok(())
    }
}
