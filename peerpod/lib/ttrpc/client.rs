use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{PeerpodError, PeerpodResult};

use super::{Frame, FrameCodec, FrameType, Request, Response};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const OUTGOING_QUEUE_SIZE: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A ttrpc client multiplexing concurrent calls over one connection.
///
/// Cloning the client shares the connection. The connection is closed by [`Client::close`] or once
/// every clone is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    outgoing: mpsc::Sender<Frame>,
    pending: Arc<PendingCalls>,
    next_stream_id: AtomicU32,
    closed: CancellationToken,
}

/// Calls waiting for their response. `None` once the connection is gone.
#[derive(Debug)]
struct PendingCalls {
    calls: Mutex<Option<HashMap<u32, oneshot::Sender<Response>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Client {
    /// Starts a client over an established connection.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);
        let pending = Arc::new(PendingCalls {
            calls: Mutex::new(Some(HashMap::new())),
        });
        let closed = CancellationToken::new();

        tokio::spawn(write_frames(
            FramedWrite::new(writer, FrameCodec),
            outgoing_rx,
            closed.clone(),
        ));
        tokio::spawn(read_frames(
            FramedRead::new(reader, FrameCodec),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                outgoing,
                pending,
                next_stream_id: AtomicU32::new(1),
                closed,
            }),
        }
    }

    /// Sends a request envelope and waits for its response envelope.
    ///
    /// A non-OK status is returned inside the response so it can be relayed as is. The request's
    /// `timeout_nano` bounds the wait.
    pub async fn request(&self, request: Request) -> PeerpodResult<Response> {
        if self.is_closed() {
            return Err(PeerpodError::Unavailable("ttrpc connection is closed".into()));
        }

        let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let timeout = request.timeout();
        let (tx, rx) = oneshot::channel();

        if !self.inner.pending.insert(stream_id, tx) {
            return Err(PeerpodError::Unavailable("ttrpc connection is closed".into()));
        }

        trace!(stream_id, service = %request.service, method = %request.method, "sending request");
        let frame = Frame::request(stream_id, request.encode_to_vec());
        if self.inner.outgoing.send(frame).await.is_err() {
            self.inner.pending.remove(stream_id);
            return Err(PeerpodError::Unavailable("ttrpc connection is closed".into()));
        }

        let response = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.inner.pending.remove(stream_id);
                    return Err(PeerpodError::DeadlineExceeded(format!(
                        "no response within {timeout:?}"
                    )));
                }
            },
            None => rx.await,
        };

        response.map_err(|_| PeerpodError::Unavailable("ttrpc connection closed".into()))
    }

    /// Calls `service/method` with a typed message and decodes the typed reply.
    pub async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        message: &Req,
        timeout: Option<Duration>,
    ) -> PeerpodResult<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let request = Request {
            service: service.to_string(),
            method: method.to_string(),
            payload: message.encode_to_vec(),
            timeout_nano: timeout.map_or(0, |t| t.as_nanos().min(i64::MAX as u128) as i64),
            metadata: Vec::new(),
        };

        let response = self.request(request).await?;
        if let Some(status) = response.status.filter(|s| !s.is_ok()) {
            return Err(status.into());
        }

        Ok(Resp::decode(response.payload.as_slice())?)
    }

    /// Closes the connection. Pending calls fail with `Unavailable`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl PendingCalls {
    fn insert(&self, stream_id: u32, tx: oneshot::Sender<Response>) -> bool {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        match calls.as_mut() {
            Some(calls) => {
                calls.insert(stream_id, tx);
                true
            }
            None => false,
        }
    }

    fn remove(&self, stream_id: u32) -> Option<oneshot::Sender<Response>> {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.as_mut().and_then(|calls| calls.remove(&stream_id))
    }

    /// Drops every waiting sender so their receivers fail, and refuses new calls.
    fn fail_all(&self) {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(calls) = calls.take() {
            if !calls.is_empty() {
                debug!(count = calls.len(), "failing pending ttrpc calls");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn write_frames<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outgoing: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    // Every client handle is gone.
                    closed.cancel();
                    break;
                };

                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "failed to write ttrpc frame");
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_frames<R>(
    mut stream: FramedRead<R, FrameCodec>,
    pending: Arc<PendingCalls>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) if frame.kind == FrameType::Response => {
                let response = match Response::decode(frame.payload) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(stream_id = frame.stream_id, error = %e, "dropping undecodable response");
                        continue;
                    }
                };

                match pending.remove(frame.stream_id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(stream_id = frame.stream_id, "response for unknown stream"),
                }
            }
            Some(Ok(frame)) => {
                debug!(stream_id = frame.stream_id, kind = ?frame.kind, "ignoring unexpected frame");
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to read ttrpc frame");
                break;
            }
            None => {
                debug!("ttrpc connection closed by peer");
                break;
            }
        }
    }

    closed.cancel();
    pending.fail_all();
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
