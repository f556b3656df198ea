//! Manager side of the task-host protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use crate::protocol::{Envelope, HostRequest, HostResponse};
use crate::IpcError;

type FrameSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;
type Pending = Mutex<HashMap<u64, oneshot::Sender<HostResponse>>>;

/// State shared with the read loop.
struct Shared {
    pending: Pending,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn close(&self) {
        self.closed.send_replace(true);
        // Dropping the senders wakes every waiting caller.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct Inner {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<FrameSink>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Client for a task host, cheap to clone.
#[derive(Clone)]
pub struct HostClient {
    inner: Arc<Inner>,
}

impl HostClient {
    /// Start a client over the given byte streams and spawn its read loop.
    pub fn spawn<R, W>(reader: R, writer: W, call_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed,
        });

        let frames = FramedRead::new(reader, LengthDelimitedCodec::new());
        let reader = tokio::spawn(read_loop(frames, Arc::clone(&shared)));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        Self {
            inner: Arc::new(Inner {
                shared,
                writer: tokio::sync::Mutex::new(FramedWrite::new(writer, LengthDelimitedCodec::new())),
                next_id: AtomicU64::new(1),
                call_timeout,
                reader,
            }),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// A `Failed` response is turned into [`IpcError::Task`].
    pub async fn call(&self, request: HostRequest) -> Result<HostResponse, IpcError> {
        if self.is_closed() {
            return Err(IpcError::ConnectionLost);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.op();
        let frame = Envelope { id, body: request }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        if self.is_closed() {
            self.pending().remove(&id);
            return Err(IpcError::ConnectionLost);
        }

        trace!(id, op, "Sending host request");
        let sent = self.inner.writer.lock().await.send(frame).await;
        if let Err(e) = sent {
            self.pending().remove(&id);
            warn!(id, op, error = %e, "Failed to write host request");
            self.inner.shared.close();
            return Err(IpcError::Io(e));
        }

        match tokio::time::timeout(self.inner.call_timeout, rx).await {
            Err(_) => {
                self.pending().remove(&id);
                debug!(id, op, "Host request timed out");
                Err(IpcError::Timeout)
            }
            Ok(Err(_)) => Err(IpcError::ConnectionLost),
            Ok(Ok(HostResponse::Failed { error })) => Err(IpcError::Task(error)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Round-trip a ping, returning the host's process id.
    pub async fn ping(&self) -> Result<u32, IpcError> {
        match self.call(HostRequest::Ping).await? {
            HostResponse::Pong { pid } => Ok(pid),
            other => Err(IpcError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Returns true once the connection is known to be gone.
    pub fn is_closed(&self) -> bool {
        *self.inner.shared.closed.borrow()
    }

    /// Watch channel flipping to `true` when the connection is lost.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.shared.closed.subscribe()
    }

    /// Mark the connection closed and fail every pending call.
    pub fn shutdown(&self) {
        self.inner.shared.close();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<HostResponse>>> {
        self.inner
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_loop<R>(mut frames: FramedRead<R, LengthDelimitedCodec>, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Task host stream error");
                break;
            }
        };
        match Envelope::<HostResponse>::decode(&frame) {
            Ok(envelope) => {
                let waiter = shared
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&envelope.id);
                match waiter {
                    Some(tx) => {
                        tx.send(envelope.body).ok();
                    }
                    None => debug!(id = envelope.id, "Dropping response with no waiter"),
                }
            }
            Err(e) => warn!(error = %e, "Failed to decode host response"),
        }
    }
    debug!("Task host stream closed");
    shared.close();
}
