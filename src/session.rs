//! Per-tunnel session state and the originator/poll rendezvous.
//!
//! A [`Session`] is the meeting point between two parties that never hold a
//! connection to each other: an *originator* submitting requests on the
//! server side, and the reverse client whose polls carry those requests out
//! and bring responses back. The hand-off is a capacity-1 channel plus a
//! oneshot reply per request, so a submit cannot complete before a poll has
//! picked the request up and the response (or a failure) has come back.
//!
//! ## Concurrency
//!
//! Poll handling is serialized per session by the `handler` mutex. The
//! pending slot, the receive half of the request channel, and the idle
//! timer live inside that mutex, so only the poll handler (or `close`)
//! ever touches them. The closed flag is a `watch` channel flipped exactly
//! once; `close` is idempotent and drains every outstanding reply so each
//! originator hears back exactly once.

use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Error;

/// An originator whose request has been handed to a session and who is
/// blocked waiting for the tunneled response.
pub(crate) struct PendingRequest {
    pub(crate) request: Request<Bytes>,
    reply: oneshot::Sender<Result<Response<Bytes>, Error>>,
}

impl PendingRequest {
    /// Deliver the tunneled response to the blocked originator.
    pub(crate) fn respond(self, response: Response<Bytes>) {
        let _ = self.reply.send(Ok(response));
    }

    /// Deliver a failure to the blocked originator.
    pub(crate) fn fail(self, error: Error) {
        let _ = self.reply.send(Err(error));
    }
}

/// State only the poll handler (and `close`) may touch, guarded by the
/// per-session handler lock.
pub(crate) struct HandlerState {
    pub(crate) requests_rx: mpsc::Receiver<PendingRequest>,
    /// The originator whose request went out in the last poll response and
    /// whose response is expected in the next poll body.
    pub(crate) pending: Option<PendingRequest>,
    /// Task that evicts this session if no poll arrives in time. Re-armed
    /// at the start of every poll.
    pub(crate) idle_timer: Option<JoinHandle<()>>,
}

/// One logical reverse tunnel, identified by the opaque `X-Session` value.
pub struct Session {
    id: String,
    requests_tx: mpsc::Sender<PendingRequest>,
    closed_tx: watch::Sender<bool>,
    pub(crate) handler: Mutex<HandlerState>,
}

impl Session {
    pub(crate) fn new(id: String) -> Arc<Self> {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            requests_tx,
            closed_tx,
            handler: Mutex::new(HandlerState {
                requests_rx,
                pending: None,
                idle_timer: None,
            }),
        })
    }

    /// The server-assigned session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether [`Session::close`] has run (or the idle timer evicted us).
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// A watch receiver that resolves once the session closes.
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Submit a request into the tunnel and wait for its response.
    ///
    /// Blocks until a poll has carried the request to the reverse client
    /// and the next poll has brought the response back. There is no
    /// timeout at this layer; callers own their own deadlines.
    pub async fn submit(&self, request: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingRequest {
            request,
            reply: reply_tx,
        };
        if self.requests_tx.send(pending).await.is_err() {
            return Err(Error::SessionClosed);
        }
        reply_rx.await.unwrap_or(Err(Error::SessionClosed))
    }

    /// Close the session. Idempotent: the first call flips the closed flag
    /// and fails every queued or in-flight originator with
    /// [`Error::SessionClosed`]; later calls return immediately.
    pub async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let mut state = self.handler.lock().await;
        state.requests_rx.close();
        if let Some(pending) = state.pending.take() {
            pending.fail(Error::SessionClosed);
        }
        while let Ok(pending) = state.requests_rx.try_recv() {
            pending.fail(Error::SessionClosed);
        }
        // Detach rather than abort: close may be running inside the idle
        // timer task itself.
        drop(state.idle_timer.take());
        debug!(session = %self.id, "session closed");
    }

    /// A [`tower_service::Service`] round-tripper over this session, for
    /// driving it with ordinary HTTP client plumbing.
    pub fn service(self: &Arc<Self>) -> SessionService {
        SessionService {
            session: Arc::clone(self),
        }
    }
}

/// Presents a [`Session`] as an HTTP round-tripper: each call submits the
/// request through the tunnel and resolves with the tunneled response.
#[derive(Clone)]
pub struct SessionService {
    session: Arc<Session>,
}

impl tower_service::Service<Request<Bytes>> for SessionService {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response<Bytes>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.session.is_closed() {
            Poll::Ready(Err(Error::SessionClosed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let session = Arc::clone(&self.session);
        Box::pin(async move { session.submit(request).await })
    }
}
