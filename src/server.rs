//! Reverse server: session table and the long-poll handler.
//!
//! Every inbound POST is a *poll* from a reverse client. A poll passes
//! through six phases, serialized per session:
//!
//! 1. **Binding** — look up the session named by `X-Session`, or mint a new
//!    one (and fire the on-connect callback).
//! 2. **Exclusion** — take the session's handler lock.
//! 3. **Idle timer** — re-arm the eviction timer.
//! 4. **Response drain** — if a request is in flight, the poll body holds
//!    its response envelope; parse it and wake the originator.
//! 5. **Timeout resolution** — parse `X-Timeout`, clamp to the configured
//!    bounds, warn via `X-Warning` when clamping.
//! 6. **Rendezvous** — wait for an originator, the timer, or closure, and
//!    answer `200` (request envelope), `204`, or `410` accordingly.
//!
//! The handler deliberately reads the poll body only in phase 4: the body
//! may still be streaming out of the client's handler while the session's
//! idle timer runs down, and binding must not wait on it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::routing::post;
use axum::Router;
use futures::future::BoxFuture;
use http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::envelope;
use crate::error::Error;
use crate::session::{HandlerState, Session};

/// Header carrying the opaque session identifier, echoed on every response.
pub const X_SESSION: &str = "x-session";
/// Header carrying the client's requested long-poll timeout.
pub const X_TIMEOUT: &str = "x-timeout";
/// Header describing a clamped timeout value.
pub const X_WARNING: &str = "x-warning";
/// Header describing a rejected `X-Timeout` value.
pub const X_ERROR: &str = "x-error";

/// Poll timeout applied when the client sends no `X-Timeout` header.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

type OnConnect = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The server half of the tunnel: accepts polls, owns the session table.
///
/// Cloneable — all clones share the same session table.
#[derive(Clone)]
pub struct ReverseServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    on_connect: Option<OnConnect>,
}

/// Builder for [`ReverseServer`].
#[derive(Default)]
pub struct Builder {
    config: Option<ServerConfig>,
    on_connect: Option<OnConnect>,
}

impl Builder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Callback spawned with every newly minted session. Runs concurrently
    /// with the first poll; it may submit requests right away, the
    /// rendezvous holds them until a poll arrives.
    pub fn on_connect<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |session| Box::pin(callback(session))));
        self
    }

    pub fn build(self) -> ReverseServer {
        ReverseServer {
            inner: Arc::new(Inner {
                config: self.config.unwrap_or_default(),
                sessions: RwLock::new(HashMap::new()),
                on_connect: self.on_connect,
            }),
        }
    }
}

impl ReverseServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A router serving the poll endpoint at `/` (and any nested path),
    /// with request tracing.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(poll))
            .route("/{*path}", post(poll))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Look up a live session by id.
    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(id).cloned()
    }

    /// Number of sessions currently in the table.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Remove a session from the table and close it. Returns `false` if the
    /// id was unknown. This is the same path the idle timer takes.
    pub async fn close_session(&self, id: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every session so blocked originators fail fast. Polls on the
    /// old ids will mint fresh sessions.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.inner.sessions.write().await.drain().collect();
        for (id, session) in sessions {
            debug!(session = %id, "closing session for shutdown");
            session.close().await;
        }
    }

    /// Handle one poll. Exposed for mounting outside [`ReverseServer::router`].
    pub async fn handle_poll(&self, request: axum::extract::Request) -> Response<Body> {
        let (parts, body) = request.into_parts();

        // Phase 1: bind the poll to a session.
        let (session_id, session) = self.bind(&parts.headers).await;

        // Phase 2: one poll at a time per session.
        let mut state = session.handler.lock().await;

        // Phase 3: re-arm the idle timer.
        self.arm_idle_timer(&session_id, &mut state);

        // Phase 4: drain the response for the in-flight request, if any.
        if let Some(pending) = state.pending.take() {
            let raw = match to_bytes(body, self.inner.config.max_envelope_bytes).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(session = %session_id, "failed to read poll body: {err}");
                    pending.fail(Error::transport(err));
                    return respond(StatusCode::BAD_REQUEST, &session_id, HeaderMap::new());
                }
            };
            match envelope::read_response(&raw, &pending.request) {
                Ok(response) => pending.respond(response),
                Err(err) => {
                    warn!(session = %session_id, "malformed response envelope: {err}");
                    pending.fail(err);
                    return respond(StatusCode::BAD_REQUEST, &session_id, HeaderMap::new());
                }
            }
        }

        // Phase 5: resolve and clamp the poll timeout.
        let mut extra = HeaderMap::new();
        let timeout = match self.resolve_timeout(&parts.headers, &mut extra) {
            Ok(timeout) => timeout,
            Err(error_headers) => {
                return respond(StatusCode::BAD_REQUEST, &session_id, error_headers);
            }
        };

        // Phase 6: rendezvous.
        if session.is_closed() {
            debug!(session = %session_id, "poll on closed session, answering 410 Gone");
            return respond(StatusCode::GONE, &session_id, extra);
        }
        let mut closed = session.closed();
        tokio::select! {
            () = sleep(timeout) => respond(StatusCode::NO_CONTENT, &session_id, extra),
            received = state.requests_rx.recv() => match received {
                Some(pending) => {
                    let mut wire = Vec::new();
                    match envelope::write_request(&pending.request, &mut wire) {
                        Ok(()) => {
                            state.pending = Some(pending);
                            extra.insert(
                                header::CONTENT_TYPE,
                                HeaderValue::from_static(envelope::CONTENT_TYPE_REQUEST),
                            );
                            let mut response = respond(StatusCode::OK, &session_id, extra);
                            *response.body_mut() = Body::from(wire);
                            response
                        }
                        Err(err) => {
                            warn!(session = %session_id, "failed to serialize tunneled request: {err}");
                            pending.fail(err);
                            respond(StatusCode::INTERNAL_SERVER_ERROR, &session_id, extra)
                        }
                    }
                }
                None => {
                    debug!(session = %session_id, "request channel closed, answering 410 Gone");
                    respond(StatusCode::GONE, &session_id, extra)
                }
            },
            _ = closed.wait_for(|closed| *closed) => {
                debug!(session = %session_id, "session closed during poll, answering 410 Gone");
                respond(StatusCode::GONE, &session_id, extra)
            }
        }
    }

    /// Phase 1: resolve the `X-Session` header to a live session, or mint a
    /// new one and fire the on-connect callback.
    async fn bind(&self, headers: &HeaderMap) -> (String, Arc<Session>) {
        if let Some(id) = headers.get(X_SESSION).and_then(|v| v.to_str().ok()) {
            if let Some(session) = self.inner.sessions.read().await.get(id) {
                return (id.to_string(), Arc::clone(session));
            }
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone());
        self.inner
            .sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));
        info!(session = %id, "new reverse session");
        if let Some(on_connect) = &self.inner.on_connect {
            tokio::spawn(on_connect(Arc::clone(&session)));
        }
        (id, session)
    }

    /// Phase 3: stop the running idle timer and arm a fresh one. The timer
    /// is the only thing that removes an abandoned session from the table.
    fn arm_idle_timer(&self, session_id: &str, state: &mut HandlerState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        let server = self.clone();
        let session_id = session_id.to_string();
        let idle = self.inner.config.session_idle_timeout();
        state.idle_timer = Some(tokio::spawn(async move {
            sleep(idle).await;
            info!(session = %session_id, "closing idle session");
            server.close_session(&session_id).await;
        }));
    }

    /// Phase 5: parse `X-Timeout` and clamp it to the configured bounds,
    /// recording a warning header when clamping. An unparseable value
    /// yields the `X-Error` headers for a `400` answer.
    fn resolve_timeout(
        &self,
        headers: &HeaderMap,
        extra: &mut HeaderMap,
    ) -> Result<Duration, HeaderMap> {
        let mut timeout = DEFAULT_POLL_TIMEOUT;
        if let Some(value) = headers.get(X_TIMEOUT) {
            match value
                .to_str()
                .ok()
                .and_then(|s| humantime::parse_duration(s).ok())
            {
                Some(requested) => timeout = requested,
                None => {
                    let mut error_headers = HeaderMap::new();
                    error_headers.insert(
                        X_ERROR,
                        HeaderValue::from_static("cannot parse duration in X-Timeout header"),
                    );
                    return Err(error_headers);
                }
            }
        }

        let max = self.inner.config.long_poll_max_timeout();
        if timeout > max {
            insert_warning(
                extra,
                &format!(
                    "timeout value too high, forcing to maximum {}",
                    humantime::format_duration(max)
                ),
            );
            timeout = max;
        }
        let min = self.inner.config.long_poll_min_timeout();
        if timeout < min {
            insert_warning(
                extra,
                &format!(
                    "timeout value too low, forcing to minimum {}",
                    humantime::format_duration(min)
                ),
            );
            timeout = min;
        }
        Ok(timeout)
    }
}

async fn poll(
    State(server): State<ReverseServer>,
    request: axum::extract::Request,
) -> Response<Body> {
    server.handle_poll(request).await
}

/// Build a bodyless poll answer carrying `X-Session` and any extra headers.
fn respond(status: StatusCode, session_id: &str, extra: HeaderMap) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(X_SESSION, value);
    }
    response.headers_mut().extend(extra);
    response
}

fn insert_warning(extra: &mut HeaderMap, message: &str) {
    if let Ok(value) = HeaderValue::from_str(message) {
        extra.insert(X_WARNING, value);
    }
}
