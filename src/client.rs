//! Reverse client: connects outbound and serves tunneled requests.
//!
//! [`connect_and_serve`] drives the polling cycle against a reverse server:
//! POST, wait out the long poll, decode any delivered request, hand it to
//! the local handler, and stream the handler's response up the body of the
//! *next* POST. The handler runs concurrently with that POST: response
//! bytes flow through a channel into the request body as they are
//! written, never buffered whole.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use http::{header, HeaderMap, Request, StatusCode};
use tracing::debug;

use crate::envelope;
use crate::error::Error;
use crate::server::{X_SESSION, X_TIMEOUT};

/// Poll timeout requested from the server on every POST.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Serves one tunneled request on the reverse client.
///
/// Implemented for free by any `Fn(Request<Bytes>, ResponseWriter) -> Future`
/// closure, so a handler is usually written inline:
///
/// ```no_run
/// # use bytes::Bytes;
/// # use http::Request;
/// # use revhttp::ResponseWriter;
/// let handler = |_request: Request<Bytes>, mut response: ResponseWriter| async move {
///     response.write("hello from behind the NAT").ok();
/// };
/// ```
pub trait ReverseHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request<Bytes>,
        response: ResponseWriter,
    ) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> ReverseHandler for F
where
    F: Fn(Request<Bytes>, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn handle(
        &self,
        request: Request<Bytes>,
        response: ResponseWriter,
    ) -> impl Future<Output = ()> + Send {
        self(request, response)
    }
}

/// Connect to the reverse server at `url` and serve tunneled requests with
/// `handler` until the session dies.
///
/// Returns `Err(Error::SessionClosed)` when the server answers `410 Gone`,
/// `Err(Error::Status(..))` on any other unexpected status, and
/// `Err(Error::Transport(..))` when a POST fails. It does not return `Ok`.
pub async fn connect_and_serve<H>(
    http: &reqwest::Client,
    url: &str,
    handler: H,
) -> Result<(), Error>
where
    H: ReverseHandler,
{
    let handler = Arc::new(handler);
    let poll_timeout = humantime::format_duration(DEFAULT_POLL_TIMEOUT).to_string();
    let mut session_id: Option<String> = None;

    let mut response = http
        .post(url)
        .header(X_TIMEOUT, poll_timeout.as_str())
        .send()
        .await
        .map_err(Error::transport)?;

    loop {
        if let Some(id) = response.headers().get(X_SESSION).and_then(|v| v.to_str().ok()) {
            session_id = Some(id.to_string());
        }

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            // Long poll elapsed without work; go around again.
            let mut poll = http.post(url).header(X_TIMEOUT, poll_timeout.as_str());
            if let Some(id) = &session_id {
                poll = poll.header(X_SESSION, id.as_str());
            }
            response = poll.send().await.map_err(Error::transport)?;
            continue;
        }
        if status == StatusCode::GONE {
            debug!("server answered 410 Gone, session closed");
            return Err(Error::SessionClosed);
        }
        if status != StatusCode::OK {
            return Err(Error::Status(format!(
                "{} {}",
                status.as_str(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let raw = response.bytes().await.map_err(Error::transport)?;
        let request = envelope::read_request(&raw)?;
        debug!(method = %request.method(), uri = %request.uri(), "tunneled request");

        // Stream the handler's response into the next POST body.
        let (body_tx, body_rx) = mpsc::unbounded();
        let writer = ResponseWriter::new(body_tx);
        let task_handler = Arc::clone(&handler);
        tokio::spawn(async move {
            task_handler.handle(request, writer).await;
        });

        let mut poll = http
            .post(url)
            .header(X_TIMEOUT, poll_timeout.as_str())
            .header(header::CONTENT_TYPE, envelope::CONTENT_TYPE_RESPONSE)
            .body(reqwest::Body::wrap_stream(body_rx));
        if let Some(id) = &session_id {
            poll = poll.header(X_SESSION, id.as_str());
        }
        response = poll.send().await.map_err(Error::transport)?;
    }
}

/// Streaming writer for one tunneled response.
///
/// Headers and status are buffered until the first [`write`](Self::write)
/// (or an explicit [`write_head`](Self::write_head)), then emitted as an
/// HTTP/1.1 head; everything after flows straight through to the poll body.
/// Dropping the writer without writing flushes the default `200 OK` head so
/// the server always receives a complete envelope.
pub struct ResponseWriter {
    sender: mpsc::UnboundedSender<Result<Bytes, std::io::Error>>,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
}

impl ResponseWriter {
    fn new(sender: mpsc::UnboundedSender<Result<Bytes, std::io::Error>>) -> Self {
        Self {
            sender,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
        }
    }

    /// Response headers. Mutations after the head has been emitted are lost.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Emit the head with the given status. A no-op once the head is out.
    pub fn write_head(&mut self, status: StatusCode) {
        if self.head_sent {
            return;
        }
        self.status = status;
        self.flush_head();
    }

    /// Write a body chunk, emitting the head first if it hasn't gone out.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        if !self.head_sent {
            self.flush_head();
        }
        self.sender
            .unbounded_send(Ok(chunk.into()))
            .map_err(|_| Error::transport("poll connection closed"))
    }

    fn flush_head(&mut self) {
        let mut head = Vec::with_capacity(64);
        envelope::write_head(self.status, &self.headers, &mut head);
        let _ = self.sender.unbounded_send(Ok(head.into()));
        self.head_sent = true;
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if !self.head_sent {
            self.flush_head();
        }
    }
}
