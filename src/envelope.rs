//! Envelope codec: whole HTTP/1.1 messages inside poll bodies.
//!
//! The wire payload is an unaltered HTTP/1.1 message, framed exactly as it
//! would appear on a TCP socket: request-line or status-line, header block,
//! blank line, body. The server serializes tunneled requests with
//! [`write_request`] and parses returned responses with [`read_response`];
//! the client does the mirror image with [`read_request`] and
//! [`write_response`].
//!
//! Bodies are framed by `Content-Length` when present; otherwise the body is
//! everything up to the end of the poll body. Malformed framing fails with
//! [`Error::Decode`]; a body shorter than its declared length fails with
//! [`Error::Transport`].

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};

use crate::error::Error;

/// Content type labeling a poll response body that carries a serialized
/// HTTP request (server to client).
pub const CONTENT_TYPE_REQUEST: &str = "application/x-http-request";

/// Content type labeling a poll request body that carries a serialized
/// HTTP response (client to server).
pub const CONTENT_TYPE_RESPONSE: &str = "application/x-http-response";

const MAX_HEADERS: usize = 64;

/// Serialize `request` into `out` as a raw HTTP/1.1 message.
///
/// A `Content-Length` header is added when the request doesn't carry one,
/// so the receiving side can frame the body.
pub fn write_request(request: &Request<Bytes>, out: &mut Vec<u8>) -> Result<(), Error> {
    let Some(target) = request.uri().path_and_query() else {
        return Err(Error::Decode(format!(
            "request target missing in uri {}",
            request.uri()
        )));
    };
    out.extend_from_slice(request.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_str().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    write_headers(request.headers(), out);
    if !request.headers().contains_key(header::CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {}\r\n", request.body().len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(request.body());
    Ok(())
}

/// Parse a raw HTTP/1.1 request out of `buf`.
pub fn read_request(buf: &[u8]) -> Result<Request<Bytes>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(Error::Decode("truncated request head".to_string()));
        }
        Err(err) => return Err(Error::Decode(format!("malformed request: {err}"))),
    };

    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
        .map_err(|err| Error::Decode(format!("invalid method: {err}")))?;
    let uri: Uri = parsed
        .path
        .unwrap_or("/")
        .parse()
        .map_err(|err| Error::Decode(format!("invalid request target: {err}")))?;
    let headers = to_header_map(parsed.headers)?;
    let body = read_body(&buf[head_len..], &headers)?;

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Serialize `response` into `out` as a raw HTTP/1.1 message, adding
/// `Content-Length` when absent.
pub fn write_response(response: &Response<Bytes>, out: &mut Vec<u8>) {
    write_status_line(response.status(), out);
    write_headers(response.headers(), out);
    if !response.headers().contains_key(header::CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {}\r\n", response.body().len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(response.body());
}

/// Parse a raw HTTP/1.1 response out of `buf`.
///
/// `request` is the originating request the response answers; it drives
/// body framing for HEAD and other bodiless exchanges.
pub fn read_response(buf: &[u8], request: &Request<Bytes>) -> Result<Response<Bytes>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(Error::Decode("truncated response head".to_string()));
        }
        Err(err) => return Err(Error::Decode(format!("malformed response: {err}"))),
    };

    let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
        .map_err(|err| Error::Decode(format!("invalid status code: {err}")))?;
    let headers = to_header_map(parsed.headers)?;
    let body = if request.method() == Method::HEAD || bodiless(status) {
        Bytes::new()
    } else {
        read_body(&buf[head_len..], &headers)?
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = Version::HTTP_11;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Write a status line and header block with the trailing blank line, no
/// body framing. Used by the client's streaming response writer, where the
/// body length isn't known up front.
pub(crate) fn write_head(status: StatusCode, headers: &HeaderMap, out: &mut Vec<u8>) {
    write_status_line(status, out);
    write_headers(headers, out);
    out.extend_from_slice(b"\r\n");
}

fn write_status_line(status: StatusCode, out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_headers(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

fn to_header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|err| Error::Decode(format!("invalid header name: {err}")))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|err| Error::Decode(format!("invalid header value: {err}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Statuses that never carry a body, regardless of headers.
fn bodiless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn read_body(rest: &[u8], headers: &HeaderMap) -> Result<Bytes, Error> {
    match content_length(headers)? {
        Some(declared) => {
            if rest.len() < declared {
                return Err(Error::transport(format!(
                    "body truncated: expected {declared} bytes, got {}",
                    rest.len()
                )));
            }
            Ok(Bytes::copy_from_slice(&rest[..declared]))
        }
        None => Ok(Bytes::copy_from_slice(rest)),
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, Error> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .map(Some)
        .ok_or_else(|| Error::Decode("invalid Content-Length header".to_string()))
}
