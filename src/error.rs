//! Error types shared by both halves of the tunnel.
//!
//! The same [`Error`] surfaces to originators (through a session's reply
//! channel), to the reverse client's polling loop, and to callers of the
//! server's public API.

use std::error::Error as StdError;
use std::fmt;

/// Boxed source for transport failures.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Everything that can go wrong inside the tunnel.
#[derive(Debug)]
pub enum Error {
    /// The session was closed explicitly or evicted for idleness. Surfaced
    /// to originators blocked in submit and to the client loop on `410 Gone`.
    SessionClosed,
    /// An envelope could not be parsed (malformed framing, bad header, bad
    /// status line).
    Decode(String),
    /// Underlying HTTP I/O failed, or an envelope body was cut short.
    Transport(BoxError),
    /// The server answered a poll with a status the client loop does not
    /// understand. Carries the literal status line.
    Status(String),
}

impl Error {
    /// Returns `true` if the error means the session is gone for good.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Error::SessionClosed)
    }

    pub(crate) fn transport<E: Into<BoxError>>(source: E) -> Self {
        Error::Transport(source.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SessionClosed => write!(f, "session closed"),
            Error::Decode(msg) => write!(f, "envelope decode failed: {msg}"),
            Error::Transport(source) => write!(f, "transport failed: {source}"),
            Error::Status(line) => write!(f, "unexpected poll status: {line}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Transport(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}
