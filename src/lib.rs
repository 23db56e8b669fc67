#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! # revhttp
//!
//! Reverse HTTP tunneling over ordinary long-polling.
//!
//! A *reverse client* behind NAT opens outbound POSTs to a *reverse
//! server*; the server pushes whole HTTP requests down through the poll
//! responses, and the client's local handler answers them in the body of
//! the next poll. The nominal direction of HTTP is inverted: the server
//! originates requests, the client serves them.
//!
//! One request's journey:
//!
//! ```text
//! originator -> Session::submit -> rendezvous -> poll response (request envelope)
//!                                                      |
//!                                                reverse client -> local handler
//!                                                      |
//! originator <- response decoded <- next poll body (response envelope)
//! ```
//!
//! ## Architecture
//!
//! ```text
//! config.rs    — ServerConfig: TOML + env-var configuration
//! error.rs     — the shared Error enum
//! envelope.rs  — HTTP/1.1 messages serialized inside poll bodies
//! session.rs   — Session, the originator/poll rendezvous, tower adapter
//! server.rs    — ReverseServer: session table, six-phase poll handler
//! client.rs    — connect_and_serve loop, streaming ResponseWriter
//! ```
//!
//! ## Protocol surface
//!
//! A single POST endpoint. `X-Session` names the tunnel, `X-Timeout` asks
//! for a poll duration (clamped server-side, with `X-Warning`). Status
//! codes: `200` (request envelope in the body), `204` (poll elapsed),
//! `400` (bad timeout or bad envelope), `410` (session gone).
//!
//! At most one request is in flight per session; there is no pipelining,
//! no authentication, and no persistence across restarts.

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod server;
pub mod session;

pub use client::{connect_and_serve, ResponseWriter, ReverseHandler};
pub use config::ServerConfig;
pub use error::Error;
pub use server::ReverseServer;
pub use session::{Session, SessionService};
