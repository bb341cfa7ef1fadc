//! Embeddable asynchronous HTTP/1.1 server engine.
//!
//! The engine accepts TCP connections, decodes requests off the wire, routes
//! them through a mount table to application handlers and encodes the
//! responses back, enforcing connection limits, keep-alive and timeouts.
//!
//! ```txt
//!  listener ──accept──> connection loop ──decode──> Request
//!     │                        │                       │
//!  slot pool                router ──> handler <───────┘
//!                              │           │
//!                              └─encode── Response
//! ```
//!
//! - [`Server`] owns the listening sockets, the connection slot pool and the
//!   accept loop.
//! - [`server::accept`] runs the per-connection request loop on any duplex
//!   stream.
//! - [`Router`] maps path prefixes to [`Handler`]s.
//! - [`auth`] implements Basic and Digest challenge/response.
//!
//! # Example
//!
//! ```no_run
//! use async_h1d::{Server, ServerConfig};
//!
//! # fn main() -> std::io::Result<()> {
//! let server = Server::new(ServerConfig::default().with_port(8080))?;
//! server.router().mount_proc("/hello", |_req, res| {
//!     Box::pin(async move {
//!         res.set_body("hello world");
//!         Ok(())
//!     })
//! });
//! async_global_executor::block_on(server.start())
//! # }
//! ```

#![forbid(unsafe_code, rust_2018_idioms)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]

use std::future::Future;
use std::pin::Pin;

/// The maximum length of a request line, longer lines are answered with 414.
const MAX_URI_LENGTH: usize = 2083;

/// The maximum length of the head section we'll try to parse.
/// See: https://nodejs.org/en/blog/vulnerability/november-2018-security-releases/#denial-of-service-with-large-http-headers-cve-2018-12121
const MAX_HEADER_LENGTH: usize = 112 * 1024;

#[macro_use]
mod macros;

mod body;
mod chunked;
mod config;
mod error;
mod future;
mod handler;
mod headers;
mod listener;
mod logger;
mod request;
mod response;
mod router;
mod upgrade;
mod version;

pub mod auth;
pub mod server;

pub use body::{Body, BodySink};
pub use chunked::{ChunkedDecoder, ChunkedEncoder};
pub use config::ServerConfig;
pub use error::HttpError;
pub use handler::{App, AppResponse, Handler, HandlerFactory, Proc};
pub use headers::Headers;
pub use listener::{Server, ServerStatus, StatusHandle};
pub use logger::{AccessLog, Logger};
pub use request::{Params, Request};
pub use response::Response;
pub use router::{MountEntry, MountOptions, Route, Router};
pub use upgrade::Upgraded;
pub use version::HttpVersion;

/// A boxed future, as returned by handlers and authenticators.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
