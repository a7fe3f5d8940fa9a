//! relay-core: a line-oriented request server.
//!
//! Clients send `TOKEN:<secret> <COMMAND> <arguments>` over TCP and receive
//! one text response per request. Internally:
//!
//! - one multiplexer thread accepts connections and reads requests
//! - a bounded, per-connection-sharded queue hands raw requests to workers
//! - a fixed worker pool runs middleware, then handlers, then middleware
//!   again, and writes the response back
//!
//! Handlers and middleware are pluggable through the [`Handler`] and
//! [`Middleware`] traits; the built-in set lives in [`handlers`] and
//! [`middleware`].

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod pipeline;
pub mod runtime;

pub use config::{Config, ServerConfig};
pub use error::{HandlerError, ServerError};
pub use pipeline::{Handler, Middleware, Pipeline, Request, Verdict};
pub use runtime::{Server, ServerStats, ShutdownHandle, StatsSnapshot};
