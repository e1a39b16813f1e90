//! wsrelay: a multi-process WebSocket broadcast server.
//!
//! # Overview
//!
//! One master process forks N workers that share a listening TCP socket. Each
//! worker runs a single-threaded cooperative scheduler: every connection is a
//! set of small state-machine tasks that suspend on socket readiness instead
//! of blocking. A text message from a client is delivered to every client of
//! the same worker and forwarded over a Unix-domain link to the master, which
//! relays it to every *other* worker.
//!
//! ```text
//!                    ┌──────────────┐
//!   connector ──────▶│    Master    │  fan-out, excluding the sender
//!   (optional)       └──┬────┬────┬─┘
//!              link 0   │    │    │   link N-1
//!                 ┌─────▼┐ ┌─▼────┐ ┌▼─────┐
//!                 │Worker│ │Worker│ │Worker│  accept / handshake / read loops
//!                 └──┬───┘ └──┬───┘ └──┬───┘
//!                 clients   clients   clients
//! ```
//!
//! # Module Structure
//!
//! - [`net`]: socket wrappers, WebSocket frame codec and upgrade handshake
//! - [`runtime`]: tasks, system calls and the readiness-driven scheduler
//! - [`server`]: peers, hooks, worker and master loops, process bootstrap
//! - [`config`]: server configuration with env and TOML overrides
//! - [`error`]: error types

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod net;
pub mod runtime;
pub mod server;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConnectionConfig, ServerConfig};
pub use error::{Error, ErrorKind, Result};
pub use runtime::{Scheduler, Step, SystemCall, Task};
pub use server::{ClientId, Context, DefaultHandler, Handler, Master, Server, Topology, Worker};
