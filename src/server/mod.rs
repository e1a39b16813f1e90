//! The relay server.
//!
//! - [`Server`]: binds, forks workers, runs the master
//! - [`Worker`]: per-process connection handling on a [`Scheduler`](crate::runtime::Scheduler)
//! - [`Master`]: fan-out between workers, optional connector
//! - [`Handler`] / [`Context`]: hooks a deployment customises
//! - [`Peer`]: a connected socket with an ordered outbound queue
//!
//! # Example
//!
//! A handler that only talks back to the sender:
//!
//! ```
//! use wsrelay::net::websocket::{encode, Opcode};
//! use wsrelay::server::{ClientId, Context, Handler};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_client_message(&mut self, payload: &[u8], client: ClientId, ctx: &mut Context<'_>) {
//!         ctx.send(client, &encode(payload, Opcode::Text));
//!     }
//! }
//! ```

mod handler;
mod master;
mod peer;
mod process;
mod worker;

pub use handler::{Context, DefaultHandler, Handler};
pub use master::{Master, Topology, WorkerLink};
pub use peer::{ClientId, FlushTask, Peer, PeerState, Registry};
pub use process::Server;
pub use worker::Worker;
