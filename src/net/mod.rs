//! Networking primitives.
//!
//! - [`Listener`] / [`Stream`]: std sockets behind one type, identified by raw fd
//! - [`websocket`]: frame codec and upgrade handshake

mod socket;
pub mod websocket;

pub use socket::{Listener, Stream};
