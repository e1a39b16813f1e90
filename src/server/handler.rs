//! Connection hooks.
//!
//! A server customises behaviour by implementing [`Handler`]; every method has
//! a default, so an implementation overrides only what differs. Hooks run
//! inside scheduler tasks and must not block. They send through the
//! [`Context`], which queues frames on peers and collects the flush tasks the
//! calling task spawns after the hook returns.
//!
//! | Hook | Default |
//! |------|---------|
//! | `validate_client` | accept |
//! | `on_connect` | nothing |
//! | `on_close` | nothing |
//! | `on_client_message` | text frame to every local client and the master |
//! | `on_master_message` | text frame to every local client |

use super::peer::{ClientId, Peer, Registry};
use crate::net::websocket::{encode, Headers, Opcode};
use crate::runtime::SpawnQueue;
use std::rc::Rc;
use tracing::trace;

/// Capability set invoked by a worker.
pub trait Handler {
    /// Decides whether an upgraded connection is kept. Rejected connections
    /// are closed without `on_connect` or `on_close`.
    fn validate_client(&mut self, headers: &Headers, peer: &Peer) -> bool {
        let _ = (headers, peer);
        true
    }

    /// A client finished its handshake and is registered.
    fn on_connect(&mut self, client: ClientId, ctx: &mut Context<'_>) {
        let _ = (client, ctx);
    }

    /// A client is leaving. It is already closing, so sends to it are dropped.
    fn on_close(&mut self, client: ClientId, ctx: &mut Context<'_>) {
        let _ = (client, ctx);
    }

    /// A text frame arrived from a client.
    fn on_client_message(&mut self, payload: &[u8], client: ClientId, ctx: &mut Context<'_>) {
        let _ = client;
        ctx.broadcast(&encode(payload, Opcode::Text));
    }

    /// A text frame arrived from the master.
    ///
    /// The default never forwards back to the master; doing so would bounce
    /// the message between processes forever.
    fn on_master_message(&mut self, payload: &[u8], ctx: &mut Context<'_>) {
        ctx.broadcast_local(&encode(payload, Opcode::Text));
    }
}

/// Handler that keeps every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}

/// What a hook may do.
pub struct Context<'a> {
    worker_id: usize,
    registry: &'a Registry,
    master: &'a Rc<Peer>,
    spawns: &'a mut SpawnQueue,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        worker_id: usize,
        registry: &'a Registry,
        master: &'a Rc<Peer>,
        spawns: &'a mut SpawnQueue,
    ) -> Self {
        Self {
            worker_id,
            registry,
            master,
            spawns,
        }
    }

    /// Index of the worker running the hook.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Registered clients.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientId> {
        self.registry.ids()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Queues encoded frame bytes for one client. Returns false if the client
    /// is unknown or closing.
    pub fn send(&mut self, client: ClientId, wire: &[u8]) -> bool {
        let Some(peer) = self.registry.get(client) else {
            trace!(client = %client, "send to unknown client");
            return false;
        };
        if peer.is_closing() {
            return false;
        }
        self.push(&peer, Rc::from(wire));
        true
    }

    /// Queues encoded frame bytes for every local client and the master.
    /// Returns the number of local clients reached.
    pub fn broadcast(&mut self, wire: &[u8]) -> usize {
        let bytes: Rc<[u8]> = Rc::from(wire);
        let reached = self.fan_out(&bytes);
        let master = Rc::clone(self.master);
        self.push(&master, bytes);
        reached
    }

    /// Queues encoded frame bytes for every local client only.
    pub fn broadcast_local(&mut self, wire: &[u8]) -> usize {
        let bytes: Rc<[u8]> = Rc::from(wire);
        self.fan_out(&bytes)
    }

    /// Queues encoded frame bytes for the master link.
    pub fn send_to_master(&mut self, wire: &[u8]) -> bool {
        if self.master.is_closing() {
            return false;
        }
        let master = Rc::clone(self.master);
        self.push(&master, Rc::from(wire));
        true
    }

    fn fan_out(&mut self, bytes: &Rc<[u8]>) -> usize {
        let mut reached = 0;
        for peer in self.registry.snapshot() {
            if peer.is_closing() {
                continue;
            }
            self.push(&peer, Rc::clone(bytes));
            reached += 1;
        }
        trace!(worker = self.worker_id, reached, len = bytes.len(), "fan-out");
        reached
    }

    fn push(&mut self, peer: &Rc<Peer>, bytes: Rc<[u8]>) {
        if let Some(flush) = peer.enqueue(bytes) {
            self.spawns.push(flush);
        }
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("worker_id", &self.worker_id)
            .field("clients", &self.registry.len())
            .field("pending_spawns", &self.spawns.len())
            .finish()
    }
}
