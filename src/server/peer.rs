//! Connection records and the ordered write path.
//!
//! Every socket the server writes to (clients, worker links, the master link)
//! is wrapped in a [`Peer`]. Writes never happen inline: callers queue encoded
//! frames with [`Peer::enqueue`] and spawn the returned [`FlushTask`], which
//! waits for writability before each write. At most one flush task exists per
//! peer, so bytes leave in the order they were queued.
//!
//! # Lifecycle
//!
//! ```text
//! Accepted ──▶ Handshaking ──▶ Open ──▶ Closing ──▶ Closed
//!                   │                      ▲
//!                   └──── rejected ────────┘
//! ```
//!
//! A `Closing` peer accepts no new frames. If it was closed with
//! [`Peer::finish`], the frames already queued are still flushed, then the
//! flush task deregisters the socket and shuts it down.
//!
//! # Non-blocking I/O
//!
//! Sockets are non-blocking. Reads land in a per-peer receive buffer so a
//! frame may arrive over several wakeups; a write the kernel only partly
//! accepts keeps its offset and the flush task waits for writability again.
//! A peer whose unsent bytes exceed its outbox limit is failed on the spot.

use crate::net::websocket::{Decoded, FrameCodec};
use crate::net::Stream;
use crate::runtime::{Resume, Step, Task};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 4096;

/// Bytes moved from the socket into the receive buffer per frame read.
const RECEIVE_BUDGET: usize = 64 * 1024;

/// Identity of a client connection inside one worker.
///
/// Two live connections never share a descriptor, so the descriptor is the
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(RawFd);

impl ClientId {
    /// Identity for the connection on `fd`.
    #[must_use]
    pub const fn from_fd(fd: RawFd) -> Self {
        Self(fd)
    }

    /// The underlying descriptor.
    #[must_use]
    pub const fn fd(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Accepted, nothing read yet.
    Accepted,
    /// Upgrade request being processed.
    Handshaking,
    /// Exchanging frames.
    Open,
    /// Close path started; no new frames are accepted.
    Closing,
    /// Socket shut down.
    Closed,
}

struct Outgoing {
    bytes: Rc<[u8]>,
    offset: usize,
}

/// One connected socket plus its outbound queue.
pub struct Peer {
    stream: Stream,
    id: ClientId,
    label: String,
    state: Cell<PeerState>,
    outbox: RefCell<VecDeque<Outgoing>>,
    queued_bytes: Cell<usize>,
    outbox_limit: usize,
    inbox: RefCell<Vec<u8>>,
    hung_up: Cell<bool>,
    flushing: Cell<bool>,
    close_after_flush: Cell<bool>,
    bytes_sent: Cell<u64>,
}

impl Peer {
    /// Wraps a prepared stream.
    #[must_use]
    pub fn new(stream: Stream) -> Self {
        let id = ClientId::from_fd(stream.fd());
        let label = stream.peer_label();
        Self {
            stream,
            id,
            label,
            state: Cell::new(PeerState::Accepted),
            outbox: RefCell::new(VecDeque::new()),
            queued_bytes: Cell::new(0),
            outbox_limit: usize::MAX,
            inbox: RefCell::new(Vec::new()),
            hung_up: Cell::new(false),
            flushing: Cell::new(false),
            close_after_flush: Cell::new(false),
            bytes_sent: Cell::new(0),
        }
    }

    /// Caps the unsent bytes this peer may accumulate.
    #[must_use]
    pub fn outbox_limit(mut self, limit: usize) -> Self {
        self.outbox_limit = limit;
        self
    }

    /// Connection identity.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Socket descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.id.fd()
    }

    /// Remote address for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    /// Returns true once the close path has started.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(self.state.get(), PeerState::Closing | PeerState::Closed)
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        trace!(peer = %self.label, fd = self.fd(), from = ?self.state.get(), to = ?state, "peer state");
        self.state.set(state);
    }

    /// Frames queued but not fully written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outbox.borrow().len()
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.queued_bytes.get()
    }

    /// Total bytes written to the socket.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.get()
    }

    /// Moves up to `budget` available bytes from the socket into the receive
    /// buffer without blocking. Returns false once the peer has hung up (EOF
    /// or a read error); bytes buffered before that stay readable.
    pub(crate) fn receive(&self, budget: usize) -> bool {
        if self.hung_up.get() {
            return false;
        }
        let mut inbox = self.inbox.borrow_mut();
        let mut chunk = [0u8; READ_CHUNK];
        let mut left = budget;
        while left > 0 {
            let want = left.min(READ_CHUNK);
            match (&self.stream).read(&mut chunk[..want]) {
                Ok(0) => {
                    self.hung_up.set(true);
                    break;
                }
                Ok(n) => {
                    inbox.extend_from_slice(&chunk[..n]);
                    left -= n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!(peer = %self.label, error = %e, "read failed");
                    self.hung_up.set(true);
                    break;
                }
            }
        }
        !self.hung_up.get()
    }

    /// Returns true once a read saw EOF or failed.
    pub(crate) fn hung_up(&self) -> bool {
        self.hung_up.get()
    }

    /// Bytes received but not consumed yet.
    pub(crate) fn buffered(&self) -> usize {
        self.inbox.borrow().len()
    }

    /// Returns true if a whole frame (or a header the codec rejects) is buffered.
    pub(crate) fn has_frame(&self, codec: &FrameCodec) -> bool {
        let inbox = self.inbox.borrow();
        codec.frame_extent(&inbox).is_some_and(|extent| extent <= inbox.len())
    }

    /// Takes the next complete frame out of the receive buffer.
    pub(crate) fn next_frame(&self, codec: &FrameCodec) -> Option<Decoded> {
        codec.decode_buffered(&mut self.inbox.borrow_mut())
    }

    /// Receives what the socket has and takes the next complete frame.
    ///
    /// `None` means the frame is still partial and the caller should wait for
    /// readability. A hang-up with no complete frame left yields `Closed`.
    pub(crate) fn read_frame(&self, codec: &FrameCodec) -> Option<Decoded> {
        let open = self.receive(RECEIVE_BUDGET);
        match self.next_frame(codec) {
            Some(decoded) => Some(decoded),
            None if open => None,
            None => Some(Decoded::Closed),
        }
    }

    /// Returns true if [`read_frame`](Self::read_frame) can answer without
    /// waiting for readability.
    pub(crate) fn frame_ready(&self, codec: &FrameCodec) -> bool {
        self.has_frame(codec) || self.hung_up()
    }

    /// Takes an HTTP request head (through the blank line) out of the receive
    /// buffer, once it is complete.
    pub(crate) fn take_head(&self) -> Option<Vec<u8>> {
        let mut inbox = self.inbox.borrow_mut();
        let end = inbox
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|at| at + 4)
            .or_else(|| inbox.windows(2).position(|w| w == b"\n\n").map(|at| at + 2))?;
        Some(inbox.drain(..end).collect())
    }

    /// Takes everything buffered.
    pub(crate) fn take_buffered(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inbox.borrow_mut())
    }

    /// Queues encoded bytes for delivery.
    ///
    /// Returns the flush task to spawn when no flush is in progress. A closing
    /// peer drops the frame and returns `None`. A frame that would push the
    /// unsent bytes past the outbox limit fails the peer instead.
    pub fn enqueue(self: &Rc<Self>, bytes: Rc<[u8]>) -> Option<FlushTask> {
        if self.is_closing() {
            trace!(peer = %self.label, len = bytes.len(), "dropping frame for closing peer");
            return None;
        }
        let queued = self.queued_bytes.get().saturating_add(bytes.len());
        if queued > self.outbox_limit {
            self.fail(format_args!(
                "outbox over limit ({queued} > {} bytes)",
                self.outbox_limit
            ));
            return None;
        }
        self.push(bytes);
        self.start_flush()
    }

    fn push(&self, bytes: Rc<[u8]>) {
        self.queued_bytes.set(self.queued_bytes.get() + bytes.len());
        self.outbox.borrow_mut().push_back(Outgoing { bytes, offset: 0 });
    }

    fn clear_outbox(&self) {
        self.outbox.borrow_mut().clear();
        self.queued_bytes.set(0);
    }

    /// Starts the close path: queues `last` (if any), refuses further frames,
    /// and closes the socket once everything queued has been written.
    pub fn finish(self: &Rc<Self>, last: Option<Rc<[u8]>>) -> Option<FlushTask> {
        if self.state.get() == PeerState::Closed {
            return None;
        }
        if let Some(bytes) = last {
            self.push(bytes);
        }
        self.close_after_flush.set(true);
        self.set_state(PeerState::Closing);
        self.start_flush()
    }

    /// Shuts the socket down and marks the peer closed.
    ///
    /// The descriptor must already be deregistered from the scheduler. It is
    /// released when the last handle to the peer is dropped.
    pub(crate) fn close(&self) {
        if let Err(e) = self.stream.shutdown() {
            trace!(peer = %self.label, error = %e, "shutdown failed");
        }
        self.clear_outbox();
        self.inbox.borrow_mut().clear();
        self.set_state(PeerState::Closed);
    }

    fn start_flush(self: &Rc<Self>) -> Option<FlushTask> {
        if self.flushing.replace(true) {
            None
        } else {
            Some(FlushTask::new(Rc::clone(self)))
        }
    }

    /// Whether the flush task may keep writing.
    fn may_write(&self) -> bool {
        match self.state.get() {
            PeerState::Closed => false,
            PeerState::Closing => self.close_after_flush.get(),
            _ => true,
        }
    }

    /// One write from the front of the outbox. Returns true when the outbox
    /// is empty afterwards; a full send buffer counts as zero bytes written.
    fn write_front(&self) -> io::Result<bool> {
        let mut outbox = self.outbox.borrow_mut();
        let Some(front) = outbox.front_mut() else {
            return Ok(true);
        };
        let n = match (&self.stream).write(&front.bytes[front.offset..]) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                trace!(peer = %self.label, pending = self.queued_bytes.get(), "send buffer full");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
        }
        front.offset += n;
        self.queued_bytes.set(self.queued_bytes.get().saturating_sub(n));
        self.bytes_sent.set(self.bytes_sent.get() + n as u64);
        if front.offset == front.bytes.len() {
            outbox.pop_front();
        }
        Ok(outbox.is_empty())
    }

    /// Stop sending and shut the socket so the reader of this peer observes
    /// EOF and runs its own close path.
    fn fail(&self, reason: impl fmt::Display) {
        warn!(peer = %self.label, fd = self.fd(), reason = %reason, "peer failed");
        self.clear_outbox();
        if self.state.get() != PeerState::Closed {
            self.set_state(PeerState::Closing);
        }
        if let Err(e) = self.stream.shutdown() {
            trace!(peer = %self.label, error = %e, "shutdown failed");
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state.get())
            .field("pending", &self.pending())
            .field("pending_bytes", &self.queued_bytes.get())
            .field("flushing", &self.flushing.get())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushPhase {
    Idle,
    Writing,
    Closing,
}

/// Drains a peer's outbox: `WaitWritable`, one write, repeat.
#[derive(Debug)]
pub struct FlushTask {
    peer: Rc<Peer>,
    phase: FlushPhase,
}

impl FlushTask {
    fn new(peer: Rc<Peer>) -> Self {
        Self {
            peer,
            phase: FlushPhase::Idle,
        }
    }

    fn drained(&mut self) -> Step {
        if self.peer.close_after_flush.get() && self.peer.state() != PeerState::Closed {
            self.phase = FlushPhase::Closing;
            return Step::deregister(self.peer.fd());
        }
        self.peer.flushing.set(false);
        Step::Done
    }
}

impl Task for FlushTask {
    fn resume(&mut self, value: Resume) -> Step {
        let peer = &self.peer;
        if self.phase == FlushPhase::Closing {
            if value == Resume::Deregistered {
                debug!(peer = %peer.label, fd = peer.fd(), sent = peer.bytes_sent(), "closed after flush");
                peer.close();
                peer.flushing.set(false);
                return Step::Done;
            }
            return Step::deregister(peer.fd());
        }
        if !peer.may_write() {
            peer.flushing.set(false);
            return Step::Done;
        }

        match self.phase {
            FlushPhase::Idle => {
                if peer.pending() == 0 {
                    return self.drained();
                }
                self.phase = FlushPhase::Writing;
                Step::wait_writable(peer.fd())
            }
            FlushPhase::Writing => match peer.write_front() {
                Ok(true) => self.drained(),
                Ok(false) => Step::wait_writable(peer.fd()),
                Err(e) => {
                    peer.fail(format_args!("write failed: {e}"));
                    self.drained()
                }
            },
            FlushPhase::Closing => Step::Done,
        }
    }

    fn name(&self) -> &'static str {
        "flush"
    }
}

/// Open client connections of one worker, ordered by id.
#[derive(Debug, Default)]
pub struct Registry {
    peers: RefCell<BTreeMap<ClientId, Rc<Peer>>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer. Replaces a stale entry with the same id.
    pub fn insert(&self, peer: Rc<Peer>) {
        if let Some(stale) = self.peers.borrow_mut().insert(peer.id(), peer) {
            warn!(client = %stale.id(), "replaced stale registry entry");
        }
    }

    /// Removes a peer.
    pub fn remove(&self, id: ClientId) -> Option<Rc<Peer>> {
        self.peers.borrow_mut().remove(&id)
    }

    /// Looks up a peer.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<Rc<Peer>> {
        self.peers.borrow().get(&id).cloned()
    }

    /// Registered ids.
    #[must_use]
    pub fn ids(&self) -> Vec<ClientId> {
        self.peers.borrow().keys().copied().collect()
    }

    /// Handles to every registered peer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Rc<Peer>> {
        self.peers.borrow().values().cloned().collect()
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.borrow().len()
    }

    /// Returns true if no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.borrow().is_empty()
    }
}
