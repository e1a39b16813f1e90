//! Worker process: client connections and the master link.
//!
//! Every activity is a task that suspends on readiness and replaces itself
//! with a fresh instance instead of looping:
//!
//! ```text
//! AcceptLoop ──accept──▶ Handshake ──101 + validate──▶ ReadLoop ─┐
//!     ▲   │                                              ▲       │ frame
//!     └───┘ respawn                                      └───────┘ respawn
//!
//! MasterLoop ──text──▶ on_master_message ──▶ respawn
//! ```
//!
//! A task that has to emit several children (flushes queued by a hook, the
//! next loop instance) drains a [`SpawnQueue`] one `Spawn` per step before it
//! finishes.
//!
//! Reads never block. A wakeup moves what the socket has into the peer's
//! receive buffer; a partial request or frame sends the task back to
//! `WaitReadable`, and a loop instance that finds a complete frame already
//! buffered skips the wait.

use super::handler::{Context, Handler};
use super::peer::{ClientId, Peer, PeerState, Registry};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::net::websocket::{self, encode, Decoded, Frame, FrameCodec, Opcode};
use crate::net::{Listener, Stream};
use crate::runtime::{Resume, Scheduler, SpawnQueue, Step, Task};
use std::cell::RefCell;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};

struct Shared<H> {
    id: usize,
    listener: Listener,
    master: Rc<Peer>,
    registry: Registry,
    handler: RefCell<H>,
    config: ConnectionConfig,
    codec: FrameCodec,
}

impl<H: Handler> Shared<H> {
    fn with_handler<R>(
        &self,
        spawns: &mut SpawnQueue,
        f: impl FnOnce(&mut H, &mut Context<'_>) -> R,
    ) -> R {
        let mut ctx = Context::new(self.id, &self.registry, &self.master, spawns);
        let mut handler = self.handler.borrow_mut();
        f(&mut *handler, &mut ctx)
    }


    fn trace_payload(&self, client: ClientId, payload: &[u8]) {
        if self.config.trace_payloads {
            trace!(
                worker = self.id,
                client = %client,
                payload = %String::from_utf8_lossy(payload),
                "text frame"
            );
        }
    }
}

/// A worker: accepts clients on the shared listener and relays through the
/// master link.
pub struct Worker<H> {
    shared: Rc<Shared<H>>,
}

impl<H: Handler + 'static> Worker<H> {
    /// Builds a worker around an inherited listener and its end of the
    /// master link.
    pub fn new(
        id: usize,
        listener: Listener,
        master: Stream,
        handler: H,
        config: ConnectionConfig,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        master.prepare()?;
        let master = Rc::new(Peer::new(master));
        master.set_state(PeerState::Open);
        let codec = FrameCodec::new().max_payload_size(config.max_payload_size);
        Ok(Self {
            shared: Rc::new(Shared {
                id,
                listener,
                master,
                registry: Registry::new(),
                handler: RefCell::new(handler),
                config,
                codec,
            }),
        })
    }

    /// Worker index.
    #[must_use]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Address of a TCP listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.tcp_addr()
    }

    /// Registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Adds the accept loop and the master-link loop to `sched`.
    pub fn spawn_into(&self, sched: &mut Scheduler) {
        sched.spawn(AcceptLoop::new(Rc::clone(&self.shared)));
        sched.spawn(MasterLoop::new(Rc::clone(&self.shared)));
    }

    /// Runs the worker on a fresh scheduler until the poller fails.
    pub fn run(self) -> Result<Infallible> {
        let mut sched = Scheduler::new().map_err(Error::poll)?;
        self.spawn_into(&mut sched);
        info!(
            worker = self.shared.id,
            listener = self.shared.listener.fd(),
            master = self.shared.master.fd(),
            "worker running"
        );
        sched.run().map_err(Error::poll)
    }
}

impl<H> std::fmt::Debug for Worker<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("clients", &self.shared.registry.len())
            .field("master", &self.shared.master)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Waiting,
    Deregistering,
    Finished,
}

struct AcceptLoop<H> {
    shared: Rc<Shared<H>>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl<H: Handler + 'static> AcceptLoop<H> {
    fn new(shared: Rc<Shared<H>>) -> Self {
        Self {
            shared,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }

    fn accept(&mut self) {
        let shared = &self.shared;
        match shared.listener.accept() {
            Ok(stream) => match stream.prepare() {
                Ok(()) => {
                    let limit = shared.config.max_outbox_bytes;
                    let peer = Rc::new(Peer::new(stream).outbox_limit(limit));
                    debug!(worker = shared.id, client = %peer.id(), peer = %peer.label(), "accepted");
                    self.spawns.push(Handshake::new(Rc::clone(shared), peer));
                }
                Err(e) => warn!(worker = shared.id, error = %e, "cannot prepare accepted socket"),
            },
            // Another worker won the race for this connection.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(worker = shared.id, "accept lost race");
            }
            Err(e) => warn!(worker = shared.id, error = %e, "accept failed"),
        }
    }
}

impl<H: Handler + 'static> Task for AcceptLoop<H> {
    fn resume(&mut self, _value: Resume) -> Step {
        if let Some(step) = self.spawns.next_step() {
            return step;
        }
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Waiting;
                Step::wait_readable(self.shared.listener.fd())
            }
            Phase::Waiting => {
                self.accept();
                self.spawns.push(AcceptLoop::new(Rc::clone(&self.shared)));
                self.phase = Phase::Finished;
                self.spawns.next_step().unwrap_or(Step::Done)
            }
            Phase::Deregistering | Phase::Finished => Step::Done,
        }
    }

    fn name(&self) -> &'static str {
        "accept"
    }
}

enum Request {
    /// More bytes are needed.
    Pending,
    /// The client left before finishing its request.
    Gone,
    /// A request head, or everything that fit in the handshake buffer.
    Head(Vec<u8>),
}

struct Handshake<H> {
    shared: Rc<Shared<H>>,
    peer: Rc<Peer>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl<H: Handler + 'static> Handshake<H> {
    fn new(shared: Rc<Shared<H>>, peer: Rc<Peer>) -> Self {
        Self {
            shared,
            peer,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }

    fn queue_flush(&mut self, flush: Option<super::peer::FlushTask>) {
        if let Some(flush) = flush {
            self.spawns.push(flush);
        }
    }

    fn poll_request(&self) -> Request {
        let limit = self.shared.config.handshake_buffer_size;
        let peer = &self.peer;
        let open = peer.receive(limit.saturating_sub(peer.buffered()));
        if let Some(head) = peer.take_head() {
            return Request::Head(head);
        }
        if !open {
            debug!(worker = self.shared.id, client = %peer.id(), buffered = peer.buffered(), "closed before handshake");
            return Request::Gone;
        }
        if peer.buffered() >= limit {
            return Request::Head(peer.take_buffered());
        }
        Request::Pending
    }

    /// Answers the upgrade request and settles the connection.
    fn negotiate(&mut self, request: &[u8]) {
        let shared = Rc::clone(&self.shared);
        let peer = Rc::clone(&self.peer);

        let (headers, response) = match websocket::accept(request) {
            Ok(accepted) => accepted,
            Err(e) => {
                info!(worker = shared.id, client = %peer.id(), peer = %peer.label(), error = %e, "handshake rejected");
                let flush = peer.finish(Some(Rc::from(websocket::reject(400, "Bad Request"))));
                self.queue_flush(flush);
                return;
            }
        };

        self.queue_flush(peer.enqueue(Rc::from(response.response_bytes())));
        let accepted = shared.handler.borrow_mut().validate_client(&headers, &peer);
        if !accepted {
            info!(worker = shared.id, client = %peer.id(), path = ?headers.path(), "client refused by validation");
            let flush = peer.finish(None);
            self.queue_flush(flush);
            return;
        }

        shared.registry.insert(Rc::clone(&peer));
        peer.set_state(PeerState::Open);
        info!(
            worker = shared.id,
            client = %peer.id(),
            peer = %peer.label(),
            clients = shared.registry.len(),
            "client connected"
        );
        let client = peer.id();
        shared.with_handler(&mut self.spawns, |handler, ctx| handler.on_connect(client, ctx));
        self.spawns.push(ReadLoop::new(Rc::clone(&shared), peer));
    }

    fn abort(&mut self) -> Step {
        self.peer.set_state(PeerState::Closing);
        self.phase = Phase::Deregistering;
        Step::deregister(self.peer.fd())
    }
}

impl<H: Handler + 'static> Task for Handshake<H> {
    fn resume(&mut self, value: Resume) -> Step {
        if let Some(step) = self.spawns.next_step() {
            return step;
        }
        match self.phase {
            Phase::Start => {
                self.peer.set_state(PeerState::Handshaking);
                self.phase = Phase::Waiting;
                Step::wait_readable(self.peer.fd())
            }
            Phase::Waiting => match self.poll_request() {
                Request::Pending => Step::wait_readable(self.peer.fd()),
                Request::Gone => self.abort(),
                Request::Head(request) => {
                    self.phase = Phase::Finished;
                    self.negotiate(&request);
                    self.spawns.next_step().unwrap_or(Step::Done)
                }
            },
            Phase::Deregistering => {
                if value == Resume::Deregistered {
                    self.peer.close();
                    Step::Done
                } else {
                    Step::deregister(self.peer.fd())
                }
            }
            Phase::Finished => Step::Done,
        }
    }

    fn name(&self) -> &'static str {
        "handshake"
    }
}

struct ReadLoop<H> {
    shared: Rc<Shared<H>>,
    peer: Rc<Peer>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl<H: Handler + 'static> ReadLoop<H> {
    fn new(shared: Rc<Shared<H>>, peer: Rc<Peer>) -> Self {
        Self {
            shared,
            peer,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }

    fn respawn(&mut self) {
        self.spawns
            .push(ReadLoop::new(Rc::clone(&self.shared), Rc::clone(&self.peer)));
    }

    /// Runs `on_close` and forgets the client. The peer is already closing.
    fn leave(&mut self) {
        let shared = Rc::clone(&self.shared);
        let client = self.peer.id();
        shared.with_handler(&mut self.spawns, |handler, ctx| handler.on_close(client, ctx));
        shared.registry.remove(client);
        info!(worker = shared.id, client = %client, clients = shared.registry.len(), "client disconnected");
    }

    /// Handles one decoded frame. Returns true if the connection goes on.
    fn dispatch(&mut self, decoded: Decoded) -> bool {
        let shared = Rc::clone(&self.shared);
        let peer = Rc::clone(&self.peer);
        let client = peer.id();
        match decoded {
            Decoded::Closed => {
                debug!(worker = shared.id, client = %client, "client hung up");
                false
            }
            Decoded::Frame(frame) => match frame.opcode {
                Opcode::Close => {
                    debug!(worker = shared.id, client = %client, "close frame");
                    false
                }
                Opcode::Ping => {
                    trace!(worker = shared.id, client = %client, len = frame.payload.len(), "ping");
                    if let Some(flush) = peer.enqueue(Rc::from(encode(&frame.payload, Opcode::Pong))) {
                        self.spawns.push(flush);
                    }
                    true
                }
                Opcode::Text => {
                    shared.trace_payload(client, &frame.payload);
                    shared.with_handler(&mut self.spawns, |handler, ctx| {
                        handler.on_client_message(&frame.payload, client, ctx);
                    });
                    true
                }
                Opcode::Binary | Opcode::Pong => {
                    trace!(worker = shared.id, client = %client, opcode = ?frame.opcode, "frame ignored");
                    true
                }
            },
            Decoded::Invalid { opcode, error } => {
                warn!(worker = shared.id, client = %client, opcode = ?opcode, error = %error, "protocol violation");
                let close = Frame::close(error.close_code(), &error.to_string()).encode();
                if let Some(flush) = peer.finish(Some(Rc::from(close))) {
                    self.spawns.push(flush);
                }
                self.leave();
                self.phase = Phase::Finished;
                true
            }
        }
    }
}

impl<H: Handler + 'static> Task for ReadLoop<H> {
    fn resume(&mut self, value: Resume) -> Step {
        if let Some(step) = self.spawns.next_step() {
            return step;
        }
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Waiting;
                if self.peer.frame_ready(&self.shared.codec) {
                    return Step::Continue;
                }
                Step::wait_readable(self.peer.fd())
            }
            Phase::Waiting => {
                let Some(decoded) = self.peer.read_frame(&self.shared.codec) else {
                    return Step::wait_readable(self.peer.fd());
                };
                if self.dispatch(decoded) {
                    if self.phase == Phase::Waiting {
                        self.respawn();
                        self.phase = Phase::Finished;
                    }
                } else {
                    self.peer.set_state(PeerState::Closing);
                    self.leave();
                    self.phase = Phase::Deregistering;
                }
                self.resume(Resume::Continue)
            }
            Phase::Deregistering => {
                if value == Resume::Deregistered {
                    self.peer.close();
                    self.phase = Phase::Finished;
                    Step::Done
                } else {
                    Step::deregister(self.peer.fd())
                }
            }
            Phase::Finished => Step::Done,
        }
    }

    fn name(&self) -> &'static str {
        "read"
    }
}

struct MasterLoop<H> {
    shared: Rc<Shared<H>>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl<H: Handler + 'static> MasterLoop<H> {
    fn new(shared: Rc<Shared<H>>) -> Self {
        Self {
            shared,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }
}

impl<H: Handler + 'static> Task for MasterLoop<H> {
    fn resume(&mut self, value: Resume) -> Step {
        if let Some(step) = self.spawns.next_step() {
            return step;
        }
        let shared = Rc::clone(&self.shared);
        let master = &shared.master;
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Waiting;
                if master.frame_ready(&shared.codec) {
                    return Step::Continue;
                }
                Step::wait_readable(master.fd())
            }
            Phase::Waiting => {
                let Some(decoded) = master.read_frame(&shared.codec) else {
                    return Step::wait_readable(master.fd());
                };
                match decoded {
                    Decoded::Frame(frame) if frame.opcode == Opcode::Text => {
                        if shared.config.trace_payloads {
                            trace!(worker = shared.id, payload = %String::from_utf8_lossy(&frame.payload), "master frame");
                        }
                        shared.with_handler(&mut self.spawns, |handler, ctx| {
                            handler.on_master_message(&frame.payload, ctx);
                        });
                    }
                    Decoded::Frame(frame) => {
                        trace!(worker = shared.id, opcode = ?frame.opcode, "master frame ignored");
                    }
                    Decoded::Invalid { error, .. } => {
                        warn!(worker = shared.id, error = %error, "invalid frame on master link");
                    }
                    Decoded::Closed => {
                        error!(worker = shared.id, "master link closed; no longer relaying");
                        master.set_state(PeerState::Closing);
                        self.phase = Phase::Deregistering;
                        return Step::deregister(master.fd());
                    }
                }
                self.spawns.push(MasterLoop::new(Rc::clone(&shared)));
                self.phase = Phase::Finished;
                self.spawns.next_step().unwrap_or(Step::Done)
            }
            Phase::Deregistering => {
                if value == Resume::Deregistered {
                    master.close();
                    Step::Done
                } else {
                    Step::deregister(master.fd())
                }
            }
            Phase::Finished => Step::Done,
        }
    }

    fn name(&self) -> &'static str {
        "master-link"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::websocket::{decode, encode_masked, CloseCode};
    use crate::server::handler::DefaultHandler;
    use crate::test_utils::init_test_logging;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    const TICK: Option<Duration> = Some(Duration::from_millis(5));
    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    struct Harness<H> {
        worker: Worker<H>,
        sched: Scheduler,
        master_remote: UnixStream,
    }

    impl<H: Handler + 'static> Harness<H> {
        fn new(handler: H) -> Self {
            init_test_logging();
            let listener = Listener::bind_tcp("127.0.0.1:0").unwrap();
            let (worker_end, master_remote) = UnixStream::pair().unwrap();
            master_remote
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let worker = Worker::new(
                0,
                listener,
                Stream::from(worker_end),
                handler,
                ConnectionConfig::default(),
            )
            .unwrap();
            let mut sched = Scheduler::new().unwrap();
            worker.spawn_into(&mut sched);
            Self {
                worker,
                sched,
                master_remote,
            }
        }

        /// Turns the scheduler until three consecutive idle ticks.
        fn drive(&mut self) {
            let mut quiet = 0;
            for _ in 0..1000 {
                let turn = self.sched.turn(TICK).unwrap();
                if turn.ran.is_none() && turn.events == 0 {
                    quiet += 1;
                    if quiet == 3 {
                        break;
                    }
                } else {
                    quiet = 0;
                }
            }
        }

        fn connect(&mut self) -> TcpStream {
            let addr = self.worker.local_addr().unwrap();
            let mut client = TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            let request = format!(
                "GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                 Connection: Upgrade\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
            );
            client.write_all(request.as_bytes()).unwrap();
            self.drive();
            client
        }

        fn upgrade(&mut self) -> TcpStream {
            let mut client = self.connect();
            let response = read_response(&mut client);
            assert!(response.starts_with("HTTP/1.1 101"), "{response}");
            client
        }
    }

    fn read_response(client: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        while !data.ends_with(b"\r\n\r\n") {
            match client.read(&mut byte) {
                Ok(0) | Err(_) => break,
                Ok(_) => data.push(byte[0]),
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn send(client: &mut TcpStream, payload: &[u8], opcode: Opcode) {
        client
            .write_all(&encode_masked(payload, opcode, [1, 2, 3, 4]))
            .unwrap();
    }

    #[test]
    fn test_handshake_registers_client() {
        let mut h = Harness::new(DefaultHandler);
        let mut client = h.connect();
        let response = read_response(&mut client);
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(h.worker.client_count(), 1);
    }

    #[test]
    fn test_missing_key_gets_400_and_close() {
        let mut h = Harness::new(DefaultHandler);
        let addr = h.worker.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        h.drive();

        let mut body = String::new();
        client.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("HTTP/1.1 400"), "{body}");
        assert_eq!(h.worker.client_count(), 0);
    }

    #[test]
    fn test_text_echoes_locally_and_forwards_to_master() {
        let mut h = Harness::new(DefaultHandler);
        let mut a = h.upgrade();
        let mut b = h.upgrade();
        assert_eq!(h.worker.client_count(), 2);

        send(&mut a, b"hello", Opcode::Text);
        h.drive();

        for client in [&mut a, &mut b] {
            match decode(client) {
                Decoded::Frame(frame) => assert_eq!(frame.payload, b"hello"),
                other => panic!("unexpected {other:?}"),
            }
        }
        match decode(&mut h.master_remote) {
            Decoded::Frame(frame) => {
                assert_eq!(frame.opcode, Opcode::Text);
                assert!(!frame.masked);
                assert_eq!(frame.payload, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_master_message_reaches_local_clients_only() {
        let mut h = Harness::new(DefaultHandler);
        let mut a = h.upgrade();
        h.master_remote
            .write_all(&encode(b"from afar", Opcode::Text))
            .unwrap();
        h.drive();

        match decode(&mut a) {
            Decoded::Frame(frame) => assert_eq!(frame.payload, b"from afar"),
            other => panic!("unexpected {other:?}"),
        }
        let mut buf = [0u8; 1];
        assert!(h.master_remote.read(&mut buf).is_err(), "nothing echoed to master");
    }

    #[test]
    fn test_ping_gets_pong() {
        let mut h = Harness::new(DefaultHandler);
        let mut a = h.upgrade();
        send(&mut a, b"beat", Opcode::Ping);
        h.drive();
        match decode(&mut a) {
            Decoded::Frame(frame) => {
                assert_eq!(frame.opcode, Opcode::Pong);
                assert_eq!(frame.payload, b"beat");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_close_frame_unregisters_and_runs_hook() {
        struct Counting(Rc<std::cell::Cell<u32>>);
        impl Handler for Counting {
            fn on_close(&mut self, _client: ClientId, ctx: &mut Context<'_>) {
                self.0.set(self.0.get() + 1);
                ctx.broadcast_local(&encode(b"someone left", Opcode::Text));
            }
        }

        let closed = Rc::new(std::cell::Cell::new(0));
        let mut h = Harness::new(Counting(Rc::clone(&closed)));
        let mut a = h.upgrade();
        let mut b = h.upgrade();
        send(&mut a, b"", Opcode::Close);
        h.drive();

        assert_eq!(closed.get(), 1);
        assert_eq!(h.worker.client_count(), 1);
        match decode(&mut b) {
            Decoded::Frame(frame) => assert_eq!(frame.payload, b"someone left"),
            other => panic!("unexpected {other:?}"),
        }
        // The closing client got nothing and sees EOF.
        assert!(matches!(decode(&mut a), Decoded::Closed));
    }

    #[test]
    fn test_protocol_violation_sends_close_code() {
        let mut h = Harness::new(DefaultHandler);
        let mut a = h.upgrade();
        // RSV1 set on a text frame; rejected before the second byte is read.
        a.write_all(&[0xC1]).unwrap();
        h.drive();

        match decode(&mut a) {
            Decoded::Frame(frame) => {
                assert_eq!(frame.opcode, Opcode::Close);
                let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                assert_eq!(code, u16::from(CloseCode::ProtocolError));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(decode(&mut a), Decoded::Closed));
        assert_eq!(h.worker.client_count(), 0);
    }

    #[test]
    fn test_stalled_client_does_not_hold_others() {
        let mut h = Harness::new(DefaultHandler);
        let mut a = h.upgrade();
        let mut b = h.upgrade();
        let late = encode_masked(b"late", Opcode::Text, [5, 6, 7, 8]);

        // A sends the first header byte of a frame and goes quiet.
        a.write_all(&late[..1]).unwrap();
        h.drive();

        let started = Instant::now();
        send(&mut b, b"hi", Opcode::Text);
        h.drive();
        match decode(&mut b) {
            Decoded::Frame(frame) => assert_eq!(frame.payload, b"hi"),
            other => panic!("unexpected {other:?}"),
        }
        let waited = started.elapsed();
        assert!(waited < Duration::from_secs(1), "echo took {waited:?}");
        assert_eq!(h.worker.client_count(), 2);

        // A completes its frame and is served normally.
        a.write_all(&late[1..]).unwrap();
        h.drive();
        for expected in [&b"hi"[..], &b"late"[..]] {
            match decode(&mut a) {
                Decoded::Frame(frame) => assert_eq!(frame.payload, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(decode(&mut b), Decoded::Frame(f) if f.payload == b"late"));
    }

    #[test]
    fn test_frame_sent_with_request_is_not_lost() {
        let mut h = Harness::new(DefaultHandler);
        let addr = h.worker.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut bytes = format!(
            "GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
        )
        .into_bytes();
        bytes.extend_from_slice(&encode_masked(b"eager", Opcode::Text, [1, 1, 1, 1]));
        client.write_all(&bytes).unwrap();
        h.drive();

        assert!(read_response(&mut client).starts_with("HTTP/1.1 101"));
        assert!(matches!(decode(&mut client), Decoded::Frame(f) if f.payload == b"eager"));
    }

    #[test]
    fn test_request_split_across_reads() {
        let mut h = Harness::new(DefaultHandler);
        let addr = h.worker.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        client.write_all(b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n").unwrap();
        h.drive();
        assert_eq!(h.worker.client_count(), 0);

        client
            .write_all(format!("Sec-WebSocket-Key: {KEY}\r\n\r\n").as_bytes())
            .unwrap();
        h.drive();
        assert!(read_response(&mut client).contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(h.worker.client_count(), 1);
    }

    #[test]
    fn test_validation_rejects_client() {
        struct Gate;
        impl Handler for Gate {
            fn validate_client(&mut self, headers: &websocket::Headers, _peer: &Peer) -> bool {
                headers.path() == Some("/allowed")
            }
        }

        let mut h = Harness::new(Gate);
        let mut client = h.connect();
        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(matches!(decode(&mut client), Decoded::Closed));
        assert_eq!(h.worker.client_count(), 0);
    }

    #[test]
    fn test_master_eof_stops_link_loop() {
        let mut h = Harness::new(DefaultHandler);
        let master_fd = h.worker.shared.master.fd();
        drop(std::mem::replace(
            &mut h.master_remote,
            UnixStream::pair().unwrap().0,
        ));
        h.drive();
        assert_eq!(h.sched.read_waiters(master_fd), 0);
        assert_eq!(h.worker.shared.master.state(), PeerState::Closed);

        // Clients keep working locally.
        let mut a = h.upgrade();
        send(&mut a, b"still here", Opcode::Text);
        h.drive();
        assert!(matches!(decode(&mut a), Decoded::Frame(f) if f.payload == b"still here"));
    }
}
