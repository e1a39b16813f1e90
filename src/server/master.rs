//! Master process: relays frames between workers.
//!
//! The master owns one link per worker. A frame read from link *i* is
//! re-encoded (unmasked, same opcode) and queued on every other live link.
//! The optional connector accepts local injectors; each injector sends one
//! frame that is queued on *every* link.
//!
//! ```text
//!   link 0 ──frame──▶ Master ──▶ link 1, link 2, ... (never back to link 0)
//!   connector ─frame─▶ Master ──▶ all links
//! ```
//!
//! A link that hangs up or sends garbage is dropped from the fan-out set; the
//! others keep relaying. Links and injectors are read without blocking, so a
//! worker or injector that stops mid-frame only parks its own task.

use super::peer::{Peer, PeerState};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::net::websocket::{encode, Decoded, Frame, FrameCodec};
use crate::net::{Listener, Stream};
use crate::runtime::{Resume, Scheduler, SpawnQueue, Step, Task};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Master end of one worker link.
#[derive(Debug)]
pub struct WorkerLink {
    /// Worker index.
    pub id: usize,
    /// Connected stream to that worker.
    pub stream: Stream,
}

impl WorkerLink {
    /// Pairs a worker index with its stream.
    #[must_use]
    pub fn new(id: usize, stream: impl Into<Stream>) -> Self {
        Self {
            id,
            stream: stream.into(),
        }
    }
}

/// Everything the master routes between.
#[derive(Debug, Default)]
pub struct Topology {
    /// One link per worker.
    pub workers: Vec<WorkerLink>,
    /// Local injection endpoint.
    pub connector: Option<Listener>,
}

impl Topology {
    /// Topology over `workers` without a connector.
    #[must_use]
    pub fn new(workers: Vec<WorkerLink>) -> Self {
        Self {
            workers,
            connector: None,
        }
    }

    /// Adds a connector listener.
    #[must_use]
    pub fn connector(mut self, listener: Listener) -> Self {
        self.connector = Some(listener);
        self
    }
}

struct Shared {
    links: RefCell<BTreeMap<usize, Rc<Peer>>>,
    connector: Option<Listener>,
    config: ConnectionConfig,
    codec: FrameCodec,
}

impl Shared {
    /// Queues `frame` on every live link except `origin`. Returns the number
    /// of links reached.
    fn relay(&self, frame: &Frame, origin: Option<usize>, spawns: &mut SpawnQueue) -> usize {
        let wire: Rc<[u8]> = Rc::from(encode(&frame.payload, frame.opcode));
        let mut reached = 0;
        for (&id, peer) in self.links.borrow().iter() {
            if Some(id) == origin || peer.is_closing() {
                continue;
            }
            if let Some(flush) = peer.enqueue(Rc::clone(&wire)) {
                spawns.push(flush);
            }
            reached += 1;
        }
        if self.config.trace_payloads {
            trace!(
                origin = ?origin,
                reached,
                opcode = ?frame.opcode,
                payload = %String::from_utf8_lossy(&frame.payload),
                "relayed"
            );
        } else {
            trace!(origin = ?origin, reached, opcode = ?frame.opcode, len = frame.payload.len(), "relayed");
        }
        reached
    }
}

/// The fan-out router.
pub struct Master {
    shared: Rc<Shared>,
}

impl Master {
    /// Prepares every link and the connector.
    pub fn new(topology: Topology, config: ConnectionConfig) -> io::Result<Self> {
        let mut links = BTreeMap::new();
        for link in topology.workers {
            link.stream.prepare()?;
            let peer = Rc::new(Peer::new(link.stream));
            peer.set_state(PeerState::Open);
            links.insert(link.id, peer);
        }
        if let Some(connector) = &topology.connector {
            connector.set_nonblocking(true)?;
        }
        let codec = FrameCodec::new().max_payload_size(config.max_payload_size);
        Ok(Self {
            shared: Rc::new(Shared {
                links: RefCell::new(links),
                connector: topology.connector,
                config,
                codec,
            }),
        })
    }

    /// Workers still in the fan-out set.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.shared.links.borrow().len()
    }

    /// Ids of the workers still in the fan-out set.
    #[must_use]
    pub fn live_links(&self) -> Vec<usize> {
        self.shared.links.borrow().keys().copied().collect()
    }

    /// Adds one read loop per link, plus the connector loop.
    pub fn spawn_into(&self, sched: &mut Scheduler) {
        let links: Vec<(usize, Rc<Peer>)> = self
            .shared
            .links
            .borrow()
            .iter()
            .map(|(&id, peer)| (id, Rc::clone(peer)))
            .collect();
        for (id, peer) in links {
            sched.spawn(LinkLoop::new(Rc::clone(&self.shared), id, peer));
        }
        if self.shared.connector.is_some() {
            sched.spawn(ConnectorLoop::new(Rc::clone(&self.shared)));
        }
    }

    /// Runs the master on a fresh scheduler until the poller fails.
    pub fn run(self) -> Result<Infallible> {
        let mut sched = Scheduler::new().map_err(Error::poll)?;
        self.spawn_into(&mut sched);
        info!(
            links = self.link_count(),
            connector = self.shared.connector.is_some(),
            "master running"
        );
        sched.run().map_err(Error::poll)
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("links", &self.live_links())
            .field("connector", &self.shared.connector.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Waiting,
    Deregistering,
    Finished,
}

/// Reads one worker link.
struct LinkLoop {
    shared: Rc<Shared>,
    id: usize,
    peer: Rc<Peer>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl LinkLoop {
    fn new(shared: Rc<Shared>, id: usize, peer: Rc<Peer>) -> Self {
        Self {
            shared,
            id,
            peer,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }

    fn drop_link(&mut self, reason: &str) -> Step {
        self.shared.links.borrow_mut().remove(&self.id);
        self.peer.set_state(PeerState::Closing);
        warn!(
            worker = self.id,
            reason,
            remaining = self.shared.links.borrow().len(),
            "worker link dropped"
        );
        self.phase = Phase::Deregistering;
        Step::deregister(self.peer.fd())
    }
}

impl Task for LinkLoop {
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
                match decoded {
                    Decoded::Frame(frame) => {
                        self.shared.relay(&frame, Some(self.id), &mut self.spawns);
                        self.spawns.push(LinkLoop::new(
                            Rc::clone(&self.shared),
                            self.id,
                            Rc::clone(&self.peer),
                        ));
                        self.phase = Phase::Finished;
                        self.spawns.next_step().unwrap_or(Step::Done)
                    }
                    Decoded::Closed => self.drop_link("closed"),
                    Decoded::Invalid { error, .. } => self.drop_link(&error.to_string()),
                }
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
        "link"
    }
}

/// Accepts injectors on the connector socket.
struct ConnectorLoop {
    shared: Rc<Shared>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl ConnectorLoop {
    fn new(shared: Rc<Shared>) -> Self {
        Self {
            shared,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }
}

impl Task for ConnectorLoop {
    fn resume(&mut self, _value: Resume) -> Step {
        if let Some(step) = self.spawns.next_step() {
            return step;
        }
        let Some(connector) = self.shared.connector.as_ref() else {
            return Step::Done;
        };
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Waiting;
                Step::wait_readable(connector.fd())
            }
            Phase::Waiting => {
                match connector.accept() {
                    Ok(stream) => match stream.prepare() {
                        Ok(()) => {
                            let peer = Rc::new(Peer::new(stream));
                            debug!(fd = peer.fd(), "injector connected");
                            self.spawns.push(InjectorRead::new(Rc::clone(&self.shared), peer));
                        }
                        Err(e) => warn!(error = %e, "cannot prepare injector socket"),
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => warn!(error = %e, "connector accept failed"),
                }
                self.spawns.push(ConnectorLoop::new(Rc::clone(&self.shared)));
                self.phase = Phase::Finished;
                self.spawns.next_step().unwrap_or(Step::Done)
            }
            Phase::Deregistering | Phase::Finished => Step::Done,
        }
    }

    fn name(&self) -> &'static str {
        "connector"
    }
}

/// Reads the single frame an injector sends, relays it, hangs up.
struct InjectorRead {
    shared: Rc<Shared>,
    peer: Rc<Peer>,
    spawns: SpawnQueue,
    phase: Phase,
}

impl InjectorRead {
    fn new(shared: Rc<Shared>, peer: Rc<Peer>) -> Self {
        Self {
            shared,
            peer,
            spawns: SpawnQueue::new(),
            phase: Phase::Start,
        }
    }
}

impl Task for InjectorRead {
    fn resume(&mut self, value: Resume) -> Step {
        if let Some(step) = self.spawns.next_step() {
            return step;
        }
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Waiting;
                Step::wait_readable(self.peer.fd())
            }
            Phase::Waiting => {
                let Some(decoded) = self.peer.read_frame(&self.shared.codec) else {
                    trace!(fd = self.peer.fd(), buffered = self.peer.buffered(), "injector frame incomplete");
                    return Step::wait_readable(self.peer.fd());
                };
                match decoded {
                    Decoded::Frame(frame) => {
                        let reached = self.shared.relay(&frame, None, &mut self.spawns);
                        info!(reached, len = frame.payload.len(), "injected frame relayed");
                    }
                    Decoded::Closed => debug!(fd = self.peer.fd(), "injector sent nothing"),
                    Decoded::Invalid { error, .. } => {
                        warn!(fd = self.peer.fd(), error = %error, "invalid injected frame");
                    }
                }
                self.phase = Phase::Deregistering;
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
        "injector"
    }
}
