//! Single-threaded cooperative scheduler driven by socket readiness.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Scheduler                             │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌─────────────────┐  │
//! │  │ ready queue │   │ readers: fd→jobs │   │ Poller (oneshot)│  │
//! │  │   (FIFO)    │   │ writers: fd→jobs │   │  armed: fd→int. │  │
//! │  └──────┬──────┘   └────────▲─────────┘   └────────┬────────┘  │
//! │         │ resume            │ WaitReadable/         │ events    │
//! │         ▼                   │ WaitWritable          ▼           │
//! │      Task::resume ──────────┘            wake all waiters of fd │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # One turn
//!
//! 1. Re-arm sockets whose wanted interest changed since the last poll.
//! 2. Poll: block (up to the idle timeout) when nothing is ready, otherwise
//!    poll with a zero timeout.
//! 3. For each readable socket move *all* its read waiters to the back of the
//!    ready queue and forget the registration; same for writable sockets.
//! 4. Resume the task at the front of the queue and interpret its [`Step`].
//!
//! Readiness is consumed once: a resumed task must issue another wait to be
//! woken again. Registrations with the poller are oneshot, which matches this
//! exactly; a socket is re-armed only when some task waits on it again.
//!
//! A socket the poller refuses to watch (typically a descriptor that was
//! already closed) wakes its waiters immediately so their next I/O fails and
//! they take their close path.

use super::interest::Interest;
use super::task::{Resume, Step, SystemCall, Task, TaskId, TaskState};
use polling::Poller;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Number of poller waits.
    pub polls: u64,
    /// Readiness events received.
    pub events: u64,
    /// Task steps executed.
    pub steps: u64,
    /// Tasks added (top-level and spawned).
    pub spawned: u64,
    /// Tasks that returned [`Step::Done`].
    pub finished: u64,
    /// Tasks dropped by a deregistration.
    pub dropped: u64,
    /// Poller add/modify calls.
    pub rearms: u64,
}

/// Result of one [`Scheduler::turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Turn {
    /// Readiness events observed by this turn's poll.
    pub events: usize,
    /// Task resumed this turn, if the queue was not empty.
    pub ran: Option<TaskId>,
}

struct Job {
    id: TaskId,
    task: Box<dyn Task>,
    state: TaskState,
    resume: Resume,
}

/// The cooperative scheduler.
pub struct Scheduler {
    poller: Poller,
    ready: VecDeque<Job>,
    readers: HashMap<RawFd, Vec<Job>>,
    writers: HashMap<RawFd, Vec<Job>>,
    armed: HashMap<RawFd, Interest>,
    dirty: HashSet<RawFd>,
    events: Vec<polling::Event>,
    next_id: u64,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Creates a scheduler with its own poller.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            ready: VecDeque::new(),
            readers: HashMap::new(),
            writers: HashMap::new(),
            armed: HashMap::new(),
            dirty: HashSet::new(),
            events: Vec::new(),
            next_id: 0,
            stats: SchedulerStats::default(),
        })
    }

    /// Adds a task to the back of the ready queue.
    pub fn spawn(&mut self, task: impl Task + 'static) -> TaskId {
        self.spawn_boxed(Box::new(task))
    }

    /// Adds an already boxed task to the back of the ready queue.
    pub fn spawn_boxed(&mut self, task: Box<dyn Task>) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.stats.spawned += 1;
        trace!(task_id = %id, task = task.name(), "task added");
        self.ready.push_back(Job {
            id,
            task,
            state: TaskState::Pending,
            resume: Resume::Start,
        });
        id
    }

    /// Runs forever.
    ///
    /// # Errors
    ///
    /// Returns only if the poller fails.
    pub fn run(&mut self) -> io::Result<Infallible> {
        loop {
            self.turn(None)?;
        }
    }

    /// Runs one loop iteration.
    ///
    /// With an empty ready queue the poll blocks for `idle_timeout` (`None`
    /// blocks until some socket is ready); otherwise it does not block.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller fails. An interrupted wait counts as
    /// zero events.
    pub fn turn(&mut self, idle_timeout: Option<Duration>) -> io::Result<Turn> {
        let timeout = if self.ready.is_empty() {
            idle_timeout
        } else {
            Some(Duration::ZERO)
        };
        let events = self.poll(timeout)?;
        let ran = self.step();
        Ok(Turn { events, ran })
    }

    /// Number of tasks in the ready queue.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of tasks waiting for `fd` to become readable.
    #[must_use]
    pub fn read_waiters(&self, fd: RawFd) -> usize {
        self.readers.get(&fd).map_or(0, Vec::len)
    }

    /// Number of tasks waiting for `fd` to become writable.
    #[must_use]
    pub fn write_waiters(&self, fd: RawFd) -> usize {
        self.writers.get(&fd).map_or(0, Vec::len)
    }

    /// Total tasks alive (ready or parked).
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.ready.len()
            + self.readers.values().map(Vec::len).sum::<usize>()
            + self.writers.values().map(Vec::len).sum::<usize>()
    }

    /// Returns true if no task is alive.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.task_count() == 0
    }

    /// Returns current statistics.
    #[must_use]
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Drops every task watching `fd` and removes it from the poller.
    ///
    /// Returns the number of tasks dropped. Must run before the socket is
    /// closed.
    pub fn deregister(&mut self, fd: RawFd) -> usize {
        let dropped = self.readers.remove(&fd).map_or(0, |jobs| jobs.len())
            + self.writers.remove(&fd).map_or(0, |jobs| jobs.len());
        self.dirty.remove(&fd);
        if self.armed.remove(&fd).is_some() {
            if let Err(e) = self.poller.delete(fd) {
                trace!(fd, error = %e, "poller delete failed");
            }
        }
        self.stats.dropped += dropped as u64;
        debug!(fd, dropped, "socket deregistered");
        dropped
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.arm_dirty();

        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let waited = self.poller.wait(&mut events, timeout);
        self.stats.polls += 1;
        match waited {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events = events;
                return Ok(0);
            }
            Err(e) => {
                self.events = events;
                return Err(e);
            }
        }

        let count = events.len();
        self.stats.events += count as u64;
        for event in &events {
            let Ok(fd) = RawFd::try_from(event.key) else {
                continue;
            };
            // The oneshot registration is spent whichever direction fired.
            self.armed.insert(fd, Interest::NONE);
            self.dirty.insert(fd);

            let mut ready = Interest::NONE;
            if event.readable {
                ready = ready | Interest::READABLE;
            }
            if event.writable {
                ready = ready | Interest::WRITABLE;
            }
            trace!(fd, readable = event.readable, writable = event.writable, "socket ready");
            self.wake(fd, ready);
        }
        self.events = events;
        Ok(count)
    }

    fn arm_dirty(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let dirty: Vec<RawFd> = self.dirty.drain().collect();
        for fd in dirty {
            let wanted = self.wanted(fd);
            let current = self.armed.get(&fd).copied();
            if current == Some(wanted) || (wanted.is_empty() && current.is_none()) {
                continue;
            }
            let Ok(key) = usize::try_from(fd) else {
                self.wake(fd, Interest::BOTH);
                continue;
            };
            let event = wanted.to_poll_event(key);
            self.stats.rearms += 1;
            let result = if current.is_some() {
                self.poller.modify(fd, event).or_else(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        self.poller.add(fd, event)
                    } else {
                        Err(e)
                    }
                })
            } else {
                self.poller.add(fd, event).or_else(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        self.poller.modify(fd, event)
                    } else {
                        Err(e)
                    }
                })
            };
            match result {
                Ok(()) => {
                    self.armed.insert(fd, wanted);
                }
                Err(e) => {
                    warn!(fd, error = %e, "cannot watch socket, waking its waiters");
                    self.armed.remove(&fd);
                    self.wake(fd, Interest::BOTH);
                }
            }
        }
    }

    fn wanted(&self, fd: RawFd) -> Interest {
        let mut interest = Interest::NONE;
        if self.read_waiters(fd) > 0 {
            interest = interest | Interest::READABLE;
        }
        if self.write_waiters(fd) > 0 {
            interest = interest | Interest::WRITABLE;
        }
        interest
    }

    fn wake(&mut self, fd: RawFd, ready: Interest) {
        if ready.is_readable() {
            if let Some(jobs) = self.readers.remove(&fd) {
                self.enqueue_woken(jobs);
            }
        }
        if ready.is_writable() {
            if let Some(jobs) = self.writers.remove(&fd) {
                self.enqueue_woken(jobs);
            }
        }
    }

    fn enqueue_woken(&mut self, jobs: Vec<Job>) {
        for mut job in jobs {
            job.state = TaskState::Runnable;
            job.resume = Resume::Ready;
            self.ready.push_back(job);
        }
    }

    fn step(&mut self) -> Option<TaskId> {
        let mut job = self.ready.pop_front()?;
        let id = job.id;
        let value = std::mem::replace(&mut job.resume, Resume::Continue);
        trace!(task_id = %id, task = job.task.name(), state = ?job.state, resume = ?value, "executing task");
        job.state = TaskState::Runnable;
        self.stats.steps += 1;

        match job.task.resume(value) {
            Step::Continue => self.ready.push_back(job),
            Step::Done => {
                job.state = TaskState::Finished;
                self.stats.finished += 1;
                trace!(task_id = %id, task = job.task.name(), "task finished");
            }
            Step::Call(call) => self.interpret(job, call),
        }
        Some(id)
    }

    fn interpret(&mut self, mut job: Job, call: SystemCall) {
        trace!(task_id = %job.id, call = ?call, "system call");
        match call {
            SystemCall::WaitReadable(fd) => {
                job.state = TaskState::Suspended;
                self.readers.entry(fd).or_default().push(job);
                self.dirty.insert(fd);
            }
            SystemCall::WaitWritable(fd) => {
                job.state = TaskState::Suspended;
                self.writers.entry(fd).or_default().push(job);
                self.dirty.insert(fd);
            }
            SystemCall::Spawn(child) => {
                let child_id = self.spawn_boxed(child);
                job.resume = Resume::Spawned(child_id);
                self.ready.push_back(job);
            }
            SystemCall::Deregister(fd) => {
                self.deregister(fd);
                job.resume = Resume::Deregistered;
                self.ready.push_back(job);
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("ready", &self.ready.len())
            .field("read_sockets", &self.readers.len())
            .field("write_sockets", &self.writers.len())
            .field("armed", &self.armed.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::FnTask;
    use crate::test_utils::init_test_logging;
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Instant;

    const TICK: Option<Duration> = Some(Duration::from_millis(10));

    fn drive(sched: &mut Scheduler, turns: usize) {
        for _ in 0..turns {
            sched.turn(TICK).expect("turn");
        }
    }

    /// Waits for readability once per wakeup, counting wakeups; re-arms only
    /// when `rearm` is set.
    fn reader(fd: RawFd, woken: Rc<Cell<u32>>, rearm: bool) -> FnTask<impl FnMut(Resume) -> Step> {
        FnTask::new("reader", move |value| match value {
            Resume::Start => Step::wait_readable(fd),
            Resume::Ready => {
                woken.set(woken.get() + 1);
                if rearm {
                    Step::wait_readable(fd)
                } else {
                    Step::Done
                }
            }
            _ => Step::Done,
        })
    }

    #[test]
    fn test_wait_readable_resumes_only_after_readiness() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let woken = Rc::new(Cell::new(0));
        let mut sched = Scheduler::new().unwrap();
        sched.spawn(reader(fd, woken.clone(), false));

        drive(&mut sched, 5);
        assert_eq!(woken.get(), 0);
        assert_eq!(sched.read_waiters(fd), 1);

        b.write_all(b"x").unwrap();
        drive(&mut sched, 3);
        assert_eq!(woken.get(), 1);
        assert_eq!(sched.read_waiters(fd), 0);
        assert!(sched.is_idle());
    }

    #[test]
    fn test_readiness_is_consumed_once() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let parked = Rc::new(Cell::new(0u32));
        let parked_in_task = parked.clone();
        let mut sched = Scheduler::new().unwrap();

        sched.spawn(FnTask::new("once", move |value| match value {
            Resume::Start => Step::wait_readable(fd),
            Resume::Ready => {
                parked_in_task.set(parked_in_task.get() + 1);
                Step::Done
            }
            _ => Step::Done,
        }));
        b.write_all(b"data").unwrap();
        drive(&mut sched, 3);
        assert_eq!(parked.get(), 1);

        // Data is still unread, so the socket stays readable; nothing waits on it.
        b.write_all(b"more").unwrap();
        drive(&mut sched, 3);
        assert_eq!(parked.get(), 1);
        assert_eq!(sched.read_waiters(fd), 0);
    }

    #[test]
    fn test_rearming_reader_sees_every_wakeup() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let woken = Rc::new(Cell::new(0));
        let mut sched = Scheduler::new().unwrap();
        sched.spawn(reader(fd, woken.clone(), true));

        b.write_all(b"1").unwrap();
        drive(&mut sched, 2);
        assert!(woken.get() >= 1);
        assert_eq!(sched.read_waiters(fd), 1);
    }

    #[test]
    fn test_all_waiters_on_socket_wake_together() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let woken = Rc::new(Cell::new(0));
        let mut sched = Scheduler::new().unwrap();
        for _ in 0..3 {
            sched.spawn(reader(fd, woken.clone(), false));
        }
        drive(&mut sched, 3);
        assert_eq!(sched.read_waiters(fd), 3);

        b.write_all(b"!").unwrap();
        drive(&mut sched, 4);
        assert_eq!(woken.get(), 3);
    }

    #[test]
    fn test_read_and_write_interest_on_same_socket() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::new().unwrap();

        let read_log = log.clone();
        sched.spawn(FnTask::new("r", move |value| match value {
            Resume::Start => Step::wait_readable(fd),
            _ => {
                read_log.borrow_mut().push("read");
                Step::Done
            }
        }));
        let write_log = log.clone();
        sched.spawn(FnTask::new("w", move |value| match value {
            Resume::Start => Step::wait_writable(fd),
            _ => {
                write_log.borrow_mut().push("write");
                Step::Done
            }
        }));

        drive(&mut sched, 6);
        assert_eq!(*log.borrow(), ["write"]);
        assert_eq!(sched.read_waiters(fd), 1);

        b.write_all(b"r").unwrap();
        drive(&mut sched, 3);
        assert_eq!(*log.borrow(), ["write", "read"]);
    }

    #[test]
    fn test_spawn_enqueues_child_before_parent() {
        init_test_logging();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::new().unwrap();

        let parent_order = order.clone();
        let child_order = order.clone();
        let mut child = Some(FnTask::new("child", move |_| {
            child_order.borrow_mut().push("child".to_string());
            Step::Done
        }));
        sched.spawn(FnTask::new("parent", move |value| match value {
            Resume::Start => {
                parent_order.borrow_mut().push("parent:start".to_string());
                child.take().map_or(Step::Done, Step::spawn)
            }
            Resume::Spawned(id) => {
                parent_order.borrow_mut().push(format!("parent:spawned:{id}"));
                Step::Done
            }
            _ => Step::Done,
        }));

        drive(&mut sched, 3);
        assert_eq!(
            *order.borrow(),
            ["parent:start", "child", "parent:spawned:T1"]
        );
        assert!(sched.is_idle());
        assert_eq!(sched.stats().finished, 2);
    }

    #[test]
    fn test_continue_is_round_robin() {
        init_test_logging();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::new().unwrap();
        for name in ["a", "b"] {
            let order = order.clone();
            let mut left = 2;
            sched.spawn(FnTask::new(name, move |_| {
                order.borrow_mut().push(name);
                left -= 1;
                if left == 0 {
                    Step::Done
                } else {
                    Step::Continue
                }
            }));
        }
        drive(&mut sched, 4);
        assert_eq!(*order.borrow(), ["a", "b", "a", "b"]);
    }

    #[test]
    fn test_idle_poll_blocks() {
        init_test_logging();
        let mut sched = Scheduler::new().unwrap();
        let start = Instant::now();
        let turn = sched.turn(Some(Duration::from_millis(60))).unwrap();
        assert_eq!(turn, Turn { events: 0, ran: None });
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_busy_poll_does_not_block_and_readiness_still_progresses() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let woken = Rc::new(Cell::new(0));
        let mut sched = Scheduler::new().unwrap();

        // Two tasks that never stop yielding.
        for name in ["spin1", "spin2"] {
            sched.spawn(FnTask::new(name, |_| Step::Continue));
        }
        sched.spawn(reader(fd, woken.clone(), false));
        b.write_all(b"go").unwrap();

        let start = Instant::now();
        for _ in 0..20 {
            sched.turn(Some(Duration::from_secs(5))).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(woken.get(), 1);
    }

    #[test]
    fn test_deregister_drops_waiters() {
        init_test_logging();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let woken = Rc::new(Cell::new(0));
        let mut sched = Scheduler::new().unwrap();
        sched.spawn(reader(fd, woken.clone(), false));
        let deregistered = Rc::new(Cell::new(false));
        let flag = deregistered.clone();
        let mut waited = false;
        sched.spawn(FnTask::new("closer", move |value| match value {
            Resume::Start | Resume::Continue if !waited => {
                waited = true;
                Step::Continue
            }
            Resume::Continue => Step::deregister(fd),
            Resume::Deregistered => {
                flag.set(true);
                Step::Done
            }
            _ => Step::Done,
        }));

        drive(&mut sched, 5);
        assert!(deregistered.get());
        assert_eq!(sched.read_waiters(fd), 0);
        assert_eq!(sched.stats().dropped, 1);

        drop(a);
        b.write_all(b"late").ok();
        drive(&mut sched, 2);
        assert_eq!(woken.get(), 0);
        assert!(sched.is_idle());
    }

    #[test]
    fn test_unwatchable_descriptor_wakes_waiter() {
        init_test_logging();
        // Far above any descriptor the test process holds.
        let fd: RawFd = 1 << 20;
        let woken = Rc::new(Cell::new(0));
        let mut sched = Scheduler::new().unwrap();
        sched.spawn(reader(fd, woken.clone(), false));
        drive(&mut sched, 3);
        assert_eq!(woken.get(), 1);
    }
}
