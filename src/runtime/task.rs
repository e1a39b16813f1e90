//! Tasks and the system calls they yield.
//!
//! A task is a resumable state machine. Each call to [`Task::resume`] runs one
//! step and reports how the task wants to continue:
//!
//! ```text
//!                 resume(value)
//!   ┌──────────┐ ─────────────▶ ┌───────────────────────────────┐
//!   │ Scheduler│                │ Task                          │
//!   └──────────┘ ◀───────────── └───────────────────────────────┘
//!                   Step::Continue            requeue at the back
//!                   Step::Call(SystemCall)    interpret, then park/requeue
//!                   Step::Done                drop
//! ```
//!
//! System calls are consumed by the scheduler; the task only ever sees the
//! [`Resume`] value delivered on its next step.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;

/// Scheduler-assigned task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Lifecycle of a task inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Added but never resumed.
    Pending,
    /// In the ready queue.
    Runnable,
    /// Parked in an interest map.
    Suspended,
    /// Returned [`Step::Done`].
    Finished,
}

/// Value handed to a task when it is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// First step.
    Start,
    /// The task asked to continue with [`Step::Continue`].
    Continue,
    /// The socket the task waited on became ready (or failed).
    Ready,
    /// The child task requested with [`SystemCall::Spawn`] was queued.
    Spawned(TaskId),
    /// The socket named in [`SystemCall::Deregister`] has no watchers left.
    Deregistered,
}

/// A suspension request interpreted by the scheduler.
pub enum SystemCall {
    /// Park until the socket is readable.
    WaitReadable(RawFd),
    /// Park until the socket is writable.
    WaitWritable(RawFd),
    /// Queue a child task and keep running.
    Spawn(Box<dyn Task>),
    /// Drop every watcher of the socket and remove it from the poller.
    Deregister(RawFd),
}

impl fmt::Debug for SystemCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitReadable(fd) => f.debug_tuple("WaitReadable").field(fd).finish(),
            Self::WaitWritable(fd) => f.debug_tuple("WaitWritable").field(fd).finish(),
            Self::Spawn(task) => f.debug_tuple("Spawn").field(&task.name()).finish(),
            Self::Deregister(fd) => f.debug_tuple("Deregister").field(fd).finish(),
        }
    }
}

/// Outcome of one task step.
#[derive(Debug)]
pub enum Step {
    /// Run again at the next opportunity.
    Continue,
    /// Suspend with a system call.
    Call(SystemCall),
    /// The task has no more steps.
    Done,
}

impl Step {
    /// Park until `fd` is readable.
    #[must_use]
    pub fn wait_readable(fd: RawFd) -> Self {
        Self::Call(SystemCall::WaitReadable(fd))
    }

    /// Park until `fd` is writable.
    #[must_use]
    pub fn wait_writable(fd: RawFd) -> Self {
        Self::Call(SystemCall::WaitWritable(fd))
    }

    /// Queue `task` as a child.
    #[must_use]
    pub fn spawn(task: impl Task + 'static) -> Self {
        Self::Call(SystemCall::Spawn(Box::new(task)))
    }

    /// Queue an already boxed child.
    #[must_use]
    pub fn spawn_boxed(task: Box<dyn Task>) -> Self {
        Self::Call(SystemCall::Spawn(task))
    }

    /// Drop all watchers of `fd`.
    #[must_use]
    pub fn deregister(fd: RawFd) -> Self {
        Self::Call(SystemCall::Deregister(fd))
    }
}

/// A cooperative unit of work.
pub trait Task {
    /// Run one step.
    fn resume(&mut self, value: Resume) -> Step;

    /// Short label for logs.
    fn name(&self) -> &'static str {
        "task"
    }
}

/// A task backed by a closure.
pub struct FnTask<F> {
    name: &'static str,
    step: F,
}

impl<F> FnTask<F>
where
    F: FnMut(Resume) -> Step,
{
    /// Wraps `step` as a task labelled `name`.
    #[must_use]
    pub fn new(name: &'static str, step: F) -> Self {
        Self { name, step }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnMut(Resume) -> Step,
{
    fn resume(&mut self, value: Resume) -> Step {
        (self.step)(value)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

/// Children collected during one step, handed to the scheduler one
/// [`SystemCall::Spawn`] per step.
///
/// A task that produces several children in one go (a broadcast yields one
/// flush task per peer) pushes them here and drains the queue at the top of
/// its `resume` before doing anything else:
///
/// ```
/// use wsrelay::runtime::{FnTask, Resume, SpawnQueue, Step, Task};
///
/// struct Fanout {
///     spawns: SpawnQueue,
///     started: bool,
/// }
///
/// impl Task for Fanout {
///     fn resume(&mut self, _value: Resume) -> Step {
///         if let Some(step) = self.spawns.next_step() {
///             return step;
///         }
///         if self.started {
///             return Step::Done;
///         }
///         self.started = true;
///         for _ in 0..3 {
///             self.spawns.push(FnTask::new("child", |_| Step::Done));
///         }
///         Step::Continue
///     }
/// }
/// # let _ = Fanout { spawns: SpawnQueue::new(), started: false };
/// ```
#[derive(Default)]
pub struct SpawnQueue {
    tasks: VecDeque<Box<dyn Task>>,
}

impl SpawnQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a child.
    pub fn push(&mut self, task: impl Task + 'static) {
        self.tasks.push_back(Box::new(task));
    }

    /// Queues an already boxed child.
    pub fn push_boxed(&mut self, task: Box<dyn Task>) {
        self.tasks.push_back(task);
    }

    /// Pops the oldest child as a spawn step.
    pub fn next_step(&mut self) -> Option<Step> {
        self.tasks.pop_front().map(Step::spawn_boxed)
    }

    /// Number of queued children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Extend<Box<dyn Task>> for SpawnQueue {
    fn extend<I: IntoIterator<Item = Box<dyn Task>>>(&mut self, iter: I) {
        self.tasks.extend(iter);
    }
}

impl fmt::Debug for SpawnQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|task| task.name()))
            .finish()
    }
}
