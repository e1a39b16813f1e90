//! Cooperative task runtime.
//!
//! One [`Scheduler`] per process drives every connection state machine. Tasks
//! implement [`Task`] and suspend by returning a [`SystemCall`]; nothing in
//! this module knows about WebSocket semantics.
//!
//! | Call | Effect |
//! |------|--------|
//! | `WaitReadable(fd)` | park until `fd` is readable |
//! | `WaitWritable(fd)` | park until `fd` is writable |
//! | `Spawn(task)` | queue `task`, resume the caller with its id |
//! | `Deregister(fd)` | drop all watchers of `fd` before it is closed |

mod interest;
mod scheduler;
mod task;

pub use interest::Interest;
pub use scheduler::{Scheduler, SchedulerStats, Turn};
pub use task::{FnTask, Resume, SpawnQueue, Step, SystemCall, Task, TaskId, TaskState};
