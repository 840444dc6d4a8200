// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! metal0 runtime core.
//!
//! M:N scheduling of lightweight tasks over a fixed set of worker threads:
//! per-worker LIFO slot plus bounded ring, a global overflow queue, work
//! stealing and time-slice preemption. Around it sit the pieces tasks need
//! to wait on things: channels with multi-way select, timers, and an
//! epoll/kqueue readiness poller. Per-task scratch memory comes from
//! recycled arenas handed out by thread-local allocators.
//!
//! Components:
//! - sched: tasks, processors, the runtime and its worker loop
//! - mem: arenas, fixed and growable object pools, per-thread allocators
//! - poller: fd readiness (epoll on Linux, kqueue on BSD/macOS)
//! - io: await readiness on raw non-blocking fds
//! - channel/select: message passing and multiplexing
//! - time: sleep and timeout
//! - waker: waker slots and queues shared by the above
//! - park: drive a future on the calling OS thread

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod io;
pub mod mem;
pub mod park;
pub mod poller;
pub mod sched;
pub mod select;
pub mod time;
pub mod waker;

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{bounded, unbounded, Receiver, Sender};
pub use config::RuntimeConfig;
pub use error::{AllocError, Elapsed, PollError, RuntimeError, SelectError, TaskError, TransitionError};
pub use mem::{ArenaPool, DynamicPool, Pool, PoolStats, TaskArena, ThreadLocalAllocator};
pub use park::block_on;
pub use poller::{Interest, Poller, Readiness};
pub use sched::{yield_now, yield_point, Handle, JoinHandle, Runtime, RuntimeStats, TaskId, TaskState};
pub use select::Select;
pub use time::{sleep, sleep_until, timeout};

/// Lock ignoring poison. Task panics are caught and reported as
/// `TaskError::Panicked`, so a poisoned lock only means some task died
/// mid-update of plain queue state.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn onto the runtime driving the calling thread.
pub fn spawn<F>(future: F) -> Result<JoinHandle, RuntimeError>
where
    F: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Ok(Handle::current()?.spawn(future))
}

/// Spawn a closure onto the runtime driving the calling thread.
pub fn spawn_fn<F>(f: F) -> Result<JoinHandle, RuntimeError>
where
    F: FnOnce() -> Result<(), TaskError> + Send + 'static,
{
    Ok(Handle::current()?.spawn_fn(f))
}

/// Run `f` against the current task's arena. `None` outside a task, and
/// `None` when called again from inside `f`.
pub fn with_arena<R>(f: impl FnOnce(&TaskArena) -> R) -> Option<R> {
    context::current_task()?.with_arena(f)
}

/// Run `f` against the current task's stack buffer. `None` outside a task,
/// when the task was spawned without one, or from inside another `f`.
pub fn with_stack<R>(f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
    context::current_task()?.with_stack(f)
}
