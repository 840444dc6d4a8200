// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation and state machine.
//!
//! A task is a boxed future plus scheduling state. The five legal
//! transitions are the only way the state changes:
//!
//! ```text
//!   Idle -> Runnable -> Running -> Dead
//!              ^          |
//!              |          v
//!              +------ Waiting
//! ```
//!
//! A cooperative yield is `Running -> Waiting -> Runnable` with an
//! immediate re-queue.

use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use crate::error::{TaskError, TransitionError};
use crate::lock;
use crate::mem::TaskArena;
use crate::poller::Interest;
use crate::waker::WakerList;

/// Size of the optional dedicated task stack.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Type-erased task body.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// Monotonically increasing task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Constructed, never scheduled.
    Idle = 0,
    /// Sitting in exactly one run queue.
    Runnable = 1,
    /// Being polled by a processor.
    Running = 2,
    /// Parked on I/O, a channel, a timer, or mid-yield.
    Waiting = 3,
    /// Finished. Terminal.
    Dead = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Waiting,
            _ => Self::Dead,
        }
    }

    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Idle, Runnable)
                | (Runnable, Running)
                | (Running, Waiting)
                | (Waiting, Runnable)
                | (Running, Dead)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TaskState::Dead
    }
}

/// Why the running task asked to be re-queued.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum YieldKind {
    None = 0,
    /// `yield_now`: back of the local ring.
    Cooperative = 1,
    /// Time slice exhausted: back of the global queue.
    Preempted = 2,
}

impl YieldKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Cooperative,
            2 => Self::Preempted,
            _ => Self::None,
        }
    }
}

/// Fixed-size scratch stack, pooled by the runtime.
pub struct Stack {
    bytes: Box<[u8]>,
}

impl Stack {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// The fd and interest a task is parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoWait {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Re-enqueue path used by wakers. Implemented by the runtime.
pub(crate) trait Schedule: Send + Sync {
    fn schedule(&self, task: Arc<Task>);
}

/// A schedulable unit of work.
pub struct Task {
    id: TaskId,
    name: Option<String>,
    state: AtomicU8,
    /// A wake arrived that has not been acted on yet.
    notified: AtomicBool,
    yield_kind: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    scheduled_at: Mutex<Option<Instant>>,
    io: Mutex<Option<IoWait>>,
    arena: Mutex<Option<Box<TaskArena>>>,
    wants_stack: bool,
    stack: Mutex<Option<Box<Stack>>>,
    result: Mutex<Option<Result<(), TaskError>>>,
    join_waiters: WakerList,
    scheduler: Weak<dyn Schedule>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: Option<String>,
        future: BoxFuture,
        wants_stack: bool,
        scheduler: Weak<dyn Schedule>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            state: AtomicU8::new(TaskState::Idle as u8),
            notified: AtomicBool::new(false),
            yield_kind: AtomicU8::new(YieldKind::None as u8),
            future: Mutex::new(Some(future)),
            scheduled_at: Mutex::new(None),
            io: Mutex::new(None),
            arena: Mutex::new(None),
            wants_stack,
            stack: Mutex::new(None),
            result: Mutex::new(None),
            join_waiters: WakerList::new(),
            scheduler,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_dead(&self) -> bool {
        self.state().is_terminal()
    }

    /// When the current (or last) dispatch began.
    pub fn scheduled_at(&self) -> Option<Instant> {
        *lock(&self.scheduled_at)
    }

    /// Time spent in the current dispatch.
    pub fn slice_elapsed(&self) -> Duration {
        self.scheduled_at()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// The fd this task is parked on, if any.
    pub fn io_wait(&self) -> Option<IoWait> {
        *lock(&self.io)
    }

    // ---- state machine ----------------------------------------------

    fn transition(&self, from: TaskState, to: TaskState) -> Result<(), TransitionError> {
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| TransitionError {
                from: TaskState::from_u8(actual),
                to,
            })
    }

    /// Idle or Waiting -> Runnable.
    pub(crate) fn make_runnable(&self) -> Result<(), TransitionError> {
        match self.state() {
            s @ (TaskState::Idle | TaskState::Waiting) => self.transition(s, TaskState::Runnable),
            s => Err(TransitionError {
                from: s,
                to: TaskState::Runnable,
            }),
        }
    }

    /// Runnable -> Running.
    pub(crate) fn make_running(&self) -> Result<(), TransitionError> {
        self.transition(TaskState::Runnable, TaskState::Running)
    }

    /// Running -> Waiting.
    pub(crate) fn make_waiting(&self) -> Result<(), TransitionError> {
        self.transition(TaskState::Running, TaskState::Waiting)
    }

    /// Running -> Dead.
    pub(crate) fn make_dead(&self) -> Result<(), TransitionError> {
        self.transition(TaskState::Running, TaskState::Dead)
    }

    // ---- polling ----------------------------------------------------

    /// Start a dispatch: clear stale notifications and stamp the slice.
    pub(crate) fn begin_dispatch(&self) {
        self.notified.store(false, Ordering::SeqCst);
        *lock(&self.scheduled_at) = Some(Instant::now());
    }

    /// Poll the body once. Panics are caught and reported as failures.
    pub(crate) fn poll(self: &Arc<Self>) -> Poll<Result<(), TaskError>> {
        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let mut slot = lock(&self.future);
        let Some(fut) = slot.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(result)) => {
                *slot = None;
                Poll::Ready(result)
            }
            Err(payload) => {
                *slot = None;
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Poll::Ready(Err(TaskError::Panicked(msg)))
            }
        }
    }

    /// Called by the processor after the body returned Pending.
    ///
    /// Parks the task. Returns true if a wake raced with the poll and
    /// the caller now owns a Runnable task that must be re-queued.
    pub(crate) fn park_after_poll(&self) -> bool {
        if self.make_waiting().is_err() {
            return false;
        }
        // Pairs with the store/load in `wake`: one side always sees the other.
        self.notified.swap(false, Ordering::SeqCst)
            && self
                .transition(TaskState::Waiting, TaskState::Runnable)
                .is_ok()
    }

    /// Record a wake; if the task is parked, make it runnable and hand it
    /// to the scheduler. Exactly one enqueue happens per wake-up.
    pub(crate) fn wake(self: &Arc<Self>) {
        self.notified.store(true, Ordering::SeqCst);
        if self.state() == TaskState::Waiting
            && self
                .transition(TaskState::Waiting, TaskState::Runnable)
                .is_ok()
        {
            self.schedule();
        }
    }

    fn schedule(self: &Arc<Self>) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.schedule(self.clone());
        }
    }

    pub(crate) fn request_yield(&self, kind: YieldKind) {
        self.yield_kind.store(kind as u8, Ordering::Release);
    }

    pub(crate) fn take_yield_kind(&self) -> YieldKind {
        YieldKind::from_u8(self.yield_kind.swap(YieldKind::None as u8, Ordering::AcqRel))
    }

    // ---- completion -------------------------------------------------

    /// Store the body's result and wake joiners. The caller has already
    /// moved the task to Dead.
    pub(crate) fn complete(&self, result: Result<(), TaskError>) {
        *lock(&self.result) = Some(result);
        *lock(&self.io) = None;
        self.join_waiters.wake_all();
    }

    pub(crate) fn take_result(&self) -> Option<Result<(), TaskError>> {
        lock(&self.result).take()
    }

    pub(crate) fn register_join_waker(&self, waker: &Waker) {
        self.join_waiters.register(waker);
    }

    // ---- owned resources --------------------------------------------

    pub(crate) fn set_io_wait(&self, wait: Option<IoWait>) {
        *lock(&self.io) = wait;
    }

    pub(crate) fn has_arena(&self) -> bool {
        lock(&self.arena).is_some()
    }

    pub(crate) fn attach_arena(&self, arena: Box<TaskArena>) {
        *lock(&self.arena) = Some(arena);
    }

    pub(crate) fn take_arena(&self) -> Option<Box<TaskArena>> {
        lock(&self.arena).take()
    }

    /// Lend the arena to `f`. The slot is empty while `f` runs, so a
    /// nested call sees `None` instead of blocking.
    pub(crate) fn with_arena<R>(&self, f: impl FnOnce(&TaskArena) -> R) -> Option<R> {
        let lent = Lent::take(&self.arena)?;
        let out = lent.item.as_deref().map(f);
        out
    }

    pub(crate) fn wants_stack(&self) -> bool {
        self.wants_stack
    }

    pub(crate) fn has_stack(&self) -> bool {
        lock(&self.stack).is_some()
    }

    pub(crate) fn attach_stack(&self, stack: Box<Stack>) {
        *lock(&self.stack) = Some(stack);
    }

    pub(crate) fn take_stack(&self) -> Option<Box<Stack>> {
        lock(&self.stack).take()
    }

    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut lent = Lent::take(&self.stack)?;
        let out = lent.item.as_deref_mut().map(|s| f(s.as_mut_slice()));
        out
    }
}

/// A resource taken out of its slot, put back on drop (also on unwind).
struct Lent<'a, T> {
    slot: &'a Mutex<Option<Box<T>>>,
    item: Option<Box<T>>,
}

impl<'a, T> Lent<'a, T> {
    fn take(slot: &'a Mutex<Option<Box<T>>>) -> Option<Self> {
        let item = lock(slot).take()?;
        Some(Self {
            slot,
            item: Some(item),
        })
    }
}

impl<T> Drop for Lent<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            *lock(self.slot) = Some(item);
        }
    }
}

/// Waker that marks its task runnable and re-enqueues it.
pub(crate) struct TaskWaker {
    task: Arc<Task>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.task.wake();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.wake();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scheduler stub that counts enqueues.
    #[derive(Default)]
    pub(crate) struct CountingScheduler {
        pub scheduled: AtomicUsize,
    }

    impl Schedule for CountingScheduler {
        fn schedule(&self, _task: Arc<Task>) {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn detached_task(id: u64) -> Arc<Task> {
        let none: Weak<dyn Schedule> = Weak::<CountingScheduler>::new();
        Task::new(
            TaskId(id),
            None,
            Box::pin(async { Ok(()) }),
            false,
            none,
        )
    }

    fn attached_task(sched: &Arc<CountingScheduler>, fut: BoxFuture) -> Arc<Task> {
        let weak: Weak<dyn Schedule> = Arc::downgrade(sched) as Weak<dyn Schedule>;
        Task::new(TaskId(1), Some("t".into()), fut, false, weak)
    }

    #[test]
    fn legal_edges_only() {
        use TaskState::*;
        let all = [Idle, Runnable, Running, Waiting, Dead];
        let legal: Vec<_> = all
            .iter()
            .flat_map(|&a| all.iter().map(move |&b| (a, b)))
            .filter(|&(a, b)| a.can_transition_to(b))
            .collect();
        assert_eq!(legal.len(), 5);
        for to in all {
            assert!(!Dead.can_transition_to(to));
        }
    }

    #[test]
    fn lifecycle_runs_through_states() {
        let t = detached_task(1);
        assert_eq!(t.state(), TaskState::Idle);
        t.make_runnable().unwrap();
        t.make_running().unwrap();
        t.make_waiting().unwrap();
        t.make_runnable().unwrap();
        t.make_running().unwrap();
        t.make_dead().unwrap();
        assert!(t.is_dead());
    }

    #[test]
    fn dead_is_terminal() {
        let t = detached_task(1);
        t.make_runnable().unwrap();
        t.make_running().unwrap();
        t.make_dead().unwrap();
        let err = t.make_runnable().unwrap_err();
        assert_eq!(err.from, TaskState::Dead);
        assert!(t.make_running().is_err());
        assert!(t.is_dead());
    }

    #[test]
    fn illegal_request_leaves_state_alone() {
        let t = detached_task(1);
        assert!(t.make_running().is_err());
        assert!(t.make_dead().is_err());
        assert_eq!(t.state(), TaskState::Idle);
    }

    #[test]
    fn wake_while_waiting_enqueues_once() {
        let sched = Arc::new(CountingScheduler::default());
        let t = attached_task(&sched, Box::pin(async { Ok(()) }));
        t.make_runnable().unwrap();
        t.make_running().unwrap();
        assert!(!t.park_after_poll());
        assert_eq!(t.state(), TaskState::Waiting);

        t.wake();
        t.wake();
        assert_eq!(t.state(), TaskState::Runnable);
        assert_eq!(sched.scheduled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wake_during_poll_is_not_lost() {
        let sched = Arc::new(CountingScheduler::default());
        let t = attached_task(&sched, Box::pin(async { Ok(()) }));
        t.make_runnable().unwrap();
        t.make_running().unwrap();
        t.begin_dispatch();

        // Fires while Running: remembered, not enqueued.
        t.wake();
        assert_eq!(sched.scheduled.load(Ordering::SeqCst), 0);

        // The processor owns the re-queue.
        assert!(t.park_after_poll());
        assert_eq!(t.state(), TaskState::Runnable);
        assert_eq!(sched.scheduled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn poll_catches_panics() {
        let t = detached_task(1);
        *lock(&t.future) = Some(Box::pin(async { panic!("boom") }));
        match t.poll() {
            Poll::Ready(Err(TaskError::Panicked(msg))) => assert!(msg.contains("boom")),
            other => panic!("expected panic failure, got {:?}", other),
        }
    }

    #[test]
    fn yield_kind_is_taken_once() {
        let t = detached_task(1);
        t.request_yield(YieldKind::Preempted);
        assert_eq!(t.take_yield_kind(), YieldKind::Preempted);
        assert_eq!(t.take_yield_kind(), YieldKind::None);
    }
}
