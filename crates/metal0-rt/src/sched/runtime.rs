// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! M:N work-stealing runtime.
//!
//! `run()` drives processor 0 on the calling thread and one scoped OS
//! thread per remaining processor. Each worker repeatedly:
//!
//! 1. every `GLOBAL_CHECK_INTERVAL` ticks, takes one task from the global
//!    queue and fires due timers / drains ready I/O without blocking;
//! 2. pops its own queue (next slot, then ring);
//! 3. pulls a batch from the global queue into its ring;
//! 4. steals half of a random victim's ring (when enabled);
//! 5. otherwise idles: one worker blocks in the poller (bounded by the
//!    next timer deadline), the rest sleep on a condvar for at most 1ms.
//!
//! The loop ends when the live task count reaches zero, not when the
//! queues are momentarily empty.

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::task::{Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{PollError, RuntimeError, TaskError};
use crate::lock;
use crate::mem::{AllocatorRegistry, DynamicPool, PoolStats, ThreadLocalAllocator};
use crate::poller::{Interest, Poller, PollerStats, Readiness};
use crate::time::TimerQueue;

use super::handle::{JoinHandle, ResultSlot};
use super::processor::{GlobalQueue, Processor, LOCAL_QUEUE_CAPACITY};
use super::task::{BoxFuture, Schedule, Stack, Task, TaskId, YieldKind, DEFAULT_STACK_SIZE};

/// Ticks between forced looks at the global queue and the poller.
const GLOBAL_CHECK_INTERVAL: u32 = 61;

/// Upper bound on an idle worker's sleep.
const IDLE_TIMEOUT: Duration = Duration::from_millis(1);

/// Idle stacks kept by the stack pool.
const STACK_POOL_CAPACITY: usize = 64;

/// Counter snapshot. `total_completed` counts every task that reached
/// Dead; `total_failed` is the subset whose body returned an error or
/// panicked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub total_spawned: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_polls: u64,
    pub total_yields: u64,
    pub total_preemptions: u64,
    pub total_steals: u64,
    pub total_stolen: u64,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    polls: AtomicU64,
    yields: AtomicU64,
    preemptions: AtomicU64,
    steals: AtomicU64,
    stolen: AtomicU64,
}

/// State shared by the runtime, its workers, handles and wakers.
pub(crate) struct Shared {
    config: RuntimeConfig,
    processors: Vec<Processor>,
    global: GlobalQueue,
    poller: Poller<()>,
    /// Tasks waiting on each registered fd.
    io: Mutex<IoTable>,
    timers: Arc<TimerQueue>,
    allocators: AllocatorRegistry,
    stacks: DynamicPool<Stack>,
    running: AtomicBool,
    shutdown: AtomicBool,
    /// A worker is blocked in `poller.wait`.
    polling: AtomicBool,
    task_count: AtomicUsize,
    next_id: AtomicU64,
    next_processor: AtomicUsize,
    work_available: (Mutex<bool>, Condvar),
    counters: Counters,
}

/// Identifies one waiter in the fd table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IoKey(u64);

struct IoWaiter {
    key: IoKey,
    interest: Interest,
    waker: Waker,
    /// Waiting for an event; cleared once woken until it watches again.
    armed: bool,
}

/// Several tasks may wait on one fd. The poller holds a single one-shot
/// registration per fd armed with the union of the armed waiters.
#[derive(Default)]
struct IoTable {
    fds: HashMap<RawFd, Vec<IoWaiter>>,
    next_key: u64,
}

fn armed_interest(waiters: &[IoWaiter]) -> Option<Interest> {
    waiters
        .iter()
        .filter(|w| w.armed)
        .map(|w| w.interest)
        .reduce(Interest::union)
}

/// The scheduler. Owns processors, the global queue and the poller.
pub struct Runtime {
    shared: Arc<Shared>,
}

/// Cloneable spawner for a runtime, usable from any thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

/// Configures a task before spawning it.
pub struct TaskBuilder {
    shared: Arc<Shared>,
    name: Option<String>,
    stack: bool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let n = config.processors();
        let config = config.with_processors(n);
        let shared = Arc::new(Shared {
            processors: (0..n).map(Processor::new).collect(),
            global: GlobalQueue::new(),
            poller: Poller::new()?,
            io: Mutex::new(IoTable::default()),
            timers: Arc::new(TimerQueue::new()),
            allocators: AllocatorRegistry::new(),
            stacks: DynamicPool::new(STACK_POOL_CAPACITY, || Stack::new(DEFAULT_STACK_SIZE)),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            task_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            next_processor: AtomicUsize::new(0),
            work_available: (Mutex::new(false), Condvar::new()),
            counters: Counters::default(),
            config,
        });
        Ok(Self { shared })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    pub fn builder(&self) -> TaskBuilder {
        TaskBuilder::new(self.shared.clone())
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.builder().spawn(future)
    }

    pub fn spawn_fn<F>(&self, f: F) -> JoinHandle
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.builder().spawn_fn(f)
    }

    /// Run until every spawned task is dead.
    pub fn run(&self) -> Result<(), RuntimeError> {
        if context::in_runtime() {
            return Err(RuntimeError::Nested);
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.shared.running);
        self.shared.shutdown.store(false, Ordering::Release);

        let n = self.shared.processors.len();
        debug!(
            processors = n,
            tasks = self.shared.task_count.load(Ordering::Acquire),
            "runtime started"
        );

        let shared = &self.shared;
        let spawned = thread::scope(|s| -> Result<(), RuntimeError> {
            for index in 1..n {
                let res = thread::Builder::new()
                    .name(format!("metal0-worker-{index}"))
                    .spawn_scoped(s, move || worker_loop(shared, index));
                if let Err(e) = res {
                    error!(worker = index, error = %e, "failed to start worker");
                    shared.shutdown.store(true, Ordering::Release);
                    shared.notify_all();
                    return Err(e.into());
                }
            }
            worker_loop(shared, 0);
            Ok(())
        });

        debug!(stats = ?self.stats(), "runtime stopped");
        spawned
    }

    /// Spawn `future`, run to completion, and return its output.
    pub fn block_on<F, T>(&self, future: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(ResultSlot::new());
        let out = slot.clone();
        let handle = self.spawn(async move {
            out.set(future.await);
            Ok(())
        });
        self.run()?;
        if let Some(Err(e)) = handle.try_result() {
            return Err(e.into());
        }
        slot.take().ok_or(RuntimeError::Task(TaskError::ResultTaken))
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    /// Tasks sitting in any run queue.
    pub fn queued(&self) -> usize {
        self.shared.queued()
    }

    /// Live (not yet dead) tasks.
    pub fn pending(&self) -> usize {
        self.shared.task_count.load(Ordering::Acquire)
    }

    pub fn poller_stats(&self) -> PollerStats {
        self.shared.poller.stats()
    }

    pub fn stack_stats(&self) -> PoolStats {
        self.shared.stacks.stats()
    }

    /// Tasks registered on `fd`, and whether the poller still holds it.
    #[cfg(test)]
    pub(crate) fn io_waiters(&self, fd: RawFd) -> (usize, bool) {
        let n = lock(&self.shared.io).fds.get(&fd).map_or(0, Vec::len);
        (n, self.shared.poller.is_registered(fd))
    }

    #[cfg(test)]
    pub(crate) fn live_timers(&self) -> usize {
        self.shared.timers.len()
    }
}

impl Handle {
    /// Handle of the runtime driving the calling thread.
    pub fn current() -> Result<Self, RuntimeError> {
        context::current_shared()
            .map(|shared| Handle { shared })
            .ok_or(RuntimeError::NoRuntime)
    }

    pub fn builder(&self) -> TaskBuilder {
        TaskBuilder::new(self.shared.clone())
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.builder().spawn(future)
    }

    pub fn spawn_fn<F>(&self, f: F) -> JoinHandle
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.builder().spawn_fn(f)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }
}

impl TaskBuilder {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            name: None,
            stack: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Give the task a dedicated stack buffer from the runtime's pool.
    pub fn stack(mut self, enabled: bool) -> Self {
        self.stack = enabled;
        self
    }

    pub fn spawn<F>(self, future: F) -> JoinHandle
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let id = TaskId::from_raw(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn Schedule> = Arc::downgrade(&self.shared) as Weak<dyn Schedule>;
        let task = Task::new(id, self.name, Box::pin(future) as BoxFuture, self.stack, weak);
        self.shared.submit(task.clone());
        JoinHandle::new(task)
    }

    pub fn spawn_fn<F>(self, f: F) -> JoinHandle
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.spawn(async move { f() })
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Schedule for Shared {
    /// Wake path. A worker of this runtime keeps the task local; any
    /// other thread goes through the global queue.
    fn schedule(&self, task: Arc<Task>) {
        match context::worker_index_for(self) {
            Some(i) => {
                if let Err(task) = self.processors[i].push_back(task) {
                    self.global.push(task);
                }
            }
            None => self.global.push(task),
        }
        self.notify_work();
    }
}

impl Shared {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// Add or refresh a waiter on `fd`. `key` identifies the waiter
    /// across polls and is filled in on first use.
    pub(crate) fn watch_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        waker: &Waker,
        key: &mut Option<IoKey>,
    ) -> Result<(), PollError> {
        let mut guard = lock(&self.io);
        let table = &mut *guard;
        let fresh = !table.fds.contains_key(&fd);
        let k = match *key {
            Some(k) => k,
            None => {
                table.next_key += 1;
                IoKey(table.next_key)
            }
        };

        let waiters = table.fds.entry(fd).or_default();
        match waiters.iter_mut().find(|w| w.key == k) {
            Some(w) => {
                w.interest = interest;
                w.armed = true;
                if !w.waker.will_wake(waker) {
                    w.waker = waker.clone();
                }
            }
            None => waiters.push(IoWaiter {
                key: k,
                interest,
                waker: waker.clone(),
                armed: true,
            }),
        }

        let combined = armed_interest(waiters).unwrap_or(interest);
        let res = if fresh {
            self.poller.register(fd, combined, ())
        } else {
            self.poller.rearm(fd, combined, ())
        };
        if let Err(e) = res {
            waiters.retain(|w| w.key != k);
            if waiters.is_empty() {
                table.fds.remove(&fd);
            }
            *key = None;
            return Err(e);
        }
        *key = Some(k);
        drop(guard);
        self.notify_poller();
        Ok(())
    }

    /// Remove one waiter. The fd leaves the poller with its last waiter.
    pub(crate) fn unwatch_fd(&self, fd: RawFd, key: IoKey) {
        let mut guard = lock(&self.io);
        let table = &mut *guard;
        let Some(waiters) = table.fds.get_mut(&fd) else {
            return;
        };
        waiters.retain(|w| w.key != key);
        if waiters.is_empty() {
            table.fds.remove(&fd);
            if let Err(e) = self.poller.unregister(fd) {
                trace!(fd, error = %e, "unregister");
            }
        } else if let Some(interest) = armed_interest(waiters) {
            if let Err(e) = self.poller.rearm(fd, interest, ()) {
                warn!(fd, error = %e, "failed to rearm fd");
            }
        }
    }

    /// Wake every armed waiter the event concerns and rearm the fd for
    /// the rest.
    fn dispatch_io(&self, fd: RawFd, readiness: Readiness) {
        let mut woken = Vec::new();
        {
            let mut table = lock(&self.io);
            let Some(waiters) = table.fds.get_mut(&fd) else {
                return;
            };
            for w in waiters
                .iter_mut()
                .filter(|w| w.armed && w.interest.is_satisfied_by(readiness))
            {
                w.armed = false;
                woken.push(w.waker.clone());
            }
            if let Some(interest) = armed_interest(waiters) {
                if let Err(e) = self.poller.rearm(fd, interest, ()) {
                    error!(fd, error = %e, "failed to rearm fd");
                }
            }
        }
        for waker in woken {
            waker.wake();
        }
    }

    fn submit(&self, task: Arc<Task>) {
        if let Err(e) = task.make_runnable() {
            warn!(task = %task.id(), error = %e, "refusing to schedule task");
            return;
        }
        self.task_count.fetch_add(1, Ordering::AcqRel);
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        trace!(task = %task.id(), name = task.name().unwrap_or(""), "spawn");

        let n = self.processors.len();
        let index = context::worker_index_for(self)
            .unwrap_or_else(|| self.next_processor.fetch_add(1, Ordering::Relaxed) % n);
        if let Err(task) = self.processors[index].push_task(task) {
            self.global.push(task);
        }
        self.notify_work();
    }

    fn queued(&self) -> usize {
        self.global.len() + self.processors.iter().map(Processor::queue_size).sum::<usize>()
    }

    fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            total_spawned: c.spawned.load(Ordering::Relaxed),
            total_completed: c.completed.load(Ordering::Relaxed),
            total_failed: c.failed.load(Ordering::Relaxed),
            total_polls: c.polls.load(Ordering::Relaxed),
            total_yields: c.yields.load(Ordering::Relaxed),
            total_preemptions: c.preemptions.load(Ordering::Relaxed),
            total_steals: c.steals.load(Ordering::Relaxed),
            total_stolen: c.stolen.load(Ordering::Relaxed),
        }
    }

    fn notify_poller(&self) {
        if self.polling.load(Ordering::Acquire) {
            if let Err(e) = self.poller.notify() {
                error!(error = %e, "failed to interrupt poller");
            }
        }
    }

    fn notify_work(&self) {
        let (mutex, cvar) = &self.work_available;
        *lock(mutex) = true;
        cvar.notify_one();
        self.notify_poller();
    }

    fn notify_all(&self) {
        let (mutex, cvar) = &self.work_available;
        *lock(mutex) = true;
        cvar.notify_all();
        self.notify_poller();
    }

    fn should_exit(&self) -> bool {
        self.task_count.load(Ordering::Acquire) == 0 || self.shutdown.load(Ordering::Acquire)
    }

    fn has_work_for(&self, index: usize) -> bool {
        if !self.global.is_empty() || self.processors[index].has_work() {
            return true;
        }
        self.config.enable_work_stealing && self.processors.iter().any(|p| p.queue_size() > 1)
    }

    fn find_work(&self, index: usize, tick: u32, rng: &mut u64) -> Option<Arc<Task>> {
        let local = &self.processors[index];

        if tick % GLOBAL_CHECK_INTERVAL == 0 {
            if let Some(task) = self.global.pop() {
                return Some(task);
            }
        }

        if let Some(task) = local.pop_task() {
            return Some(task);
        }

        if !self.global.is_empty() {
            let n = (self.global.len() / self.processors.len() + 1).min(LOCAL_QUEUE_CAPACITY / 2);
            let mut batch = self.global.pop_batch(n).into_iter();
            if let Some(first) = batch.next() {
                let overflow = local.push_batch(batch.collect());
                self.global.push_batch(overflow);
                return Some(first);
            }
        }

        let n = self.processors.len();
        if self.config.enable_work_stealing && n > 1 {
            for _ in 0..n {
                let victim = (xorshift64(rng) as usize) % n;
                if victim == index {
                    continue;
                }
                let mut stolen = self.processors[victim].steal_half().into_iter();
                if let Some(first) = stolen.next() {
                    let rest: Vec<_> = stolen.collect();
                    self.counters.steals.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .stolen
                        .fetch_add(rest.len() as u64 + 1, Ordering::Relaxed);
                    trace!(worker = index, victim, count = rest.len() + 1, "steal");
                    let overflow = local.push_batch(rest);
                    self.global.push_batch(overflow);
                    return Some(first);
                }
            }
        }

        None
    }

    /// Fire due timers and hand ready fds' wakers their events.
    fn poll_io(&self, timeout_ms: i32) {
        self.timers.fire_due(Instant::now());
        if timeout_ms == 0 && self.poller.is_empty() {
            return;
        }
        match self.poller.wait(timeout_ms) {
            Ok(events) => {
                for ev in events {
                    self.dispatch_io(ev.fd, ev.readiness);
                }
            }
            Err(e) => error!(error = %e, "poller wait failed"),
        }
        self.timers.fire_due(Instant::now());
    }

    fn idle(&self, index: usize) {
        if self.timers.fire_due(Instant::now()) > 0 || self.has_work_for(index) {
            return;
        }

        let mut wait = IDLE_TIMEOUT;
        if let Some(deadline) = self.timers.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }

        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Re-check after publishing `polling` so a concurrent wake
            // either sees the flag or left work behind.
            let timeout_ms = if self.has_work_for(index) || self.should_exit() {
                0
            } else {
                wait.as_micros().div_ceil(1000) as i32
            };
            self.poll_io(timeout_ms);
            self.polling.store(false, Ordering::Release);
            return;
        }

        let (mutex, cvar) = &self.work_available;
        let mut ready = lock(mutex);
        if *ready {
            *ready = false;
            return;
        }
        if self.has_work_for(index) || self.should_exit() {
            return;
        }
        let (mut ready, _) = cvar
            .wait_timeout(ready, wait)
            .unwrap_or_else(PoisonError::into_inner);
        *ready = false;
    }

    fn run_task(&self, task: Arc<Task>, alloc: &ThreadLocalAllocator) {
        if task.make_running().is_err() {
            return;
        }
        self.counters.polls.fetch_add(1, Ordering::Relaxed);
        task.begin_dispatch();

        if !task.has_arena() {
            match alloc.acquire_arena(task.id()) {
                Ok(arena) => task.attach_arena(arena),
                Err(e) => {
                    self.finish(task, Err(e.into()), alloc);
                    return;
                }
            }
        }
        if task.wants_stack() && !task.has_stack() {
            task.attach_stack(self.stacks.acquire());
        }

        let poll = {
            let _current = context::set_current_task(task.clone());
            task.poll()
        };

        match poll {
            Poll::Ready(result) => self.finish(task, result, alloc),
            Poll::Pending => {
                let kind = task.take_yield_kind();
                if !task.park_after_poll() {
                    return;
                }
                match kind {
                    YieldKind::Preempted => {
                        self.counters.preemptions.fetch_add(1, Ordering::Relaxed);
                        trace!(task = %task.id(), "preempted");
                        self.global.push(task);
                    }
                    YieldKind::Cooperative | YieldKind::None => {
                        if kind == YieldKind::Cooperative {
                            self.counters.yields.fetch_add(1, Ordering::Relaxed);
                        }
                        self.schedule(task);
                        return;
                    }
                }
                self.notify_work();
            }
        }
    }

    fn finish(&self, task: Arc<Task>, result: Result<(), TaskError>, alloc: &ThreadLocalAllocator) {
        if let Err(e) = task.make_dead() {
            warn!(task = %task.id(), error = %e, "task finished from unexpected state");
        }
        if let Err(e) = &result {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(task = %task.id(), name = task.name().unwrap_or(""), error = %e, "task failed");
        }
        if let Some(arena) = task.take_arena() {
            alloc.release_arena(arena);
        }
        if let Some(stack) = task.take_stack() {
            self.stacks.release(stack);
        }
        task.complete(result);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);

        if self.task_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify_all();
        }
    }
}

/// Simple xorshift64 for random victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn worker_loop(shared: &Arc<Shared>, index: usize) {
    let _enter = context::enter(shared.clone(), index);
    let alloc = shared.allocators.get_or_create();
    let mut rng = (index as u64).wrapping_add(0x9E3779B97F4A7C15);
    let mut tick: u32 = 0;
    debug!(worker = index, "worker started");

    while !shared.should_exit() {
        tick = tick.wrapping_add(1);
        if tick % GLOBAL_CHECK_INTERVAL == 0 {
            shared.poll_io(0);
        }
        match shared.find_work(index, tick, &mut rng) {
            Some(task) => shared.run_task(task, &alloc),
            None => shared.idle(index),
        }
    }

    shared.allocators.retire();
    shared.notify_all();
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::yield_now::{yield_now, yield_point, TIME_SLICE};
    use crate::time::timeout;
    use std::pin::Pin;
    use std::sync::atomic::AtomicI32;
    use std::task::Context;

    #[test]
    fn runs_spawned_closures() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            rt.spawn_fn(move || {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        rt.run().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        let stats = rt.stats();
        assert_eq!(stats.total_spawned, 10);
        assert_eq!(stats.total_completed, 10);
        assert_eq!(rt.queued(), 0);
        assert_eq!(rt.pending(), 0);
    }

    #[test]
    fn empty_runtime_returns_immediately() {
        let rt = Runtime::new(RuntimeConfig::default().with_processors(2)).unwrap();
        rt.run().unwrap();
        assert_eq!(rt.stats(), RuntimeStats::default());
    }

    #[test]
    fn failures_are_counted_and_observable() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let ok = rt.spawn_fn(|| Ok(()));
        let bad = rt.spawn_fn(|| Err(TaskError::failed("nope")));
        let boom = rt.spawn(async { panic!("kaboom") });
        rt.run().unwrap();

        assert!(matches!(ok.try_result(), Some(Ok(()))));
        assert!(matches!(bad.try_result(), Some(Err(TaskError::Failed(_)))));
        assert!(matches!(boom.try_result(), Some(Err(TaskError::Panicked(_)))));
        let stats = rt.stats();
        assert_eq!(stats.total_completed, 3);
        assert_eq!(stats.total_failed, 2);
    }

    #[test]
    fn spawned_from_inside_uses_next_slot() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        rt.spawn(async move {
            let handle = Handle::current()?;
            for i in 0..3 {
                let o = o.clone();
                handle.spawn_fn(move || {
                    o.lock().unwrap().push(i);
                    Ok(())
                });
            }
            Ok(())
        });
        rt.run().unwrap();
        // The newest spawn sits in the next slot; older ones were demoted
        // to the ring in FIFO order.
        assert_eq!(*order.lock().unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn block_on_returns_value() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let v = rt
            .block_on(async {
                yield_now().await;
                40 + 2
            })
            .unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn nested_run_is_rejected() {
        let rt = Arc::new(Runtime::new(RuntimeConfig::single_threaded()).unwrap());
        let inner = rt.clone();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        rt.spawn_fn(move || {
            *s.lock().unwrap() = Some(matches!(inner.run(), Err(RuntimeError::Nested)));
            Ok(())
        });
        rt.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn finished_timeouts_leave_no_timers() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        rt.spawn(async {
            for _ in 0..1000 {
                timeout(Duration::from_secs(3600), yield_now())
                    .await
                    .map_err(|e| TaskError::failed(e.to_string()))?;
            }
            Ok(())
        });
        rt.run().unwrap();
        assert_eq!(rt.stats().total_failed, 0);
        assert_eq!(rt.live_timers(), 0);
    }

    #[test]
    fn preempted_task_runs_behind_fresh_work() {
        let rt = Runtime::new(RuntimeConfig::single_threaded().with_preemption(true)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        rt.spawn(async move {
            l.lock().unwrap().push("hog:start".to_string());
            let handle = Handle::current()?;
            // Enough to fill the next slot, the ring and spill into global.
            for i in 0..300 {
                let l = l.clone();
                handle.spawn_fn(move || {
                    l.lock().unwrap().push(format!("child{i}"));
                    Ok(())
                });
            }
            let start = Instant::now();
            while start.elapsed() < TIME_SLICE {
                std::hint::spin_loop();
            }
            yield_point().await;
            l.lock().unwrap().push("hog:end".to_string());
            Ok(())
        });
        rt.run().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 302);
        assert_eq!(log[0], "hog:start");
        assert_eq!(log[301], "hog:end");
        let stats = rt.stats();
        assert_eq!(stats.total_preemptions, 1);
        assert_eq!(stats.total_yields, 0);
    }

    #[derive(Default)]
    struct Track {
        polls: AtomicUsize,
        wakes: AtomicUsize,
        active: AtomicBool,
        overlaps: AtomicUsize,
        done: AtomicBool,
        waker: Mutex<Option<Waker>>,
    }

    /// Pending until polled `target` times; records overlapping polls.
    struct Tracked {
        track: Arc<Track>,
        target: usize,
    }

    impl Future for Tracked {
        type Output = Result<(), TaskError>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let t = &self.track;
            if t.active.swap(true, Ordering::SeqCst) {
                t.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let n = t.polls.fetch_add(1, Ordering::SeqCst) + 1;
            *t.waker.lock().unwrap() = Some(cx.waker().clone());
            let out = if n >= self.target {
                t.done.store(true, Ordering::SeqCst);
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            };
            t.active.store(false, Ordering::SeqCst);
            out
        }
    }

    #[test]
    fn concurrent_wakes_never_double_schedule() {
        let rt = Runtime::new(RuntimeConfig::default().with_processors(4)).unwrap();
        let tracks: Vec<Arc<Track>> = (0..16).map(|_| Arc::new(Track::default())).collect();
        for t in &tracks {
            rt.spawn(Tracked {
                track: t.clone(),
                target: 200,
            });
        }

        thread::scope(|s| {
            for _ in 0..3 {
                let tracks = &tracks;
                s.spawn(move || {
                    while !tracks.iter().all(|t| t.done.load(Ordering::SeqCst)) {
                        for t in tracks {
                            let waker = t.waker.lock().unwrap().clone();
                            if let Some(w) = waker {
                                t.wakes.fetch_add(1, Ordering::SeqCst);
                                w.wake_by_ref();
                            }
                        }
                    }
                });
            }
            rt.run().unwrap();
        });

        let mut total = 0;
        for t in &tracks {
            let polls = t.polls.load(Ordering::SeqCst);
            assert_eq!(polls, 200);
            assert!(polls <= t.wakes.load(Ordering::SeqCst) + 1);
            assert_eq!(t.overlaps.load(Ordering::SeqCst), 0);
            total += polls as u64;
        }
        let stats = rt.stats();
        assert_eq!(stats.total_polls, total);
        assert_eq!(stats.total_completed, 16);
        assert_eq!(rt.queued(), 0);
    }

    #[test]
    fn nested_arena_access_does_not_block() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        rt.spawn_fn(move || {
            let nested = crate::with_arena(|outer| {
                let inner = crate::with_arena(|_| ());
                outer.alloc(1u32).is_ok() && inner.is_none()
            });
            let again = crate::with_arena(|a| a.total_allocated());
            *s.lock().unwrap() = Some((nested, again));
            Ok(())
        });
        rt.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((Some(true), Some(4))));
    }

    #[test]
    fn stack_is_pooled() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        for _ in 0..4 {
            rt.builder().name("stacked").stack(true).spawn_fn(|| {
                let len = crate::with_stack(|s| {
                    s[0] = 1;
                    s.len()
                });
                assert_eq!(len, Some(DEFAULT_STACK_SIZE));
                Ok(())
            });
        }
        rt.run().unwrap();
        assert_eq!(rt.stats().total_failed, 0);
        let stats = rt.stack_stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_reused, 3);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn xorshift_never_sticks_at_zero() {
        let mut s = 0x9E3779B97F4A7C15u64;
        for _ in 0..1000 {
            assert_ne!(xorshift64(&mut s), 0);
        }
    }
}
