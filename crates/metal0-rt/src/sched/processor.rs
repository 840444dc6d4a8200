// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-worker run queues and the global overflow queue.
//!
//! A processor owns a single "next" slot (LIFO fast path for the most
//! recently spawned task) in front of a bounded FIFO ring. Both sit
//! behind one mutex so a task is always in exactly one place; the
//! combined length is mirrored in an atomic for lock-free introspection.
//!
//! Stealers take from the front of the ring (oldest work) and never
//! touch the next slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

use super::task::Task;

/// Max tasks in a processor's ring (the next slot is extra).
pub const LOCAL_QUEUE_CAPACITY: usize = 256;

struct LocalQueue {
    next: Option<Arc<Task>>,
    ring: VecDeque<Arc<Task>>,
}

impl LocalQueue {
    fn len(&self) -> usize {
        self.ring.len() + usize::from(self.next.is_some())
    }
}

/// Counter snapshot for one processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Tasks handed out by `pop_task`.
    pub popped: usize,
    /// Pushes that did not fit and went back to the caller.
    pub overflowed: usize,
    /// Tasks other processors took from this one.
    pub stolen_from: usize,
}

#[derive(Default)]
struct Counters {
    popped: AtomicUsize,
    overflowed: AtomicUsize,
    stolen_from: AtomicUsize,
}

/// One worker's execution context.
pub struct Processor {
    index: usize,
    queue: Mutex<LocalQueue>,
    len: AtomicUsize,
    counters: Counters,
}

impl Processor {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            queue: Mutex::new(LocalQueue {
                next: None,
                ring: VecDeque::with_capacity(LOCAL_QUEUE_CAPACITY),
            }),
            len: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Put `task` in the next slot. A task already there is demoted to
    /// the back of the ring. If the ring is full the demoted task is
    /// returned so the caller can route it to the global queue.
    pub fn push_task(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let mut q = lock(&self.queue);
        let Some(prev) = q.next.replace(task) else {
            self.len.store(q.len(), Ordering::Release);
            return Ok(());
        };
        let res = if q.ring.len() < LOCAL_QUEUE_CAPACITY {
            q.ring.push_back(prev);
            Ok(())
        } else {
            self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            Err(prev)
        };
        self.len.store(q.len(), Ordering::Release);
        res
    }

    /// Append to the back of the ring, bypassing the next slot.
    pub fn push_back(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let mut q = lock(&self.queue);
        if q.ring.len() >= LOCAL_QUEUE_CAPACITY {
            self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            return Err(task);
        }
        q.ring.push_back(task);
        self.len.store(q.len(), Ordering::Release);
        Ok(())
    }

    /// Append as many of `tasks` as fit; the rest are returned.
    pub fn push_batch(&self, tasks: Vec<Arc<Task>>) -> Vec<Arc<Task>> {
        let mut q = lock(&self.queue);
        let room = LOCAL_QUEUE_CAPACITY.saturating_sub(q.ring.len());
        let mut tasks = tasks.into_iter();
        q.ring.extend(tasks.by_ref().take(room));
        self.len.store(q.len(), Ordering::Release);
        tasks.collect()
    }

    /// Next slot first, then the oldest ring entry.
    pub fn pop_task(&self) -> Option<Arc<Task>> {
        let mut q = lock(&self.queue);
        let task = q.next.take().or_else(|| q.ring.pop_front());
        self.len.store(q.len(), Ordering::Release);
        if task.is_some() {
            self.counters.popped.fetch_add(1, Ordering::Relaxed);
        }
        task
    }

    /// Take at most half of this processor's queued tasks, oldest first.
    pub fn steal_half(&self) -> Vec<Arc<Task>> {
        let mut q = lock(&self.queue);
        let count = (q.len() / 2).min(q.ring.len());
        if count == 0 {
            return Vec::new();
        }
        let stolen: Vec<_> = q.ring.drain(..count).collect();
        self.len.store(q.len(), Ordering::Release);
        self.counters
            .stolen_from
            .fetch_add(stolen.len(), Ordering::Relaxed);
        stolen
    }

    /// Everything still queued. Used when the runtime shuts down.
    pub fn drain(&self) -> Vec<Arc<Task>> {
        let mut q = lock(&self.queue);
        let mut all: Vec<_> = q.next.take().into_iter().collect();
        all.extend(q.ring.drain(..));
        self.len.store(0, Ordering::Release);
        all
    }

    pub fn has_work(&self) -> bool {
        self.queue_size() > 0
    }

    pub fn queue_size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            popped: self.counters.popped.load(Ordering::Relaxed),
            overflowed: self.counters.overflowed.load(Ordering::Relaxed),
            stolen_from: self.counters.stolen_from.load(Ordering::Relaxed),
        }
    }
}

/// Unbounded FIFO shared by every processor. Overflow, preempted tasks
/// and wakes from outside the workers land here.
#[derive(Default)]
pub struct GlobalQueue {
    queue: Mutex<VecDeque<Arc<Task>>>,
    len: AtomicUsize,
}

impl GlobalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Arc<Task>) {
        let mut q = lock(&self.queue);
        q.push_back(task);
        self.len.store(q.len(), Ordering::Release);
    }

    pub fn push_batch(&self, tasks: Vec<Arc<Task>>) {
        if tasks.is_empty() {
            return;
        }
        let mut q = lock(&self.queue);
        q.extend(tasks);
        self.len.store(q.len(), Ordering::Release);
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        let mut q = lock(&self.queue);
        let task = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        task
    }

    /// Pop up to `n` tasks from the front.
    pub fn pop_batch(&self, n: usize) -> Vec<Arc<Task>> {
        let mut q = lock(&self.queue);
        let count = n.min(q.len());
        let batch: Vec<_> = q.drain(..count).collect();
        self.len.store(q.len(), Ordering::Release);
        batch
    }

    pub fn drain(&self) -> Vec<Arc<Task>> {
        let mut q = lock(&self.queue);
        self.len.store(0, Ordering::Release);
        q.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
