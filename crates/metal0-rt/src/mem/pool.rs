// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Object pools: fixed-capacity `Pool`, overflowing `DynamicPool`, and
//! the `ArenaPool` that recycles task arenas.
//!
//! Every free list sits behind its own mutex so `acquire`/`release` may
//! be called from any worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::AllocError;
use crate::lock;
use crate::sched::task::TaskId;

use super::arena::{TaskArena, DEFAULT_CHUNK_SIZE};

/// Idle arenas kept per pool; extras are freed on release.
pub const MAX_IDLE_ARENAS: usize = 64;

/// Counter snapshot shared by all pool kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_created: usize,
    pub total_reused: usize,
    pub total_returned: usize,
    pub total_overflow: usize,
    pub available: usize,
    pub in_use: usize,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    reused: AtomicUsize,
    returned: AtomicUsize,
    overflow: AtomicUsize,
}

impl Counters {
    fn snapshot(&self, available: usize, in_use: usize) -> PoolStats {
        PoolStats {
            total_created: self.created.load(Ordering::Relaxed),
            total_reused: self.reused.load(Ordering::Relaxed),
            total_returned: self.returned.load(Ordering::Relaxed),
            total_overflow: self.overflow.load(Ordering::Relaxed),
            available,
            in_use,
        }
    }
}

struct Slots<T> {
    free: Vec<Box<T>>,
    in_use: usize,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Fixed-capacity pool. At most `capacity` items exist; `acquire`
/// returns `None` once all of them are checked out.
pub struct Pool<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
    factory: Factory<T>,
    counters: Counters,
}

impl<T> Pool<T> {
    /// Items are created lazily by `factory`, up to `capacity`.
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            slots: Mutex::new(Slots {
                free: Vec::with_capacity(capacity),
                in_use: 0,
            }),
            capacity,
            factory: Box::new(factory),
            counters: Counters::default(),
        }
    }

    pub fn acquire(&self) -> Option<Box<T>> {
        let mut slots = lock(&self.slots);
        if let Some(item) = slots.free.pop() {
            slots.in_use += 1;
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Some(item);
        }
        if slots.in_use + slots.free.len() >= self.capacity {
            return None;
        }
        slots.in_use += 1;
        drop(slots);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Some(Box::new((self.factory)()))
    }

    pub fn release(&self, item: Box<T>) {
        let mut slots = lock(&self.slots);
        slots.in_use = slots.in_use.saturating_sub(1);
        slots.free.push(item);
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let slots = lock(&self.slots);
        self.counters.snapshot(slots.free.len(), slots.in_use)
    }
}

/// Pool that never refuses: past `capacity` checked-out items it
/// allocates from the heap and counts the overflow. Releases beyond the
/// idle capacity are dropped.
pub struct DynamicPool<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
    factory: Factory<T>,
    counters: Counters,
}

impl<T> DynamicPool<T> {
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            slots: Mutex::new(Slots {
                free: Vec::new(),
                in_use: 0,
            }),
            capacity,
            factory: Box::new(factory),
            counters: Counters::default(),
        }
    }

    pub fn acquire(&self) -> Box<T> {
        let mut slots = lock(&self.slots);
        slots.in_use += 1;
        if let Some(item) = slots.free.pop() {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return item;
        }
        let overflow = slots.in_use > self.capacity;
        drop(slots);
        if overflow {
            self.counters.overflow.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Box::new((self.factory)())
    }

    pub fn release(&self, item: Box<T>) {
        let mut slots = lock(&self.slots);
        slots.in_use = slots.in_use.saturating_sub(1);
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        if slots.free.len() < self.capacity {
            slots.free.push(item);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let slots = lock(&self.slots);
        self.counters.snapshot(slots.free.len(), slots.in_use)
    }
}

/// Free list of task arenas.
///
/// `acquire` hands out a previously released arena when one is idle,
/// rebinding it to the new owner; otherwise it allocates a fresh one.
/// `release` resets the arena before parking it, so a reacquired arena
/// always starts with `total_allocated() == 0`.
#[derive(Debug)]
pub struct ArenaPool {
    free: Mutex<Vec<Box<TaskArena>>>,
    chunk_size: usize,
    limit: Option<usize>,
    max_idle: usize,
    counters: Counters,
    in_use: AtomicUsize,
}

impl ArenaPool {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_CHUNK_SIZE, None, MAX_IDLE_ARENAS)
    }

    /// `limit` is applied to every arena this pool creates.
    pub fn with_options(chunk_size: usize, limit: Option<usize>, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            chunk_size,
            limit,
            max_idle,
            counters: Counters::default(),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self, owner: TaskId) -> Result<Box<TaskArena>, AllocError> {
        let reused = lock(&self.free).pop();
        let mut arena = match reused {
            Some(arena) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                arena
            }
            None => {
                let arena = TaskArena::with_options(None, self.chunk_size, self.limit)?;
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Box::new(arena)
            }
        };
        arena.bind(owner);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(arena)
    }

    pub fn release(&self, mut arena: Box<TaskArena>) {
        arena.reset();
        arena.unbind();
        // Arenas may come home to a different worker's pool than the one
        // that created them, so the count saturates instead of wrapping.
        let _ = self
            .in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        let mut free = lock(&self.free);
        if free.len() < self.max_idle {
            free.push(arena);
        }
    }

    /// Arenas parked and ready for reuse.
    pub fn idle(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.idle();
        self.counters
            .snapshot(available, self.in_use.load(Ordering::Relaxed))
    }
}

impl Default for ArenaPool {
    fn default() -> Self {
        Self::new()
    }
}
