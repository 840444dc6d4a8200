// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-worker allocators.
//!
//! Each worker thread gets its own `ThreadLocalAllocator` (and with it
//! its own arena pool) so task arenas are recycled without contending
//! with other workers. The registry is owned by the runtime and hands
//! the allocator to the worker loop explicitly; nothing here relies on
//! `thread_local!`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::error::AllocError;
use crate::lock;
use crate::sched::task::TaskId;

use super::arena::TaskArena;
use super::pool::{ArenaPool, PoolStats};

/// Allocator owned by one worker thread.
#[derive(Debug)]
pub struct ThreadLocalAllocator {
    owner: ThreadId,
    arenas: ArenaPool,
    /// Releases that arrived from a thread other than the owner.
    foreign_releases: AtomicUsize,
}

impl ThreadLocalAllocator {
    fn for_current_thread() -> Self {
        Self {
            owner: thread::current().id(),
            arenas: ArenaPool::new(),
            foreign_releases: AtomicUsize::new(0),
        }
    }

    /// True on the thread that created this allocator.
    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn acquire_arena(&self, task: TaskId) -> Result<Box<TaskArena>, AllocError> {
        self.arenas.acquire(task)
    }

    pub fn release_arena(&self, arena: Box<TaskArena>) {
        if !self.is_owner() {
            self.foreign_releases.fetch_add(1, Ordering::Relaxed);
        }
        self.arenas.release(arena);
    }

    pub fn arena_stats(&self) -> PoolStats {
        self.arenas.stats()
    }

    pub fn foreign_releases(&self) -> usize {
        self.foreign_releases.load(Ordering::Relaxed)
    }
}

/// Lazily populated map from worker thread to its allocator.
#[derive(Debug, Default)]
pub struct AllocatorRegistry {
    allocators: Mutex<HashMap<ThreadId, Arc<ThreadLocalAllocator>>>,
}

impl AllocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The calling thread's allocator, created on first use.
    pub fn get_or_create(&self) -> Arc<ThreadLocalAllocator> {
        let id = thread::current().id();
        lock(&self.allocators)
            .entry(id)
            .or_insert_with(|| Arc::new(ThreadLocalAllocator::for_current_thread()))
            .clone()
    }

    /// Drop the calling thread's allocator. Called when a worker exits.
    pub fn retire(&self) -> Option<Arc<ThreadLocalAllocator>> {
        lock(&self.allocators).remove(&thread::current().id())
    }

    pub fn len(&self) -> usize {
        lock(&self.allocators).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_per_thread() {
        let registry = Arc::new(AllocatorRegistry::new());
        let mine = registry.get_or_create();
        assert!(mine.is_owner());
        assert!(Arc::ptr_eq(&mine, &registry.get_or_create()));

        let r = registry.clone();
        let theirs = thread::spawn(move || {
            let a = r.get_or_create();
            assert!(a.is_owner());
            a
        })
        .join()
        .unwrap();

        assert!(!theirs.is_owner());
        assert!(!Arc::ptr_eq(&mine, &theirs));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn retire_removes_only_caller() {
        let registry = AllocatorRegistry::new();
        registry.get_or_create();
        assert!(registry.retire().is_some());
        assert!(registry.retire().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn foreign_release_is_counted() {
        let registry = AllocatorRegistry::new();
        let alloc = registry.get_or_create();
        let arena = alloc.acquire_arena(TaskId::from_raw(9)).unwrap();

        let a = alloc.clone();
        thread::spawn(move || a.release_arena(arena)).join().unwrap();

        assert_eq!(alloc.foreign_releases(), 1);
        assert_eq!(alloc.arena_stats().available, 1);
    }
}
