// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waker plumbing shared by the poller, channels, timers and joins.
//!
//! `std::task::Waker` is already a type-erased `{wake, wake_by_ref,
//! clone, drop}` handle, so everything here stores plain `Waker`s. The
//! task-side implementation lives in `sched::task::TaskWaker`.
//!
//! - `AtomicWaker`: at most one registered waker, replaced on register
//! - `WakerList`  : broadcast to every registered waker
//! - `WakerQueue` : FIFO of keyed waiters, woken one at a time
//! - `ThreadWaker`: unparks an OS thread (blocking waits)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

use crate::lock;

/// Single-slot waker cell.
///
/// `register` replaces (and drops) any previous waker; `wake` takes the
/// stored waker out and wakes it, leaving the cell empty.
#[derive(Debug, Default)]
pub struct AtomicWaker {
    slot: Mutex<Option<Waker>>,
}

impl AtomicWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, waker: &Waker) {
        let mut slot = lock(&self.slot);
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Wake and clear. Returns true if a waker was registered.
    pub fn wake(&self) -> bool {
        match self.take() {
            Some(w) => {
                w.wake();
                true
            }
            None => false,
        }
    }

    pub fn take(&self) -> Option<Waker> {
        lock(&self.slot).take()
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

/// Broadcast set of wakers ("wake everyone waiting on this resource").
#[derive(Debug, Default)]
pub struct WakerList {
    wakers: Mutex<Vec<Waker>>,
}

impl WakerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a waker unless an equivalent one is already present.
    pub fn register(&self, waker: &Waker) {
        let mut wakers = lock(&self.wakers);
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Wake and remove every registered waker. Returns how many fired.
    pub fn wake_all(&self) -> usize {
        // Wake outside the lock: wakers may re-enter the scheduler.
        let drained: Vec<Waker> = lock(&self.wakers).drain(..).collect();
        let n = drained.len();
        for w in drained {
            w.wake();
        }
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.wakers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identifies one registration in a `WakerQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitKey(u64);

#[derive(Debug, Default)]
struct QueueInner {
    next_key: u64,
    waiters: VecDeque<(WaitKey, Waker)>,
}

/// FIFO of waiters. `wake_one` pops the oldest registration.
///
/// Registrations are keyed so a waiter that gives up (completes through
/// another path, times out, is dropped) can withdraw. `remove` reports
/// whether the registration was still queued; `false` means it was
/// already consumed by a wake, which the caller must forward with
/// `wake_one` if it is not going to act on it.
#[derive(Debug, Default)]
pub struct WakerQueue {
    inner: Mutex<QueueInner>,
}

impl WakerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, waker: &Waker) -> WaitKey {
        let mut inner = lock(&self.inner);
        let key = WaitKey(inner.next_key);
        inner.next_key += 1;
        inner.waiters.push_back((key, waker.clone()));
        key
    }

    /// Refresh the waker of a still-queued registration. Returns false
    /// if the key was already consumed or removed.
    pub fn update(&self, key: WaitKey, waker: &Waker) -> bool {
        let mut inner = lock(&self.inner);
        match inner.waiters.iter_mut().find(|(k, _)| *k == key) {
            Some((_, w)) => {
                if !w.will_wake(waker) {
                    *w = waker.clone();
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: WaitKey) -> bool {
        let mut inner = lock(&self.inner);
        match inner.waiters.iter().position(|(k, _)| *k == key) {
            Some(pos) => {
                inner.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn wake_one(&self) -> bool {
        let next = lock(&self.inner).waiters.pop_front();
        match next {
            Some((_, w)) => {
                w.wake();
                true
            }
            None => false,
        }
    }

    pub fn wake_all(&self) -> usize {
        let drained: Vec<(WaitKey, Waker)> = lock(&self.inner).waiters.drain(..).collect();
        let n = drained.len();
        for (_, w) in drained {
            w.wake();
        }
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waker that unparks the thread that created it.
#[derive(Debug)]
pub struct ThreadWaker {
    thread: Thread,
    notified: AtomicBool,
}

impl ThreadWaker {
    pub fn current() -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        })
    }

    /// Consume a pending notification.
    pub fn take_notified(&self) -> bool {
        self.notified.swap(false, Ordering::AcqRel)
    }
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }
}
