// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timers: `sleep`, `sleep_until`, `timeout`.
//!
//! Inside a runtime, deadlines go into the runtime's timer heap, which
//! the worker loop fires and which bounds the poller timeout. Outside a
//! runtime they go into one process-wide heap driven by a lazily started
//! `metal0-timer` thread.
//!
//! Dropping a `Sleep` before it fires cancels its entry and releases the
//! registered waker straight away. Cancelled entries are skipped when
//! they reach the top of the heap and compacted out once they make up
//! half of it.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use tracing::error;

use crate::context;
use crate::error::Elapsed;
use crate::lock;
use crate::waker::AtomicWaker;

/// Cancelled entries tolerated before the heap is compacted.
const COMPACT_MIN: usize = 32;

/// Shared between a pending `Sleep` and whoever fires it.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    fired: AtomicBool,
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

impl TimerSlot {
    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    slot: Arc<TimerSlot>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Reverse<Entry>>,
    /// Entries still in `entries` whose slot was cancelled.
    cancelled: usize,
}

/// Min-heap of deadlines.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: Mutex<Heap>,
    seq: AtomicU64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, deadline: Instant) -> Arc<TimerSlot> {
        let slot = Arc::new(TimerSlot::default());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.heap).entries.push(Reverse(Entry {
            deadline,
            seq,
            slot: slot.clone(),
        }));
        slot
    }

    /// Withdraw a pending timer. No-op once it has fired.
    pub(crate) fn cancel(&self, slot: &TimerSlot) {
        {
            let mut heap = lock(&self.heap);
            if slot.is_fired() || slot.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            heap.cancelled += 1;
            if heap.cancelled >= COMPACT_MIN && heap.cancelled * 2 >= heap.entries.len() {
                heap.entries.retain(|Reverse(e)| !e.slot.is_cancelled());
                heap.cancelled = 0;
            }
        }
        drop(slot.waker.take());
    }

    /// Fire every timer whose deadline is at or before `now`.
    pub(crate) fn fire_due(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        {
            let mut heap = lock(&self.heap);
            while heap.entries.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
                let Some(Reverse(e)) = heap.entries.pop() else {
                    break;
                };
                if e.slot.is_cancelled() {
                    heap.cancelled = heap.cancelled.saturating_sub(1);
                    continue;
                }
                e.slot.fired.store(true, Ordering::Release);
                due.push(e.slot);
            }
        }
        // Wake outside the lock: wakers re-enter the scheduler.
        for slot in &due {
            slot.waker.wake();
        }
        due.len()
    }

    /// Earliest live deadline. Drops cancelled entries sitting on top.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut heap = lock(&self.heap);
        loop {
            let (deadline, cancelled) = match heap.entries.peek() {
                Some(Reverse(e)) => (e.deadline, e.slot.is_cancelled()),
                None => return None,
            };
            if !cancelled {
                return Some(deadline);
            }
            heap.entries.pop();
            heap.cancelled = heap.cancelled.saturating_sub(1);
        }
    }

    /// Live (not cancelled, not fired) timers.
    pub(crate) fn len(&self) -> usize {
        let heap = lock(&self.heap);
        heap.entries.len() - heap.cancelled
    }
}

/// Drives the heap used by sleeps created outside any runtime.
struct TimerThread {
    queue: Arc<TimerQueue>,
    kicked: Mutex<bool>,
    cvar: Condvar,
}

impl TimerThread {
    fn get() -> Option<&'static Arc<TimerThread>> {
        static DRIVER: OnceLock<Option<Arc<TimerThread>>> = OnceLock::new();
        DRIVER
            .get_or_init(|| {
                let driver = Arc::new(TimerThread {
                    queue: Arc::new(TimerQueue::new()),
                    kicked: Mutex::new(false),
                    cvar: Condvar::new(),
                });
                let d = driver.clone();
                match thread::Builder::new()
                    .name("metal0-timer".into())
                    .spawn(move || d.run())
                {
                    Ok(_) => Some(driver),
                    Err(e) => {
                        error!(error = %e, "failed to start timer thread");
                        None
                    }
                }
            })
            .as_ref()
    }

    fn insert(&self, deadline: Instant) -> Arc<TimerSlot> {
        let slot = self.queue.insert(deadline);
        *lock(&self.kicked) = true;
        self.cvar.notify_one();
        slot
    }

    fn run(&self) {
        loop {
            self.queue.fire_due(Instant::now());
            let mut kicked = lock(&self.kicked);
            if !*kicked {
                kicked = match self.queue.next_deadline() {
                    Some(d) => {
                        let wait = d.saturating_duration_since(Instant::now());
                        self.cvar
                            .wait_timeout(kicked, wait)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    None => self.cvar.wait(kicked).unwrap_or_else(PoisonError::into_inner),
                };
            }
            *kicked = false;
        }
    }
}

struct Armed {
    queue: Arc<TimerQueue>,
    slot: Arc<TimerSlot>,
}

/// Future returned by [`sleep`] and [`sleep_until`].
pub struct Sleep {
    deadline: Instant,
    timer: Option<Armed>,
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("armed", &self.timer.is_some())
            .finish()
    }
}

/// Complete after `dur` has elapsed.
pub fn sleep(dur: Duration) -> Sleep {
    sleep_until(Instant::now() + dur)
}

pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        timer: None,
    }
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn arm(&self) -> Option<Armed> {
        if let Some(shared) = context::current_shared() {
            let queue = shared.timers().clone();
            let slot = queue.insert(self.deadline);
            return Some(Armed { queue, slot });
        }
        let driver = TimerThread::get()?;
        Some(Armed {
            queue: driver.queue.clone(),
            slot: driver.insert(self.deadline),
        })
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_elapsed() {
            return Poll::Ready(());
        }
        if self.timer.is_none() {
            self.timer = self.arm();
        }
        match &self.timer {
            Some(t) => {
                t.slot.waker.register(cx.waker());
                if t.slot.is_fired() || self.is_elapsed() {
                    return Poll::Ready(());
                }
            }
            // No timer thread: fall back to re-polling.
            None => cx.waker().wake_by_ref(),
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(t) = self.timer.take() {
            t.queue.cancel(&t.slot);
        }
    }
}

/// Future returned by [`timeout`].
pub struct Timeout<F> {
    future: Pin<Box<F>>,
    sleep: Sleep,
}

/// Run `future` for at most `dur`.
pub fn timeout<F: Future>(dur: Duration, future: F) -> Timeout<F> {
    Timeout {
        future: Box::pin(future),
        sleep: sleep(dur),
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(out) = self.future.as_mut().poll(cx) {
            return Poll::Ready(Ok(out));
        }
        match Pin::new(&mut self.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park::block_on;
    use crate::waker::tests::counting;

    #[test]
    fn queue_fires_in_deadline_order() {
        let q = TimerQueue::new();
        let now = Instant::now();
        let late = q.insert(now + Duration::from_secs(60));
        let early = q.insert(now);
        assert_eq!(q.next_deadline(), Some(now));

        let (hits, waker) = counting();
        early.waker.register(&waker);
        assert_eq!(q.fire_due(now), 1);
        assert!(early.is_fired());
        assert!(!late.is_fired());
        assert_eq!(hits.hits.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancelled_timers_are_skipped_and_compacted() {
        let q = TimerQueue::new();
        let now = Instant::now();
        let slots: Vec<_> = (0..100)
            .map(|i| q.insert(now + Duration::from_millis(i)))
            .collect();
        let keep = q.insert(now + Duration::from_secs(60));

        for slot in &slots {
            q.cancel(slot);
        }
        assert_eq!(q.len(), 1);
        assert!(lock(&q.heap).entries.len() < 100);
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(60)));
        assert_eq!(q.fire_due(now + Duration::from_secs(1)), 0);

        // Cancel after fire is a no-op.
        assert_eq!(q.fire_due(now + Duration::from_secs(61)), 1);
        q.cancel(&keep);
        assert!(keep.is_fired());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn dropped_sleep_releases_waker() {
        let (hits, waker) = counting();
        let mut cx = Context::from_waker(&waker);
        let mut s = sleep(Duration::from_secs(3600));
        assert!(Pin::new(&mut s).poll(&mut cx).is_pending());
        assert_eq!(Arc::strong_count(&hits), 3);
        drop(s);
        assert_eq!(Arc::strong_count(&hits), 2);
        assert_eq!(hits.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sleep_outside_runtime() {
        let start = Instant::now();
        block_on(sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn timeout_elapses() {
        let out = block_on(timeout(
            Duration::from_millis(10),
            sleep(Duration::from_secs(10)),
        ));
        assert_eq!(out, Err(Elapsed));
    }

    #[test]
    fn timeout_passes_through() {
        let out = block_on(timeout(Duration::from_secs(10), async { 7 }));
        assert_eq!(out, Ok(7));
    }
}
