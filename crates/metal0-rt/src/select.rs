// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way select over channel operations.
//!
//! Cases are evaluated in the order they were added and the first one
//! that can complete without waiting wins, so when several are ready the
//! lowest index is chosen. A default case is taken only after a full scan
//! found nothing ready, and a select with a default never waits.
//!
//! When nothing is ready the select registers on every case's channel,
//! rescans to close the race with a concurrent send/recv, and parks. On
//! completion every registration except the winning one is withdrawn, with
//! consumed wakes forwarded to the next waiter.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::channel::{Receiver, Sender, Side, TryRecvError, TrySendError};
use crate::error::SelectError;
use crate::park;
use crate::time;
use crate::waker::WaitKey;

/// Outcome of one non-blocking attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Done,
    WouldBlock,
    Closed,
}

/// A channel operation a select can try, wait on and abandon.
trait SelectOp: Send {
    fn attempt(&mut self) -> Attempt;
    fn park(&mut self, waker: &Waker);
    fn unpark(&mut self, forward: bool);
}

struct RecvCase<'a, T> {
    rx: &'a Receiver<T>,
    slot: &'a mut Option<T>,
    key: Option<WaitKey>,
}

impl<T: Send> SelectOp for RecvCase<'_, T> {
    fn attempt(&mut self) -> Attempt {
        match self.rx.chan.try_recv() {
            Ok(v) => {
                *self.slot = Some(v);
                Attempt::Done
            }
            Err(TryRecvError::Empty) => Attempt::WouldBlock,
            Err(TryRecvError::Closed) => Attempt::Closed,
        }
    }

    fn park(&mut self, waker: &Waker) {
        self.rx.chan.park(Side::Recv, &mut self.key, waker);
    }

    fn unpark(&mut self, forward: bool) {
        self.rx.chan.unpark(Side::Recv, &mut self.key, forward);
    }
}

struct SendCase<'a, T> {
    tx: &'a Sender<T>,
    value: Option<T>,
    key: Option<WaitKey>,
}

impl<T: Send> SelectOp for SendCase<'_, T> {
    fn attempt(&mut self) -> Attempt {
        let Some(value) = self.value.take() else {
            return Attempt::Closed;
        };
        match self.tx.chan.try_send(value) {
            Ok(()) => Attempt::Done,
            Err(TrySendError::Full(v)) => {
                self.value = Some(v);
                Attempt::WouldBlock
            }
            Err(TrySendError::Closed(v)) => {
                self.value = Some(v);
                Attempt::Closed
            }
        }
    }

    fn park(&mut self, waker: &Waker) {
        self.tx.chan.park(Side::Send, &mut self.key, waker);
    }

    fn unpark(&mut self, forward: bool) {
        self.tx.chan.unpark(Side::Send, &mut self.key, forward);
    }
}

enum Case<'a> {
    Op(Box<dyn SelectOp + 'a>),
    Default,
}

/// An ordered set of cases resolved to exactly one index.
///
/// ```no_run
/// # use metal0_rt::{channel, Select};
/// let (tx, rx) = channel::bounded::<u32>(1);
/// let mut got = None;
/// let mut sel = Select::new();
/// let r = sel.recv(&rx, &mut got);
/// let d = sel.default_case();
/// let picked = sel.try_execute().unwrap();
/// assert_eq!(picked, Some(d));
/// # drop((tx, r));
/// ```
#[derive(Default)]
pub struct Select<'a> {
    cases: Vec<Case<'a>>,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive into `slot`. Returns the case index.
    pub fn recv<T: Send + 'a>(&mut self, rx: &'a Receiver<T>, slot: &'a mut Option<T>) -> usize {
        self.push(Case::Op(Box::new(RecvCase { rx, slot, key: None })))
    }

    /// Send `value`. If another case wins the value is dropped with the
    /// select. Returns the case index.
    pub fn send<T: Send + 'a>(&mut self, tx: &'a Sender<T>, value: T) -> usize {
        self.push(Case::Op(Box::new(SendCase {
            tx,
            value: Some(value),
            key: None,
        })))
    }

    /// Taken when no other case is ready. Returns the case index.
    pub fn default_case(&mut self) -> usize {
        self.push(Case::Default)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    fn push(&mut self, case: Case<'a>) -> usize {
        self.cases.push(case);
        self.cases.len() - 1
    }

    /// One pass in index order. `Ok(None)` means "nothing ready, wait".
    fn scan(&mut self) -> Result<Option<usize>, SelectError> {
        if self.cases.is_empty() {
            return Err(SelectError::NoCases);
        }
        let mut default = None;
        let mut open = 0usize;
        for (i, case) in self.cases.iter_mut().enumerate() {
            match case {
                Case::Default => {
                    default.get_or_insert(i);
                }
                Case::Op(op) => match op.attempt() {
                    Attempt::Done => return Ok(Some(i)),
                    Attempt::WouldBlock => open += 1,
                    Attempt::Closed => {}
                },
            }
        }
        if default.is_some() {
            return Ok(default);
        }
        if open == 0 {
            return Err(SelectError::AllClosed);
        }
        Ok(None)
    }

    fn park_all(&mut self, waker: &Waker) {
        for case in &mut self.cases {
            if let Case::Op(op) = case {
                op.park(waker);
            }
        }
    }

    fn unpark_all(&mut self, selected: Option<usize>) {
        for (i, case) in self.cases.iter_mut().enumerate() {
            if let Case::Op(op) = case {
                op.unpark(Some(i) != selected);
            }
        }
    }

    /// Single scan. `Ok(None)` if nothing is ready and there is no default.
    pub fn try_execute(&mut self) -> Result<Option<usize>, SelectError> {
        self.scan()
    }

    /// Wait until a case completes.
    pub fn execute(&mut self) -> SelectFuture<'_, 'a> {
        SelectFuture {
            select: self,
            parked: false,
        }
    }

    /// Like `execute`, failing with `SelectError::Timeout` after `dur`.
    pub async fn execute_timeout(&mut self, dur: Duration) -> Result<usize, SelectError> {
        match time::timeout(dur, self.execute()).await {
            Ok(res) => res,
            Err(_) => Err(SelectError::Timeout),
        }
    }

    /// Block the calling thread until a case completes.
    pub fn execute_blocking(&mut self) -> Result<usize, SelectError> {
        park::block_on(self.execute())
    }

    /// Block the calling thread until a case completes or `deadline`.
    pub fn execute_timeout_blocking(&mut self, deadline: Instant) -> Result<usize, SelectError> {
        park::block_on_until(self.execute(), deadline).unwrap_or(Err(SelectError::Timeout))
    }
}

/// Future returned by [`Select::execute`].
#[must_use = "futures do nothing unless awaited"]
pub struct SelectFuture<'s, 'a> {
    select: &'s mut Select<'a>,
    parked: bool,
}

impl SelectFuture<'_, '_> {
    fn finish(&mut self, res: Result<Option<usize>, SelectError>) -> Poll<Result<usize, SelectError>> {
        let res = match res {
            Ok(Some(i)) => Ok(i),
            Ok(None) => return Poll::Pending,
            Err(e) => Err(e),
        };
        if self.parked {
            self.select.unpark_all(res.ok());
            self.parked = false;
        }
        Poll::Ready(res)
    }
}

impl Future for SelectFuture<'_, '_> {
    type Output = Result<usize, SelectError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let first = this.select.scan();
        if !matches!(first, Ok(None)) {
            return this.finish(first);
        }
        this.select.park_all(cx.waker());
        this.parked = true;
        let second = this.select.scan();
        this.finish(second)
    }
}

impl Drop for SelectFuture<'_, '_> {
    fn drop(&mut self) {
        if self.parked {
            self.select.unpark_all(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bounded, unbounded};
    use crate::config::RuntimeConfig;
    use crate::sched::runtime::Runtime;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn default_only_returns_immediately() {
        let mut sel = Select::new();
        let d = sel.default_case();
        let start = Instant::now();
        assert_eq!(sel.execute_blocking(), Ok(d));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn default_taken_when_channels_empty() {
        let (_tx, rx) = bounded::<u8>(1);
        let mut slot = None;
        let mut sel = Select::new();
        sel.recv(&rx, &mut slot);
        let d = sel.default_case();
        assert_eq!(sel.try_execute(), Ok(Some(d)));
    }

    #[test]
    fn lowest_ready_index_wins() {
        let (tx0, rx0) = unbounded();
        let (_tx1, rx1) = unbounded::<i32>();
        let (tx2, rx2) = unbounded();
        tx0.try_send(10).unwrap();
        tx2.try_send(30).unwrap();

        let (mut s0, mut s1, mut s2) = (None, None, None);
        let mut sel = Select::new();
        sel.recv(&rx0, &mut s0);
        sel.recv(&rx1, &mut s1);
        sel.recv(&rx2, &mut s2);
        assert_eq!(sel.execute_blocking(), Ok(0));
        drop(sel);
        assert_eq!(s0, Some(10));
        assert_eq!(s2, None);
        assert_eq!(rx2.len(), 1);
    }

    #[test]
    fn send_case_completes_when_room() {
        let (tx, rx) = bounded(1);
        let (_otx, orx) = bounded::<u8>(1);
        let mut slot = None;
        let mut sel = Select::new();
        sel.recv(&orx, &mut slot);
        let s = sel.send(&tx, 5u8);
        assert_eq!(sel.execute_blocking(), Ok(s));
        assert_eq!(rx.try_recv(), Ok(5));
    }

    #[test]
    fn no_cases_and_all_closed() {
        let mut empty = Select::new();
        assert_eq!(empty.try_execute(), Err(SelectError::NoCases));

        let (tx, rx) = bounded::<u8>(1);
        drop(tx);
        let mut slot = None;
        let mut sel = Select::new();
        sel.recv(&rx, &mut slot);
        assert_eq!(sel.execute_blocking(), Err(SelectError::AllClosed));
    }

    #[test]
    fn closed_case_is_skipped() {
        let (dead_tx, dead_rx) = bounded::<u8>(1);
        drop(dead_tx);
        let (tx, rx) = bounded(1);
        tx.try_send(7u8).unwrap();
        let (mut a, mut b) = (None, None);
        let mut sel = Select::new();
        sel.recv(&dead_rx, &mut a);
        sel.recv(&rx, &mut b);
        assert_eq!(sel.execute_blocking(), Ok(1));
    }

    #[test]
    fn blocking_timeout() {
        let (_tx, rx) = bounded::<u8>(1);
        let mut slot = None;
        let mut sel = Select::new();
        sel.recv(&rx, &mut slot);
        let start = Instant::now();
        let res = sel.execute_timeout_blocking(start + Duration::from_millis(20));
        assert_eq!(res, Err(SelectError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
        drop(sel);
        // No registration left behind.
        assert_eq!(rx.chan.waiting(Side::Recv), 0);
    }

    #[test]
    fn wakes_on_late_sender() {
        let (tx, rx) = bounded(1);
        let (_tx2, rx2) = bounded::<u32>(1);
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send_blocking(42u32).unwrap();
        });
        let (mut a, mut b) = (None, None);
        let mut sel = Select::new();
        sel.recv(&rx2, &mut a);
        sel.recv(&rx, &mut b);
        assert_eq!(sel.execute_blocking(), Ok(1));
        drop(sel);
        assert_eq!(b, Some(42));
        sender.join().unwrap();
    }

    #[test]
    fn async_timeout_inside_runtime() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let out = Arc::new(Mutex::new(None));
        let o = out.clone();
        rt.spawn(async move {
            let (_tx, rx) = bounded::<u8>(1);
            let mut slot = None;
            let mut sel = Select::new();
            sel.recv(&rx, &mut slot);
            *o.lock().unwrap() = Some(sel.execute_timeout(Duration::from_millis(15)).await);
            Ok(())
        });
        rt.run().unwrap();
        assert_eq!(*out.lock().unwrap(), Some(Err(SelectError::Timeout)));
    }
}
