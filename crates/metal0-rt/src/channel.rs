// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-producer multi-consumer channels.
//!
//! A mutex-guarded ring buffer plus two FIFO waiter queues, one for
//! receivers waiting on data and one for senders waiting on room. Every
//! successful operation wakes one waiter on the opposite side; closing a
//! side wakes every waiter on the other.
//!
//! Each blocked operation holds a keyed registration. A waiter that was
//! woken but gives up without acting (dropped future, select picking a
//! different case) passes the wake on to the next waiter so it is not
//! lost.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::lock;
use crate::park;
use crate::waker::{WaitKey, WakerQueue};

// ---- errors ------------------------------------------------------------

/// Every receiver is gone. The value is handed back.
#[derive(PartialEq, Eq)]
pub enum SendError<T> {
    Closed(T),
}

/// Every sender is gone and the buffer is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Closed,
}

#[derive(PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Buffer is full.
    Full(T),
    /// Every receiver is gone.
    Closed(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No message available right now.
    Empty,
    /// Every sender is gone and the buffer is drained.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(v) => v,
        }
    }
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError::Closed(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("TrySendError::Full(..)"),
            TrySendError::Closed(_) => f.write_str("TrySendError::Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("sending on a full channel"),
            TrySendError::Closed(_) => f.write_str("sending on a closed channel"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("receiving on a closed channel")
    }
}

impl std::error::Error for RecvError {}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => f.write_str("receiving on an empty channel"),
            TryRecvError::Closed => f.write_str("receiving on a closed channel"),
        }
    }
}

impl std::error::Error for TryRecvError {}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout => f.write_str("timed out waiting on channel"),
            RecvTimeoutError::Closed => f.write_str("receiving on a closed channel"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

impl From<RecvError> for crate::error::TaskError {
    fn from(_: RecvError) -> Self {
        crate::error::TaskError::Closed
    }
}

impl<T> From<SendError<T>> for crate::error::TaskError {
    fn from(_: SendError<T>) -> Self {
        crate::error::TaskError::Closed
    }
}

// ---- shared state ------------------------------------------------------

struct State<T> {
    buf: VecDeque<T>,
    cap: Option<usize>,
    senders: usize,
    receivers: usize,
}

impl<T> State<T> {
    fn is_full(&self) -> bool {
        self.cap.is_some_and(|cap| self.buf.len() >= cap)
    }
}

pub(crate) struct Chan<T> {
    state: Mutex<State<T>>,
    /// Receivers waiting for a message.
    recv_waiters: WakerQueue,
    /// Senders waiting for room.
    send_waiters: WakerQueue,
}

/// Which waiter queue an operation parks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Send,
    Recv,
}

impl<T> Chan<T> {
    fn new(cap: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State {
                buf: VecDeque::new(),
                cap,
                senders: 1,
                receivers: 1,
            }),
            recv_waiters: WakerQueue::new(),
            send_waiters: WakerQueue::new(),
        }
    }

    fn waiters(&self, side: Side) -> &WakerQueue {
        match side {
            Side::Send => &self.send_waiters,
            Side::Recv => &self.recv_waiters,
        }
    }

    pub(crate) fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        {
            let mut st = lock(&self.state);
            if st.receivers == 0 {
                return Err(TrySendError::Closed(value));
            }
            if st.is_full() {
                return Err(TrySendError::Full(value));
            }
            st.buf.push_back(value);
        }
        self.recv_waiters.wake_one();
        Ok(())
    }

    pub(crate) fn try_recv(&self) -> Result<T, TryRecvError> {
        let value = {
            let mut st = lock(&self.state);
            match st.buf.pop_front() {
                Some(v) => v,
                None if st.senders == 0 => return Err(TryRecvError::Closed),
                None => return Err(TryRecvError::Empty),
            }
        };
        self.send_waiters.wake_one();
        Ok(value)
    }

    /// Register or refresh a waiter on `side`.
    pub(crate) fn park(&self, side: Side, key: &mut Option<WaitKey>, waker: &Waker) {
        let queue = self.waiters(side);
        match *key {
            Some(k) if queue.update(k, waker) => {}
            _ => *key = Some(queue.register(waker)),
        }
    }

    pub(crate) fn waiting(&self, side: Side) -> usize {
        self.waiters(side).len()
    }

    /// Withdraw a registration. If it was already consumed by a wake and
    /// `forward` is set, hand that wake to the next waiter.
    pub(crate) fn unpark(&self, side: Side, key: &mut Option<WaitKey>, forward: bool) {
        if let Some(k) = key.take() {
            let queue = self.waiters(side);
            if !queue.remove(k) && forward {
                queue.wake_one();
            }
        }
    }
}

// ---- constructors -------------------------------------------------------

/// Channel holding at most `cap` messages. A capacity of 0 is raised to 1.
pub fn bounded<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Chan::new(Some(cap.max(1))));
    (
        Sender { chan: chan.clone() },
        Receiver { chan },
    )
}

/// Channel with an unlimited buffer; `send` never waits.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Chan::new(None));
    (
        Sender { chan: chan.clone() },
        Receiver { chan },
    )
}

// ---- sender ------------------------------------------------------------

/// Sending half. Cloneable; the channel closes for receivers when the
/// last clone is dropped.
pub struct Sender<T> {
    pub(crate) chan: Arc<Chan<T>>,
}

impl<T> Sender<T> {
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(value)
    }

    /// Wait for room, then enqueue.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            chan: &self.chan,
            value: Some(value),
            key: None,
        }
    }

    /// Block the calling thread until there is room.
    pub fn send_blocking(&self, value: T) -> Result<(), SendError<T>> {
        park::block_on(self.send(value))
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.chan.state).receivers == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        lock(&self.chan.state).cap
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        lock(&self.chan.state).senders += 1;
        Sender {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut st = lock(&self.chan.state);
            st.senders -= 1;
            st.senders == 0
        };
        if last {
            self.chan.recv_waiters.wake_all();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// Future returned by [`Sender::send`].
#[must_use = "futures do nothing unless awaited"]
pub struct SendFuture<'a, T> {
    chan: &'a Chan<T>,
    value: Option<T>,
    key: Option<WaitKey>,
}

// The value is moved out by `try_send`, never pinned in place.
impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(value) = this.value.take() else {
            return Poll::Ready(Ok(()));
        };
        let value = match this.chan.try_send(value) {
            Ok(()) => {
                this.chan.unpark(Side::Send, &mut this.key, false);
                return Poll::Ready(Ok(()));
            }
            Err(TrySendError::Closed(v)) => {
                this.chan.unpark(Side::Send, &mut this.key, true);
                return Poll::Ready(Err(SendError::Closed(v)));
            }
            Err(TrySendError::Full(v)) => v,
        };

        this.chan.park(Side::Send, &mut this.key, cx.waker());
        // Room may have opened between the attempt and the registration.
        match this.chan.try_send(value) {
            Ok(()) => {
                this.chan.unpark(Side::Send, &mut this.key, true);
                Poll::Ready(Ok(()))
            }
            Err(TrySendError::Closed(v)) => {
                this.chan.unpark(Side::Send, &mut this.key, true);
                Poll::Ready(Err(SendError::Closed(v)))
            }
            Err(TrySendError::Full(v)) => {
                this.value = Some(v);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        self.chan.unpark(Side::Send, &mut self.key, true);
    }
}

// ---- receiver ----------------------------------------------------------

/// Receiving half. Cloneable; the channel closes for senders when the
/// last clone is dropped.
pub struct Receiver<T> {
    pub(crate) chan: Arc<Chan<T>>,
}

impl<T> Receiver<T> {
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_recv()
    }

    /// Wait for a message.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            chan: &self.chan,
            key: None,
        }
    }

    /// Block the calling thread until a message arrives.
    pub fn recv_blocking(&self) -> Result<T, RecvError> {
        park::block_on(self.recv())
    }

    /// Block the calling thread for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        match park::block_on_until(self.recv(), Instant::now() + timeout) {
            Some(Ok(v)) => Ok(v),
            Some(Err(RecvError::Closed)) => Err(RecvTimeoutError::Closed),
            None => Err(RecvTimeoutError::Timeout),
        }
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        lock(&self.chan.state).buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once every sender is gone and the buffer is drained.
    pub fn is_closed(&self) -> bool {
        let st = lock(&self.chan.state);
        st.senders == 0 && st.buf.is_empty()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        lock(&self.chan.state).receivers += 1;
        Receiver {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut st = lock(&self.chan.state);
            st.receivers -= 1;
            st.receivers == 0
        };
        if last {
            self.chan.send_waiters.wake_all();
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

/// Future returned by [`Receiver::recv`].
#[must_use = "futures do nothing unless awaited"]
pub struct RecvFuture<'a, T> {
    chan: &'a Chan<T>,
    key: Option<WaitKey>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match this.chan.try_recv() {
            Ok(v) => {
                this.chan.unpark(Side::Recv, &mut this.key, false);
                return Poll::Ready(Ok(v));
            }
            Err(TryRecvError::Closed) => {
                this.chan.unpark(Side::Recv, &mut this.key, true);
                return Poll::Ready(Err(RecvError::Closed));
            }
            Err(TryRecvError::Empty) => {}
        }

        this.chan.park(Side::Recv, &mut this.key, cx.waker());
        match this.chan.try_recv() {
            Ok(v) => {
                this.chan.unpark(Side::Recv, &mut this.key, true);
                Poll::Ready(Ok(v))
            }
            Err(TryRecvError::Closed) => {
                this.chan.unpark(Side::Recv, &mut this.key, true);
                Poll::Ready(Err(RecvError::Closed))
            }
            Err(TryRecvError::Empty) => Poll::Pending,
        }
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        self.chan.unpark(Side::Recv, &mut self.key, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::sched::runtime::Runtime;
    use crate::waker::tests::counting;
    use std::sync::atomic::Ordering;
    use std::thread;

    #[test]
    fn bounded_send_recv() {
        let (tx, rx) = bounded(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert!(tx.try_send(3).unwrap_err().is_full());
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.len(), 1);
        assert_eq!(tx.capacity(), Some(2));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (tx, rx) = bounded(0);
        tx.try_send('x').unwrap();
        assert!(tx.try_send('y').is_err());
        assert_eq!(rx.try_recv(), Ok('x'));
    }

    #[test]
    fn closed_after_drain() {
        let (tx, rx) = unbounded();
        tx.try_send(5).unwrap();
        drop(tx);
        assert!(!rx.is_closed());
        assert_eq!(rx.try_recv(), Ok(5));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(rx.recv_blocking(), Err(RecvError::Closed));
    }

    #[test]
    fn send_to_dropped_receiver_returns_value() {
        let (tx, rx) = bounded(1);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send_blocking(9).unwrap_err().into_inner(), 9);
    }

    #[test]
    fn recv_timeout_expires() {
        let (_tx, rx) = bounded::<u8>(1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn blocking_across_threads() {
        let (tx, rx) = bounded(1);
        let producer = thread::spawn(move || {
            for i in 0..100 {
                tx.send_blocking(i).unwrap();
            }
        });
        let got: Vec<i32> = (0..100).map(|_| rx.recv_blocking().unwrap()).collect();
        producer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn abandoned_wake_is_forwarded() {
        let (tx, rx) = unbounded::<u8>();
        let (first, w1) = counting();
        let (second, w2) = counting();

        let mut a = Box::pin(rx.recv());
        let mut b = Box::pin(rx.recv());
        assert!(a.as_mut().poll(&mut Context::from_waker(&w1)).is_pending());
        assert!(b.as_mut().poll(&mut Context::from_waker(&w2)).is_pending());

        tx.try_send(1).unwrap();
        assert_eq!(first.hits.load(Ordering::SeqCst), 1);
        assert_eq!(second.hits.load(Ordering::SeqCst), 0);

        // `a` was woken but never collects; its wake moves on to `b`.
        drop(a);
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            b.as_mut().poll(&mut Context::from_waker(&w2)),
            Poll::Ready(Ok(1))
        ));
    }

    #[test]
    fn ping_pong_between_tasks() {
        let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
        let (ping_tx, ping_rx) = bounded::<u32>(1);
        let (pong_tx, pong_rx) = bounded::<u32>(1);

        rt.spawn(async move {
            while let Ok(n) = ping_rx.recv().await {
                pong_tx.send(n + 1).await?;
            }
            Ok(())
        });
        let total = Arc::new(Mutex::new(0));
        let t = total.clone();
        rt.spawn(async move {
            let mut n = 0;
            for _ in 0..50 {
                ping_tx.send(n).await?;
                n = pong_rx.recv().await?;
            }
            *t.lock().unwrap() = n;
            Ok(())
        });

        rt.run().unwrap();
        assert_eq!(*total.lock().unwrap(), 50);
        assert_eq!(rt.stats().total_failed, 0);
    }
}
