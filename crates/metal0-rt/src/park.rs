// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Drive a future on the calling OS thread.
//!
//! Used by the `*_blocking` channel and select entry points and by
//! `JoinHandle::join`. Between polls the thread backs off: a short spin,
//! then `yield_now`, then `park_timeout` capped at 1ms.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use crate::waker::ThreadWaker;

const SPIN_ROUNDS: u32 = 16;
const YIELD_ROUNDS: u32 = 32;
const MAX_PARK: Duration = Duration::from_millis(1);

/// Block until `fut` completes.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    let parker = ThreadWaker::current();
    let waker = Waker::from(parker.clone());
    let mut cx = Context::from_waker(&waker);
    let mut round = 0u32;
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
        backoff(&parker, &mut round, None);
    }
}

/// Block until `fut` completes or `deadline` passes. `None` on timeout;
/// the future is dropped in that case.
pub fn block_on_until<F: Future>(fut: F, deadline: Instant) -> Option<F::Output> {
    let mut fut = pin!(fut);
    let parker = ThreadWaker::current();
    let waker = Waker::from(parker.clone());
    let mut cx = Context::from_waker(&waker);
    let mut round = 0u32;
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return Some(out);
        }
        if Instant::now() >= deadline {
            return None;
        }
        backoff(&parker, &mut round, Some(deadline));
    }
}

fn backoff(parker: &Arc<ThreadWaker>, round: &mut u32, deadline: Option<Instant>) {
    if parker.take_notified() {
        *round = 0;
        return;
    }
    *round = round.saturating_add(1);
    if *round <= SPIN_ROUNDS {
        std::hint::spin_loop();
    } else if *round <= YIELD_ROUNDS {
        thread::yield_now();
    } else {
        let mut wait = MAX_PARK;
        if let Some(d) = deadline {
            wait = wait.min(d.saturating_duration_since(Instant::now()));
        }
        thread::park_timeout(wait);
    }
}
