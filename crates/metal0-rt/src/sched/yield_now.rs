// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative and time-slice yields.
//!
//! `yield_now` always gives up the processor once; the task goes to the
//! back of its worker's ring. `yield_point` is a cheap check meant to be
//! sprinkled through long loops: it only yields once the task has run
//! for `TIME_SLICE` in the current dispatch, and then the task goes to
//! the back of the global queue behind fresh work.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::context;

use super::task::YieldKind;

/// Dispatch length after which `yield_point` preempts.
pub const TIME_SLICE: Duration = Duration::from_millis(10);

/// Future returned by [`yield_now`] and [`yield_point`].
#[derive(Debug)]
#[must_use = "yields do nothing unless awaited"]
pub struct Yield {
    kind: YieldKind,
    yielded: bool,
}

/// Give other tasks a turn.
pub fn yield_now() -> Yield {
    Yield {
        kind: YieldKind::Cooperative,
        yielded: false,
    }
}

/// Yield only if the current slice is used up and preemption is on.
pub fn yield_point() -> Yield {
    let due = context::current_task().is_some_and(|task| task.slice_elapsed() >= TIME_SLICE)
        && context::with_worker(|ctx| ctx.shared.config().enable_preemption).unwrap_or(false);
    Yield {
        kind: YieldKind::Preempted,
        yielded: !due,
    }
}

impl Future for Yield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        if let Some(task) = context::current_task() {
            task.request_yield(self.kind);
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
