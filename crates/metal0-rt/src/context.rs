// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread execution context.
//!
//! A worker thread enters its runtime for the duration of its loop, and
//! the task being polled is installed around each poll. Both are
//! restored by RAII guards, so nesting (a `block_on` test harness inside
//! a worker, say) unwinds correctly.

use std::cell::RefCell;
use std::sync::Arc;

use crate::sched::runtime::Shared;
use crate::sched::task::Task;

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub shared: Arc<Shared>,
    pub index: usize,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Restores the previous worker context on drop.
pub(crate) struct EnterGuard {
    prev: Option<WorkerContext>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        WORKER.with(|w| *w.borrow_mut() = prev);
    }
}

/// Mark the calling thread as worker `index` of `shared`.
pub(crate) fn enter(shared: Arc<Shared>, index: usize) -> EnterGuard {
    let prev = WORKER.with(|w| w.borrow_mut().replace(WorkerContext { shared, index }));
    EnterGuard { prev }
}

pub(crate) fn with_worker<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    WORKER.with(|w| w.borrow().as_ref().map(f))
}

/// Worker index if the calling thread is running `shared`.
pub(crate) fn worker_index_for(shared: &Shared) -> Option<usize> {
    with_worker(|ctx| std::ptr::eq(Arc::as_ptr(&ctx.shared), shared).then_some(ctx.index))
        .flatten()
}

pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    with_worker(|ctx| ctx.shared.clone())
}

/// Restores the previously running task on drop.
pub(crate) struct TaskGuard {
    prev: Option<Arc<Task>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|t| *t.borrow_mut() = prev);
    }
}

pub(crate) fn set_current_task(task: Arc<Task>) -> TaskGuard {
    let prev = CURRENT_TASK.with(|t| t.borrow_mut().replace(task));
    TaskGuard { prev }
}

pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|t| t.borrow().clone())
}

/// True while the calling thread is a runtime worker.
pub fn in_runtime() -> bool {
    WORKER.with(|w| w.borrow().is_some())
}

/// Index of the processor driven by the calling thread.
pub fn current_worker() -> Option<usize> {
    with_worker(|ctx| ctx.index)
}
