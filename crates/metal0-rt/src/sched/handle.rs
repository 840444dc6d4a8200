// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Join handles.
//!
//! A `JoinHandle` is how the spawner observes a task's outcome: the
//! runtime never retries a failed body, it parks the error here.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::error::TaskError;
use crate::lock;
use crate::park;

use super::task::{Task, TaskId, TaskState};

/// One-shot value cell shared between a task body and its spawner.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, value: T) {
        *lock(&self.inner) = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.inner).take()
    }
}

/// Handle to a spawned task. Await it (inside a task) or `join` it
/// (from a plain thread) to get the body's result.
///
/// Dropping the handle detaches the task; it still runs to completion.
pub struct JoinHandle {
    task: Arc<Task>,
    taken: bool,
}

impl JoinHandle {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task, taken: false }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_dead()
    }

    /// The result if the task has finished, without waiting.
    pub fn try_result(&self) -> Option<Result<(), TaskError>> {
        self.task.take_result()
    }

    /// Block the calling thread until the task finishes. The runtime
    /// must be running on some other thread.
    pub fn join(self) -> Result<(), TaskError> {
        park::block_on(self)
    }
}

impl Future for JoinHandle {
    type Output = Result<(), TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.taken {
            return Poll::Ready(Err(TaskError::ResultTaken));
        }
        if let Some(result) = self.task.take_result() {
            self.taken = true;
            return Poll::Ready(result);
        }
        self.task.register_join_waker(cx.waker());
        // Completion may have landed between the check and the register.
        match self.task.take_result() {
            Some(result) => {
                self.taken = true;
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }
}
