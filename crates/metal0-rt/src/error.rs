// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error taxonomy.
//!
//! Allocation failures propagate, capacity exhaustion is modelled as
//! `None` on the pool side, registration conflicts are errors, and task
//! body failures are stored on the task for the spawner to observe.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::sched::task::TaskState;

/// Arena and allocator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The system allocator refused a new chunk.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The arena's configured byte limit would be exceeded.
    #[error("arena limit exceeded: {requested} bytes requested, limit is {limit}")]
    LimitExceeded { requested: usize, limit: usize },

    /// Size/alignment combination cannot be represented.
    #[error("invalid allocation layout")]
    InvalidLayout,
}

/// Poller registration and wait failures.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("fd {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("fd {0} is not registered")]
    NotRegistered(RawFd),

    #[error("poller I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Select failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    /// `execute` was called on a select without any case.
    #[error("select has no cases")]
    NoCases,

    /// Every channel case is closed and there is no default case.
    #[error("all select channels are closed")]
    AllClosed,

    /// The deadline elapsed before any case became ready.
    #[error("select timed out")]
    Timeout,
}

/// An illegal task state transition was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal task transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// Why a task ended in `Dead` without success.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task body returned an application error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Select(#[from] SelectError),

    /// A channel the task depended on was closed.
    #[error("channel closed")]
    Closed,

    /// The task's result was already taken by an earlier join.
    #[error("task result already taken")]
    ResultTaken,

    #[error(transparent)]
    Runtime(Box<RuntimeError>),
}

impl From<RuntimeError> for TaskError {
    fn from(e: RuntimeError) -> Self {
        TaskError::Runtime(Box::new(e))
    }
}

impl TaskError {
    /// Convenience constructor for application failures.
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// Failures of the runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `run` or `block_on` was called from inside a runtime task.
    #[error("cannot start a runtime from within a runtime task")]
    Nested,

    /// `run` is already executing on another thread.
    #[error("runtime is already running")]
    AlreadyRunning,

    /// The calling thread is not inside a runtime.
    #[error("no runtime is active on this thread")]
    NoRuntime,

    #[error("failed to start worker thread: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Poll(#[from] PollError),

    /// The future passed to `block_on` failed or panicked.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// A `timeout` deadline passed before the inner future finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline elapsed")]
pub struct Elapsed;
