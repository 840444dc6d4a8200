// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task scheduling.
//!
//! - `task`     : task state machine and its waker
//! - `processor`: per-worker next slot + bounded ring, global queue
//! - `runtime`  : main loop, spawning, work stealing, idling
//! - `handle`   : join handles
//! - `yield_now`: cooperative and time-slice yields

pub mod handle;
pub mod processor;
pub mod runtime;
pub mod task;
pub mod yield_now;

pub use handle::JoinHandle;
pub use processor::{GlobalQueue, Processor, ProcessorStats, LOCAL_QUEUE_CAPACITY};
pub use runtime::{Handle, Runtime, RuntimeStats, TaskBuilder};
pub use task::{IoWait, Stack, Task, TaskId, TaskState, DEFAULT_STACK_SIZE};
pub use yield_now::{yield_now, yield_point, Yield, TIME_SLICE};
