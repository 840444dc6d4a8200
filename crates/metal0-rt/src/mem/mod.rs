// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task-scoped memory.
//!
//! - `arena`: bump allocator reset in O(1) between tasks
//! - `pool` : `ArenaPool` plus generic fixed/overflowing object pools
//! - `local`: one allocator per worker thread, handed out by a registry

pub mod arena;
pub mod local;
pub mod pool;

pub use arena::TaskArena;
pub use local::{AllocatorRegistry, ThreadLocalAllocator};
pub use pool::{ArenaPool, DynamicPool, Pool, PoolStats};
