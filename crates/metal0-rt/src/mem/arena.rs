// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-task bump arena.
//!
//! Chunked bump allocator: allocation bumps an offset inside the current
//! chunk and grows by doubling when a chunk is exhausted. `reset` rewinds
//! every chunk in O(1) without returning memory to the system, so a
//! pooled arena reaches steady state after a few task lifetimes.
//!
//! Values placed in the arena never have their destructors run.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::{self, NonNull};
use std::slice;

use crate::error::AllocError;
use crate::sched::task::TaskId;

/// First chunk size for a fresh arena.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

const CHUNK_ALIGN: usize = 16;

/// One block of system memory.
struct Chunk {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a chunk exclusively owns its allocation; moving it between
// threads moves that ownership.
unsafe impl Send for Chunk {}

impl Chunk {
    fn new(size: usize) -> Result<Self, AllocError> {
        let layout =
            Layout::from_size_align(size.max(1), CHUNK_ALIGN).map_err(|_| AllocError::InvalidLayout)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory { requested: size })?;
        Ok(Self {
            ptr,
            size: layout.size(),
        })
    }

    /// Carve `layout` out of this chunk starting at `offset`. Returns the
    /// pointer and the new offset, or None if it does not fit.
    fn bump(&self, offset: usize, layout: Layout) -> Option<(NonNull<u8>, usize)> {
        let base = self.ptr.as_ptr() as usize;
        let align = layout.align();
        let start = base.checked_add(offset)?.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(layout.size())?;
        if end > base + self.size {
            return None;
        }
        // SAFETY: start lies within [base, base + size].
        let p = unsafe { self.ptr.as_ptr().add(start - base) };
        Some((NonNull::new(p)?, end - base))
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: allocated in `Chunk::new` with exactly this layout.
        unsafe {
            alloc::dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.size, CHUNK_ALIGN),
            );
        }
    }
}

/// Bump arena bound to one task at a time.
///
/// `Send` but not `Sync`: the arena travels with its task between
/// workers but is only ever touched by the thread running that task.
pub struct TaskArena {
    owner: Option<TaskId>,
    chunks: RefCell<Vec<Chunk>>,
    current: Cell<usize>,
    offset: Cell<usize>,
    allocated: Cell<usize>,
    chunk_size: usize,
    limit: Option<usize>,
}

impl TaskArena {
    /// Arena with the default chunk size and no limit.
    pub fn new(owner: Option<TaskId>) -> Result<Self, AllocError> {
        Self::with_options(owner, DEFAULT_CHUNK_SIZE, None)
    }

    /// `limit` caps the bytes handed out between resets.
    pub fn with_options(
        owner: Option<TaskId>,
        chunk_size: usize,
        limit: Option<usize>,
    ) -> Result<Self, AllocError> {
        let chunk_size = chunk_size.max(CHUNK_ALIGN);
        let first = Chunk::new(chunk_size)?;
        Ok(Self {
            owner,
            chunks: RefCell::new(vec![first]),
            current: Cell::new(0),
            offset: Cell::new(0),
            allocated: Cell::new(0),
            chunk_size,
            limit,
        })
    }

    /// Raw allocation interface.
    pub fn alloc_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let size = layout.size();
        if let Some(limit) = self.limit {
            if self.allocated.get().saturating_add(size) > limit {
                return Err(AllocError::LimitExceeded {
                    requested: size,
                    limit,
                });
            }
        }

        let mut chunks = self.chunks.borrow_mut();
        loop {
            let idx = self.current.get();
            if let Some(chunk) = chunks.get(idx) {
                if let Some((ptr, end)) = chunk.bump(self.offset.get(), layout) {
                    self.offset.set(end);
                    self.allocated.set(self.allocated.get() + size);
                    return Ok(ptr);
                }
                // Chunks retained across a reset are reused before growing.
                if idx + 1 < chunks.len() {
                    self.current.set(idx + 1);
                    self.offset.set(0);
                    continue;
                }
            }

            let needed = size
                .checked_add(layout.align())
                .ok_or(AllocError::InvalidLayout)?;
            let last = chunks.last().map_or(self.chunk_size, |c| c.size);
            let grow = needed.max(last.saturating_mul(2));
            chunks.push(Chunk::new(grow)?);
            self.current.set(chunks.len() - 1);
            self.offset.set(0);
        }
    }

    /// Move `value` into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> Result<&mut T, AllocError> {
        let ptr = self.alloc_layout(Layout::new::<T>())?.cast::<T>();
        // SAFETY: freshly bumped, correctly aligned, not aliased.
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T], AllocError> {
        let layout = Layout::array::<T>(src.len()).map_err(|_| AllocError::InvalidLayout)?;
        let ptr = self.alloc_layout(layout)?.cast::<T>();
        // SAFETY: destination is fresh arena memory sized for `src`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            Ok(slice::from_raw_parts_mut(ptr.as_ptr(), src.len()))
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc_str(&self, s: &str) -> Result<&mut str, AllocError> {
        let bytes = self.alloc_slice_copy(s.as_bytes())?;
        // SAFETY: copied from a valid str.
        Ok(unsafe { std::str::from_utf8_unchecked_mut(bytes) })
    }

    /// Drop every allocation, keep every chunk.
    pub fn reset(&mut self) {
        self.current.set(0);
        self.offset.set(0);
        self.allocated.set(0);
    }

    /// Bytes handed out since the last reset.
    pub fn total_allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Bytes of backing memory held.
    pub fn capacity(&self) -> usize {
        self.chunks.borrow().iter().map(|c| c.size).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.borrow().len()
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    pub(crate) fn bind(&mut self, owner: TaskId) {
        self.owner = Some(owner);
    }

    pub(crate) fn unbind(&mut self) {
        self.owner = None;
    }
}

impl fmt::Debug for TaskArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskArena")
            .field("owner", &self.owner)
            .field("allocated", &self.allocated.get())
            .field("capacity", &self.capacity())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_values_are_independent() {
        let arena = TaskArena::new(None).unwrap();
        let a = arena.alloc(1u32).unwrap();
        let b = arena.alloc(2u64).unwrap();
        *a += 10;
        *b += 20;
        assert_eq!(*a, 11);
        assert_eq!(*b, 22);
        assert_eq!(arena.total_allocated(), 12);
    }

    #[test]
    fn respects_large_alignment() {
        #[repr(align(64))]
        struct Wide(#[allow(dead_code)] u8);

        let arena = TaskArena::new(None).unwrap();
        arena.alloc(1u8).unwrap();
        let w = arena.alloc(Wide(7)).unwrap();
        assert_eq!((w as *mut Wide as usize) % 64, 0);
    }

    #[test]
    fn grows_past_first_chunk() {
        let arena = TaskArena::with_options(None, 64, None).unwrap();
        for i in 0..100u64 {
            assert_eq!(*arena.alloc(i).unwrap(), i);
        }
        assert!(arena.chunk_count() > 1);
        assert_eq!(arena.total_allocated(), 800);
    }

    #[test]
    fn oversized_allocation_gets_own_chunk() {
        let arena = TaskArena::with_options(None, 64, None).unwrap();
        let big = arena.alloc_slice_copy(&[7u8; 1000]).unwrap();
        assert_eq!(big.len(), 1000);
        assert!(big.iter().all(|&b| b == 7));
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut arena = TaskArena::with_options(None, 64, None).unwrap();
        for i in 0..50u64 {
            arena.alloc(i).unwrap();
        }
        let cap = arena.capacity();
        let chunks = arena.chunk_count();
        arena.reset();
        assert_eq!(arena.total_allocated(), 0);
        assert_eq!(arena.capacity(), cap);

        // Refilling reuses the retained chunks instead of growing.
        for i in 0..50u64 {
            arena.alloc(i).unwrap();
        }
        assert_eq!(arena.chunk_count(), chunks);
    }

    #[test]
    fn limit_is_enforced() {
        let arena = TaskArena::with_options(None, 64, Some(16)).unwrap();
        arena.alloc(0u64).unwrap();
        arena.alloc(0u64).unwrap();
        match arena.alloc(0u8) {
            Err(AllocError::LimitExceeded { requested, limit }) => {
                assert_eq!(requested, 1);
                assert_eq!(limit, 16);
            }
            other => panic!("expected LimitExceeded, got {:?}", other.map(|v| *v)),
        }
    }

    #[test]
    fn strings_round_trip() {
        let arena = TaskArena::new(None).unwrap();
        let s = arena.alloc_str("metal").unwrap();
        s.make_ascii_uppercase();
        assert_eq!(s, "METAL");
    }
}
