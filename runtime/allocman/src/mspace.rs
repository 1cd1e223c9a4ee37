//! Bootstrap bookkeeping memory
//!
//! Every node the cspace and utspace allocators create to track their own
//! state is charged against an [`MSpace`]. The default [`FixedPool`] is a
//! fixed byte budget that is carved sequentially and never grows; freed
//! chunks are kept on exact-size free lists and only a later request of the
//! same size can reuse them.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{AllocError, Result};

/// Alignment of every chunk handed out by a [`FixedPool`]
pub const CHUNK_ALIGN: usize = core::mem::size_of::<usize>();

/// A region of bookkeeping memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MChunk {
    /// Byte offset of the chunk inside its pool
    pub offset: usize,
    /// Size the chunk was allocated with
    pub size: usize,
}

/// Allocator for the allocators' own bookkeeping
pub trait MSpace {
    fn alloc(&mut self, bytes: usize) -> Result<MChunk>;
    /// Return a chunk. Chunks this space never handed out, or already
    /// returned, are rejected with [`AllocError::InvalidFree`].
    fn free(&mut self, chunk: MChunk) -> Result<()>;
}

/// Fixed-capacity bump pool with exact-size reuse
#[derive(Debug)]
pub struct FixedPool {
    capacity: usize,
    cursor: usize,
    in_use: usize,
    free_lists: BTreeMap<usize, Vec<usize>>,
}

impl FixedPool {
    /// Create a pool with `capacity` bytes of budget
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cursor: 0,
            in_use: 0,
            free_lists: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes never carved from the pool
    pub fn untouched(&self) -> usize {
        self.capacity - self.cursor
    }

    fn round(bytes: usize) -> usize {
        bytes.div_ceil(CHUNK_ALIGN).max(1) * CHUNK_ALIGN
    }
}

impl MSpace for FixedPool {
    fn alloc(&mut self, bytes: usize) -> Result<MChunk> {
        let size = Self::round(bytes);

        if let Some(offset) = self.free_lists.get_mut(&size).and_then(Vec::pop) {
            self.in_use += size;
            return Ok(MChunk { offset, size });
        }

        if self.capacity - self.cursor < size {
            return Err(AllocError::BookkeepingExhausted { bytes });
        }
        let offset = self.cursor;
        self.cursor += size;
        self.in_use += size;
        Ok(MChunk { offset, size })
    }

    fn free(&mut self, chunk: MChunk) -> Result<()> {
        if chunk.size != Self::round(chunk.size)
            || chunk.offset % CHUNK_ALIGN != 0
            || chunk.offset.checked_add(chunk.size).map_or(true, |end| end > self.cursor)
        {
            return Err(AllocError::InvalidFree);
        }
        let list = self.free_lists.entry(chunk.size).or_default();
        if list.contains(&chunk.offset) {
            return Err(AllocError::InvalidFree);
        }
        self.in_use = self.in_use.checked_sub(chunk.size).ok_or(AllocError::InvalidFree)?;
        list.push(chunk.offset);
        Ok(())
    }
}
