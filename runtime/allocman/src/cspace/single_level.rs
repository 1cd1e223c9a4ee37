//! Single-level cspace
//!
//! Manages the slots `[first_slot, end_slot)` of one CNode. Slots are handed
//! out from a free stack (most recently freed first) and, once the stack is
//! empty, from a watermark that walks the range in order. Both are O(1)
//! amortized.
//!
//! Two bitmaps back the stack. `used` records which slots are allocated.
//! `stacked` records which slots are on the free stack, so a slot that is
//! claimed with [`alloc_at`](SingleLevelCSpace::alloc_at_index) while still
//! on the stack is skipped lazily instead of searched for, and freeing it
//! again does not push a duplicate. Every free slot below the watermark is on
//! the stack.

use alloc::vec;
use alloc::vec::Vec;

use crate::allocman::Bookkeeping;
use crate::cspace::CSpace;
use crate::error::{AllocError, Result};
use crate::mspace::MChunk;
use crate::path::CSpacePath;
use crate::CPtr;

const WORD: usize = u64::BITS as usize;

/// Layout of a single-level cspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleLevelConfig {
    /// CNode the slots live in
    pub cnode: CPtr,
    /// Size of the CNode in bits
    pub cnode_size_bits: usize,
    /// Guard bits resolved together with the CNode index
    pub cnode_guard_bits: usize,
    /// First valid slot
    pub first_slot: CPtr,
    /// Last valid slot + 1
    pub end_slot: CPtr,
}

impl SingleLevelConfig {
    pub const fn len(&self) -> usize {
        self.end_slot.saturating_sub(self.first_slot)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `slot` within this CNode
    pub const fn make_path(&self, slot: CPtr) -> CSpacePath {
        CSpacePath {
            root: self.cnode,
            cap_ptr: slot,
            cap_depth: self.cnode_size_bits + self.cnode_guard_bits,
            dest: 0,
            dest_depth: 0,
            offset: slot,
        }
    }
}

/// Free-stack slot allocator over one CNode
#[derive(Debug)]
pub struct SingleLevelCSpace {
    config: SingleLevelConfig,
    used: Vec<u64>,
    stacked: Vec<u64>,
    stack: Vec<usize>,
    watermark: usize,
    allocated: usize,
    chunk: MChunk,
}

impl SingleLevelCSpace {
    /// Bookkeeping bytes charged for a cspace of `slots` slots: two bitmaps
    /// and a free stack deep enough to hold every slot
    pub const fn bookkeeping_bytes(slots: usize) -> usize {
        2 * slots.div_ceil(WORD) * core::mem::size_of::<u64>()
            + slots * core::mem::size_of::<usize>()
    }

    pub fn new(ctx: &mut dyn Bookkeeping, config: SingleLevelConfig) -> Result<Self> {
        if config.end_slot < config.first_slot {
            return Err(AllocError::InvalidArgument("end_slot precedes first_slot"));
        }
        let slots = config.len();
        let chunk = ctx.mspace_alloc(Self::bookkeeping_bytes(slots))?;
        let words = slots.div_ceil(WORD);
        Ok(Self {
            config,
            used: vec![0; words],
            stacked: vec![0; words],
            stack: Vec::with_capacity(slots),
            watermark: 0,
            allocated: 0,
            chunk,
        })
    }

    /// Release the bookkeeping memory of this cspace
    pub fn destroy(self, ctx: &mut dyn Bookkeeping) {
        ctx.mspace_free(self.chunk);
    }

    pub fn config(&self) -> &SingleLevelConfig {
        &self.config
    }

    /// Number of slots currently allocated
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn capacity(&self) -> usize {
        self.config.len()
    }

    pub fn is_full(&self) -> bool {
        self.allocated == self.capacity()
    }

    pub fn is_allocated(&self, slot: CPtr) -> bool {
        self.relative(slot).is_some_and(|i| test(&self.used, i))
    }

    fn relative(&self, slot: CPtr) -> Option<usize> {
        if slot >= self.config.first_slot && slot < self.config.end_slot {
            Some(slot - self.config.first_slot)
        } else {
            None
        }
    }

    fn claim(&mut self, i: usize) -> CPtr {
        set(&mut self.used, i);
        self.allocated += 1;
        self.config.first_slot + i
    }

    /// Hand out an unused slot index
    pub fn alloc_index(&mut self) -> Result<CPtr> {
        while let Some(i) = self.stack.pop() {
            clear(&mut self.stacked, i);
            if !test(&self.used, i) {
                return Ok(self.claim(i));
            }
        }
        while self.watermark < self.capacity() {
            let i = self.watermark;
            self.watermark += 1;
            if !test(&self.used, i) {
                return Ok(self.claim(i));
            }
        }
        Err(AllocError::OutOfSlots)
    }

    /// Mark `slot` as allocated
    pub fn alloc_at_index(&mut self, slot: CPtr) -> Result<()> {
        let i = self
            .relative(slot)
            .ok_or(AllocError::InvalidArgument("slot outside cspace range"))?;
        if test(&self.used, i) {
            return Err(AllocError::InvalidArgument("slot already allocated"));
        }
        self.claim(i);
        Ok(())
    }

    /// Return `slot` to the free pool
    pub fn free_index(&mut self, slot: CPtr) -> Result<()> {
        let i = self.relative(slot).ok_or(AllocError::InvalidFree)?;
        if !test(&self.used, i) {
            return Err(AllocError::InvalidFree);
        }
        clear(&mut self.used, i);
        self.allocated -= 1;
        // Slots above the watermark are found again by the watermark
        if i < self.watermark && !test(&self.stacked, i) {
            set(&mut self.stacked, i);
            self.stack.push(i);
        }
        Ok(())
    }
}

impl CSpace for SingleLevelCSpace {
    fn alloc(&mut self, _ctx: &mut dyn Bookkeeping) -> Result<CSpacePath> {
        let slot = self.alloc_index()?;
        Ok(self.config.make_path(slot))
    }

    fn alloc_at(&mut self, _ctx: &mut dyn Bookkeeping, slot: CPtr) -> Result<()> {
        self.alloc_at_index(slot)
    }

    fn free(&mut self, _ctx: &mut dyn Bookkeeping, slot: &CSpacePath) -> Result<()> {
        self.free_index(slot.cap_ptr)
    }

    fn make_path(&self, slot: CPtr) -> CSpacePath {
        self.config.make_path(slot)
    }
}

#[inline]
fn test(bits: &[u64], i: usize) -> bool {
    bits[i / WORD] & (1 << (i % WORD)) != 0
}

#[inline]
fn set(bits: &mut [u64], i: usize) {
    bits[i / WORD] |= 1 << (i % WORD);
}

#[inline]
fn clear(bits: &mut [u64], i: usize) {
    bits[i / WORD] &= !(1 << (i % WORD));
}
