//! Tunables for the reserve pool and the colour allocator

use crate::object::{ObjectType, PAGE_BITS};

/// Default number of slots freed while the cspace is busy that can be queued
pub const DEFAULT_MAX_FREED_SLOTS: usize = 10;

/// Default number of untyped objects freed while the utspace is busy that
/// can be queued
pub const DEFAULT_MAX_FREED_UNTYPED_CHUNKS: usize = 10;

/// Default number of empty slots held in reserve
pub const DEFAULT_CSPACE_SLOTS: usize = 30;

/// Default split-node reserve kept for colour domains
pub const DEFAULT_COLOR_MSPACE_RESERVES: usize = 20;

/// Sizes of the queues and slot pool an [`AllocMan`](crate::AllocMan) keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveConfig {
    pub max_freed_slots: usize,
    pub max_freed_untyped_chunks: usize,
    pub cspace_slots: usize,
}

impl ReserveConfig {
    pub const fn new() -> Self {
        Self {
            max_freed_slots: DEFAULT_MAX_FREED_SLOTS,
            max_freed_untyped_chunks: DEFAULT_MAX_FREED_UNTYPED_CHUNKS,
            cspace_slots: DEFAULT_CSPACE_SLOTS,
        }
    }
}

impl Default for ReserveConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep `count` bookkeeping chunks of exactly `size` bytes in reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MspaceReserve {
    pub size: usize,
    pub count: usize,
}

/// Keep `count` pre-created objects of one type and footprint in reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtspaceReserve {
    pub size_bits: usize,
    pub object_type: ObjectType,
    pub count: usize,
}

/// Cache colouring parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorConfig {
    /// Number of cache colours, a power of two
    pub num_colors: usize,
    /// Size of the pages the colouring stride is made of
    pub page_bits: usize,
    /// Split nodes kept in the root allocator's reserve
    pub mspace_reserves: usize,
}

impl ColorConfig {
    pub const fn new(num_colors: usize) -> Self {
        Self {
            num_colors,
            page_bits: PAGE_BITS,
            mspace_reserves: DEFAULT_COLOR_MSPACE_RESERVES,
        }
    }

    /// Size of one refill block: one page of every colour
    pub const fn block_bits(&self) -> usize {
        self.page_bits + self.num_colors.trailing_zeros() as usize
    }

    /// Colour of the page at physical address `paddr`
    pub const fn color_of(&self, paddr: usize) -> usize {
        (paddr >> self.page_bits) & (self.num_colors - 1)
    }
}
