//! Capability slot allocators
//!
//! A cspace allocator hands out empty slots of a capability table. Slots are
//! identified by their index (a [`CPtr`]) and resolved into a
//! [`CSpacePath`] for invocations. Freeing a slot assumes its capability has
//! already been deleted.

pub mod single_level;
pub mod two_level;

use crate::allocman::Bookkeeping;
use crate::error::Result;
use crate::path::CSpacePath;
use crate::CPtr;

pub use single_level::{SingleLevelCSpace, SingleLevelConfig};
pub use two_level::{TwoLevelCSpace, TwoLevelConfig};

/// Interface every capability slot allocator provides to an
/// [`AllocMan`](crate::AllocMan)
pub trait CSpace {
    /// Hand out an unused slot
    fn alloc(&mut self, ctx: &mut dyn Bookkeeping) -> Result<CSpacePath>;

    /// Mark a specific slot as used, typically one the kernel populated at boot
    fn alloc_at(&mut self, ctx: &mut dyn Bookkeeping, slot: CPtr) -> Result<()>;

    /// Return a slot; its capability must already have been deleted
    fn free(&mut self, ctx: &mut dyn Bookkeeping, slot: &CSpacePath) -> Result<()>;

    /// Resolve a slot index into a path. Pure.
    fn make_path(&self, slot: CPtr) -> CSpacePath;
}
