//! Bootstrap - Build an allocator from the boot description
//!
//! The kernel hands the root task:
//! - its root CNode and the range of empty slots in it
//! - a list of untyped capabilities, kernel memory and device regions alike
//!
//! [`use_current_cspace`] allocates straight from the empty range of the
//! root CNode. [`new_two_level`] uses the same range as the first level of a
//! two-level cspace, which gives `2^level_two_bits` times as many slots.

use alloc::vec::Vec;

use log::{debug, info};

use crate::allocman::AllocMan;
use crate::config::{ReserveConfig, UtspaceReserve};
use crate::cspace::{SingleLevelCSpace, SingleLevelConfig, TwoLevelCSpace, TwoLevelConfig};
use crate::error::Result;
use crate::kernel::KernelObjects;
use crate::mspace::FixedPool;
use crate::object::{ObjectType, SLOT_BITS};
use crate::path::CSpacePath;
use crate::utspace::{TrickleUtSpace, UntypedKind, UntypedRegion};
use crate::{CPtr, Word};

/// What the kernel tells the root task about its resources
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// Root CNode of the initial thread
    pub root_cnode: CPtr,

    /// Size of the root CNode as a power of 2
    pub cnode_size_bits: usize,

    /// Range of empty CSlots available for allocation
    pub empty: SlotRegion,

    /// Untyped capabilities, all of them in the root CNode
    pub untyped: Vec<UntypedDescriptor>,
}

/// CSlot region [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRegion {
    pub start: CPtr,
    pub end: CPtr,
}

impl SlotRegion {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Untyped memory descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UntypedDescriptor {
    /// Capability slot containing this untyped
    pub cap: CPtr,

    /// Physical address
    pub paddr: Word,

    /// Size as power of 2 (size = 1 << size_bits)
    pub size_bits: usize,

    /// Is this a device untyped?
    pub is_device: bool,
}

impl UntypedDescriptor {
    pub fn size(&self) -> usize {
        1 << self.size_bits
    }

    pub fn end_paddr(&self) -> Word {
        self.paddr + self.size()
    }
}

impl BootInfo {
    /// Path of a slot in the root CNode
    pub fn root_path(&self, slot: CPtr) -> CSpacePath {
        SingleLevelConfig {
            cnode: self.root_cnode,
            cnode_size_bits: self.cnode_size_bits,
            cnode_guard_bits: 0,
            first_slot: self.empty.start,
            end_slot: self.empty.end,
        }
        .make_path(slot)
    }

    /// Find untyped region containing physical address
    pub fn find_untyped_for_paddr(&self, paddr: Word) -> Option<&UntypedDescriptor> {
        self.untyped
            .iter()
            .find(|ut| paddr >= ut.paddr && paddr < ut.end_paddr())
    }

    /// Get total amount of untyped memory
    pub fn total_untyped(&self) -> usize {
        self.untyped
            .iter()
            .filter(|ut| !ut.is_device)
            .map(UntypedDescriptor::size)
            .sum()
    }

    /// Get total amount of device untyped memory
    pub fn total_device_untyped(&self) -> usize {
        self.untyped
            .iter()
            .filter(|ut| ut.is_device)
            .map(UntypedDescriptor::size)
            .sum()
    }

    fn regions(&self, device: bool) -> Vec<UntypedRegion> {
        self.untyped
            .iter()
            .filter(|ut| ut.is_device == device)
            .map(|ut| UntypedRegion {
                path: self.root_path(ut.cap),
                size_bits: ut.size_bits,
                paddr: Some(ut.paddr),
            })
            .collect()
    }
}

/// Hand every untyped of `boot` to the allocator
pub fn add_boot_untypeds(alloc: &mut AllocMan, boot: &BootInfo) -> Result<()> {
    alloc.add_untypeds(&boot.regions(false), UntypedKind::Kernel)?;
    alloc.add_untypeds(&boot.regions(true), UntypedKind::Device)
}

fn finish(mut alloc: AllocMan, boot: &BootInfo) -> Result<AllocMan> {
    alloc.attach_utspace(TrickleUtSpace::new())?;
    add_boot_untypeds(&mut alloc, boot)?;
    alloc.configure_reserves(&ReserveConfig::default())?;
    Ok(alloc)
}

fn fill(mut alloc: AllocMan) -> AllocMan {
    if !alloc.fill_reserves() {
        info!("bootstrap: reserves not full, memory is short");
    }
    alloc
}

/// Allocator over the empty slots of the root CNode
///
/// `pool_bytes` is the budget for the allocators' own bookkeeping.
pub fn use_current_cspace(
    boot: &BootInfo,
    pool_bytes: usize,
    kernel: impl KernelObjects + 'static,
) -> Result<AllocMan> {
    let mut alloc = AllocMan::new(FixedPool::new(pool_bytes), kernel);
    let cspace = SingleLevelCSpace::new(
        &mut alloc,
        SingleLevelConfig {
            cnode: boot.root_cnode,
            cnode_size_bits: boot.cnode_size_bits,
            cnode_guard_bits: 0,
            first_slot: boot.empty.start,
            end_slot: boot.empty.end,
        },
    )?;
    alloc.attach_cspace(cspace)?;
    let alloc = finish(alloc, boot)?;
    debug!(
        "bootstrap: single-level cspace of {} slots, {} untypeds",
        boot.empty.len(),
        boot.untyped.len()
    );
    Ok(fill(alloc))
}

/// Allocator whose second-level CNodes hang off the empty slots of the
/// root CNode
pub fn new_two_level(
    boot: &BootInfo,
    level_two_bits: usize,
    pool_bytes: usize,
    kernel: impl KernelObjects + 'static,
) -> Result<AllocMan> {
    let mut alloc = AllocMan::new(FixedPool::new(pool_bytes), kernel);
    let config = TwoLevelConfig {
        cnode: boot.root_cnode,
        cnode_size_bits: boot.cnode_size_bits,
        cnode_guard_bits: 0,
        first_slot: boot.empty.start,
        end_slot: boot.empty.end,
        level_two_bits,
        start_existing_index: 0,
        end_existing_index: 0,
        start_existing_slot: 0,
        end_existing_slot: 0,
    };
    let cspace = TwoLevelCSpace::new(&mut alloc, config)?;
    alloc.attach_cspace(cspace)?;
    let mut alloc = finish(alloc, boot)?;

    // One spare second-level CNode for when the utspace is busy
    alloc.configure_utspace_reserve(UtspaceReserve {
        size_bits: level_two_bits + SLOT_BITS,
        object_type: ObjectType::CNode,
        count: 1,
    })?;
    debug!(
        "bootstrap: two-level cspace of {} x 2^{} slots, {} untypeds",
        boot.empty.len(),
        level_two_bits,
        boot.untyped.len()
    );
    Ok(fill(alloc))
}
