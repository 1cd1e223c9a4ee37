//! Two-level cspace
//!
//! A first-level CNode whose slots hold second-level CNodes of
//! `2^level_two_bits` slots each. Second levels are created the first time a
//! slot beneath them is needed and destroyed as soon as their last slot is
//! freed, returning both the CNode object and the first-level slot.
//!
//! Slot indices are `(l1 << level_two_bits) | l2`.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::allocman::Bookkeeping;
use crate::cspace::single_level::{SingleLevelCSpace, SingleLevelConfig};
use crate::cspace::CSpace;
use crate::error::{AllocError, Result};
use crate::mspace::MChunk;
use crate::object::{ObjectType, SLOT_BITS, WORD_BITS};
use crate::path::CSpacePath;
use crate::utspace::Cookie;
use crate::CPtr;

/// Layout of a two-level cspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoLevelConfig {
    /// First-level CNode
    pub cnode: CPtr,
    /// Size of the first-level CNode in bits
    pub cnode_size_bits: usize,
    /// Guard bits resolved together with the first-level index
    pub cnode_guard_bits: usize,
    /// First valid first-level index
    pub first_slot: CPtr,
    /// Last valid first-level index + 1
    pub end_slot: CPtr,
    /// Size of every second-level CNode in bits.
    /// `cnode_size_bits + cnode_guard_bits + level_two_bits` must fit a word.
    pub level_two_bits: usize,
    /// First-level indices `[start_existing_index, end_existing_index)`
    /// already hold second-level CNodes created by someone else
    pub start_existing_index: usize,
    pub end_existing_index: usize,
    /// Slots `[start_existing_slot, end_existing_slot)` are already occupied
    pub start_existing_slot: CPtr,
    pub end_existing_slot: CPtr,
}

impl TwoLevelConfig {
    fn first_level(&self) -> SingleLevelConfig {
        SingleLevelConfig {
            cnode: self.cnode,
            cnode_size_bits: self.cnode_size_bits,
            cnode_guard_bits: self.cnode_guard_bits,
            first_slot: self.first_slot,
            end_slot: self.end_slot,
        }
    }

    // There is no capability addressing a second level on its own; only the
    // path-making contract of the config is ever used.
    fn second_level(&self) -> SingleLevelConfig {
        SingleLevelConfig {
            cnode: 0,
            cnode_size_bits: self.level_two_bits,
            cnode_guard_bits: 0,
            first_slot: 0,
            end_slot: 1 << self.level_two_bits,
        }
    }

    /// Footprint of a second-level CNode object
    pub const fn second_level_size_bits(&self) -> usize {
        self.level_two_bits + SLOT_BITS
    }

    #[inline]
    fn split(&self, slot: CPtr) -> (usize, CPtr) {
        (slot >> self.level_two_bits, slot & ((1 << self.level_two_bits) - 1))
    }
}

#[derive(Debug)]
struct SecondLevel {
    /// Slots allocated beneath this node
    count: usize,
    cspace: SingleLevelCSpace,
    /// Untyped backing the CNode, when this allocator created it
    cnode: Option<Cookie>,
    chunk: MChunk,
}

/// Bookkeeping bytes charged per second level
pub const SECOND_LEVEL_BYTES: usize = core::mem::size_of::<SecondLevel>();

/// Lazily populated two-level slot allocator
#[derive(Debug)]
pub struct TwoLevelCSpace {
    config: TwoLevelConfig,
    first_level: SingleLevelCSpace,
    second_levels: Vec<Option<SecondLevel>>,
    last_second_level: usize,
    table: MChunk,
}

impl TwoLevelCSpace {
    pub fn new(ctx: &mut dyn Bookkeeping, config: TwoLevelConfig) -> Result<Self> {
        if config.level_two_bits == 0
            || config.cnode_size_bits + config.cnode_guard_bits + config.level_two_bits > WORD_BITS
        {
            return Err(AllocError::InvalidArgument("two-level cspace does not fit a word"));
        }
        let entries = 1usize << config.cnode_size_bits;
        if config.end_slot > entries || config.end_existing_index > entries {
            return Err(AllocError::InvalidArgument("first-level range exceeds cnode"));
        }

        let table = ctx.mspace_alloc(entries * core::mem::size_of::<usize>())?;
        let first_level = match SingleLevelCSpace::new(ctx, config.first_level()) {
            Ok(cspace) => cspace,
            Err(e) => {
                ctx.mspace_free(table);
                return Err(e);
            }
        };
        let mut second_levels = Vec::with_capacity(entries);
        second_levels.resize_with(entries, || None);

        let mut cspace = Self {
            config,
            first_level,
            second_levels,
            last_second_level: 0,
            table,
        };

        if let Err(e) = cspace.describe_existing(ctx) {
            cspace.destroy(ctx);
            return Err(e);
        }
        Ok(cspace)
    }

    fn describe_existing(&mut self, ctx: &mut dyn Bookkeeping) -> Result<()> {
        let config = self.config;
        for index in config.start_existing_index..config.end_existing_index {
            self.first_level.alloc_at_index(index)?;
            self.create_second_level(ctx, index, false)?;
        }
        for slot in config.start_existing_slot..config.end_existing_slot {
            self.alloc_at_slot(ctx, slot)?;
        }
        Ok(())
    }

    /// Tear down every second level and release all bookkeeping
    pub fn destroy(mut self, ctx: &mut dyn Bookkeeping) {
        for index in 0..self.second_levels.len() {
            if self.second_levels[index].is_some() {
                self.destroy_second_level(ctx, index);
            }
        }
        ctx.mspace_free(self.table);
        self.first_level.destroy(ctx);
    }

    pub fn config(&self) -> &TwoLevelConfig {
        &self.config
    }

    /// Number of second levels currently materialised
    pub fn second_level_count(&self) -> usize {
        self.second_levels.iter().filter(|l| l.is_some()).count()
    }

    pub fn has_second_level(&self, index: usize) -> bool {
        self.second_levels.get(index).is_some_and(Option::is_some)
    }

    /// Slots allocated beneath first-level `index`
    pub fn second_level_usage(&self, index: usize) -> usize {
        match self.second_levels.get(index) {
            Some(Some(level)) => level.count,
            _ => 0,
        }
    }

    fn level_capacity(&self) -> usize {
        1 << self.config.level_two_bits
    }

    fn create_second_level(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        index: usize,
        alloc_node: bool,
    ) -> Result<()> {
        let chunk = ctx.mspace_alloc(SECOND_LEVEL_BYTES)?;
        let path = self.first_level.config().make_path(index);

        let cnode = if alloc_node {
            match ctx.utspace_alloc(self.config.second_level_size_bits(), ObjectType::CNode, &path) {
                Ok(cookie) => Some(cookie),
                Err(e) => {
                    ctx.mspace_free(chunk);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let cspace = match SingleLevelCSpace::new(ctx, self.config.second_level()) {
            Ok(cspace) => cspace,
            Err(e) => {
                if let Some(cookie) = cnode {
                    self.release_cnode(ctx, index, cookie);
                }
                ctx.mspace_free(chunk);
                return Err(e);
            }
        };

        debug!("cspace: created second level {} (backed: {})", index, alloc_node);
        self.second_levels[index] = Some(SecondLevel {
            count: 0,
            cspace,
            cnode,
            chunk,
        });
        Ok(())
    }

    fn release_cnode(&mut self, ctx: &mut dyn Bookkeeping, index: usize, cookie: Cookie) {
        let path = self.first_level.config().make_path(index);
        if let Err(e) = ctx.kernel().delete(&path) {
            warn!("cspace: failed to delete second level cnode {}: {}", index, e);
        }
        ctx.utspace_free(cookie, self.config.second_level_size_bits());
    }

    fn destroy_second_level(&mut self, ctx: &mut dyn Bookkeeping, index: usize) {
        let Some(level) = self.second_levels[index].take() else {
            return;
        };
        level.cspace.destroy(ctx);
        if let Some(cookie) = level.cnode {
            self.release_cnode(ctx, index, cookie);
        }
        ctx.mspace_free(level.chunk);
        if let Err(e) = self.first_level.free_index(index) {
            warn!("cspace: first level slot {} was not allocated: {}", index, e);
        }
        debug!("cspace: destroyed second level {}", index);
    }

    fn alloc_at_slot(&mut self, ctx: &mut dyn Bookkeeping, slot: CPtr) -> Result<()> {
        let (l1, l2) = self.config.split(slot);
        if l1 >= self.second_levels.len() {
            return Err(AllocError::InvalidArgument("slot outside cspace range"));
        }

        let created = self.second_levels[l1].is_none();
        if created {
            self.first_level.alloc_at_index(l1)?;
            if let Err(e) = self.create_second_level(ctx, l1, false) {
                // Roll back the first-level reservation
                if let Err(undo) = self.first_level.free_index(l1) {
                    warn!("cspace: could not release first level slot {}: {}", l1, undo);
                }
                return Err(e);
            }
        }

        let result = match self.second_levels[l1].as_mut() {
            Some(level) => level.cspace.alloc_at_index(l2).map(|()| level.count += 1),
            None => Err(AllocError::InvalidArgument("second level missing")),
        };
        if result.is_err() && created {
            self.destroy_second_level(ctx, l1);
        }
        result
    }

    fn find_second_level(&self) -> Option<usize> {
        let entries = self.second_levels.len();
        let capacity = self.level_capacity();
        (0..entries)
            .map(|step| (self.last_second_level + step) % entries)
            .find(|&i| matches!(&self.second_levels[i], Some(level) if level.count < capacity))
    }
}

impl CSpace for TwoLevelCSpace {
    fn alloc(&mut self, ctx: &mut dyn Bookkeeping) -> Result<CSpacePath> {
        let index = match self.find_second_level() {
            Some(index) => index,
            None => {
                // The first level is full when this fails
                let index = self.first_level.alloc_index()?;
                if let Err(e) = self.create_second_level(ctx, index, true) {
                    if let Err(undo) = self.first_level.free_index(index) {
                        warn!("cspace: could not release first level slot {}: {}", index, undo);
                    }
                    return Err(e);
                }
                index
            }
        };

        self.last_second_level = index;
        let level = self.second_levels[index]
            .as_mut()
            .ok_or(AllocError::OutOfSlots)?;
        let l2 = level.cspace.alloc_index()?;
        level.count += 1;
        Ok(self.make_path((index << self.config.level_two_bits) | l2))
    }

    fn alloc_at(&mut self, ctx: &mut dyn Bookkeeping, slot: CPtr) -> Result<()> {
        self.alloc_at_slot(ctx, slot)
    }

    fn free(&mut self, ctx: &mut dyn Bookkeeping, slot: &CSpacePath) -> Result<()> {
        let (l1, l2) = self.config.split(slot.cap_ptr);
        let level = self
            .second_levels
            .get_mut(l1)
            .and_then(Option::as_mut)
            .ok_or(AllocError::InvalidFree)?;
        level.cspace.free_index(l2)?;
        level.count -= 1;
        if level.count == 0 {
            self.destroy_second_level(ctx, l1);
        }
        Ok(())
    }

    fn make_path(&self, slot: CPtr) -> CSpacePath {
        let (l1, l2) = self.config.split(slot);
        let outer = self.first_level.config().make_path(l1);
        let inner = self.config.second_level().make_path(l2);
        CSpacePath::compose(&outer, &inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::InvocationKind;
    use crate::mspace::FixedPool;
    use crate::testing::Harness;

    fn config() -> TwoLevelConfig {
        TwoLevelConfig {
            cnode: 2,
            cnode_size_bits: 4,
            cnode_guard_bits: 0,
            first_slot: 1,
            end_slot: 16,
            level_two_bits: 3,
            start_existing_index: 0,
            end_existing_index: 0,
            start_existing_slot: 0,
            end_existing_slot: 0,
        }
    }

    #[test]
    fn test_first_alloc_creates_backed_second_level() {
        let mut harness = Harness::new();
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();
        assert_eq!(cspace.second_level_count(), 0);

        let path = cspace.alloc(&mut harness).unwrap();
        assert_eq!(path.cap_ptr >> 3, 1);
        assert_eq!(path.cap_depth, 7);
        assert_eq!(path.dest, 1);
        assert_eq!(path.dest_depth, 4);
        assert_eq!(cspace.second_level_count(), 1);

        // One CNode of 2^3 slots was requested into first-level slot 1
        let cnodes = harness.utspace_allocs();
        assert_eq!(cnodes.len(), 1);
        assert_eq!(cnodes[0].0, 3 + SLOT_BITS);
        assert_eq!(cnodes[0].1, ObjectType::CNode);
        assert_eq!(cnodes[0].2.cap_ptr, 1);
    }

    #[test]
    fn test_fills_second_level_before_creating_another() {
        let mut harness = Harness::new();
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();

        for _ in 0..8 {
            let path = cspace.alloc(&mut harness).unwrap();
            assert_eq!(path.cap_ptr >> 3, 1);
        }
        let path = cspace.alloc(&mut harness).unwrap();
        assert_eq!(path.cap_ptr >> 3, 2);
        assert_eq!(cspace.second_level_count(), 2);
        assert_eq!(cspace.second_level_usage(1), 8);
    }

    #[test]
    fn test_last_free_destroys_second_level() {
        let mut harness = Harness::new();
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();
        let a = cspace.alloc(&mut harness).unwrap();
        let b = cspace.alloc(&mut harness).unwrap();

        cspace.free(&mut harness, &a).unwrap();
        assert!(cspace.has_second_level(1));
        cspace.free(&mut harness, &b).unwrap();
        assert!(!cspace.has_second_level(1));

        // CNode deleted from its first-level slot and the untyped returned
        assert_eq!(harness.kernel.count(InvocationKind::Delete), 1);
        assert_eq!(harness.utspace_frees().len(), 1);

        // The first-level slot is reused for the next second level
        let c = cspace.alloc(&mut harness).unwrap();
        assert_eq!(c.cap_ptr >> 3, 1);
    }

    #[test]
    fn test_alloc_at_creates_unbacked_second_level() {
        let mut harness = Harness::new();
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();
        let slot = (5 << 3) | 6;

        cspace.alloc_at(&mut harness, slot).unwrap();
        assert!(cspace.has_second_level(5));
        assert!(harness.utspace_allocs().is_empty());
        assert!(cspace.alloc_at(&mut harness, slot).is_err());

        cspace.free(&mut harness, &cspace.make_path(slot)).unwrap();
        assert!(!cspace.has_second_level(5));
        assert_eq!(harness.kernel.count(InvocationKind::Delete), 0);
    }

    #[test]
    fn test_existing_layout() {
        let mut harness = Harness::new();
        let mut cfg = config();
        cfg.start_existing_index = 1;
        cfg.end_existing_index = 3;
        cfg.start_existing_slot = 1 << 3;
        cfg.end_existing_slot = (1 << 3) + 4;
        let mut cspace = TwoLevelCSpace::new(&mut harness, cfg).unwrap();

        assert_eq!(cspace.second_level_usage(1), 4);
        assert!(cspace.has_second_level(2));
        assert!(harness.utspace_allocs().is_empty());

        // Existing second levels are used before new ones are created
        let path = cspace.alloc(&mut harness).unwrap();
        assert!(path.cap_ptr >> 3 == 1 || path.cap_ptr >> 3 == 2);
        assert!(harness.utspace_allocs().is_empty());
    }

    #[test]
    fn test_out_of_slots() {
        let mut harness = Harness::new();
        let mut cfg = config();
        cfg.first_slot = 1;
        cfg.end_slot = 2;
        cfg.level_two_bits = 1;
        let mut cspace = TwoLevelCSpace::new(&mut harness, cfg).unwrap();

        cspace.alloc(&mut harness).unwrap();
        cspace.alloc(&mut harness).unwrap();
        assert_eq!(cspace.alloc(&mut harness), Err(AllocError::OutOfSlots));
    }

    #[test]
    fn test_failed_cnode_rolls_back_first_level() {
        let mut harness = Harness::new();
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();
        harness.fail_utspace = true;

        assert!(cspace.alloc(&mut harness).is_err());
        assert_eq!(cspace.second_level_count(), 0);

        harness.fail_utspace = false;
        let path = cspace.alloc(&mut harness).unwrap();
        assert_eq!(path.cap_ptr >> 3, 1);
    }

    #[test]
    fn test_failed_placement_rolls_back_first_level() {
        // Just enough bookkeeping for the cspace itself
        let mut sizing = Harness::new();
        TwoLevelCSpace::new(&mut sizing, config()).unwrap();
        let mut harness = Harness::new();
        harness.pool = FixedPool::new(sizing.pool.in_use());
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();

        assert!(matches!(
            cspace.alloc_at(&mut harness, (5 << 3) | 6),
            Err(AllocError::BookkeepingExhausted { .. })
        ));
        assert!(!cspace.has_second_level(5));
        assert_eq!(cspace.first_level.allocated(), 0);
        assert!(cspace.first_level.alloc_at_index(5).is_ok());
    }

    #[test]
    fn test_make_path_splits_index() {
        let mut harness = Harness::new();
        let cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();
        let path = cspace.make_path((9 << 3) | 5);
        assert_eq!(path.root, 2);
        assert_eq!(path.cap_ptr, (9 << 3) | 5);
        assert_eq!(path.dest, 9);
        assert_eq!(path.offset, 5);
    }

    #[test]
    fn test_destroy_releases_bookkeeping() {
        let mut harness = Harness::new();
        let mut cspace = TwoLevelCSpace::new(&mut harness, config()).unwrap();
        for _ in 0..10 {
            cspace.alloc(&mut harness).unwrap();
        }
        cspace.destroy(&mut harness);
        assert_eq!(harness.pool.in_use(), 0);
        assert_eq!(harness.utspace_frees().len(), 2);
    }
}
