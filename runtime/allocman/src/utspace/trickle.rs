//! Trickle utspace
//!
//! A buddy allocator that never splits capabilities. Every node describes
//! `2^levels` equally sized blocks of one untyped region and keeps their
//! state in an MSB-first bitmap (bit 0 is the most significant bit and is
//! always handed out first). Objects are retyped straight out of the root
//! untyped at the block's byte offset.
//!
//! Nodes with at least one free block sit on the bucket list for their block
//! size. When a bucket is empty a block is taken from a larger size class
//! and installed as a new child node, preferably
//! [`TRICKLE_REFILL_LEVELS`] levels up so one split serves many requests.
//! A child whose blocks are all free again is dropped and its block is
//! returned to the parent.
//!
//! Cookie layout: `(node_index << COOKIE_OFFSET_BITS) | block`.

use alloc::vec::Vec;

use log::debug;
use static_assertions::const_assert;

use crate::allocman::Bookkeeping;
use crate::error::{AllocError, Result};
use crate::mspace::MChunk;
use crate::object::{is_valid_footprint, sel4_object_size, ObjectType, WORD_BITS};
use crate::path::CSpacePath;
use crate::utspace::{Cookie, UntypedKind, UntypedRegion, UtSpace};
use crate::Word;

/// How many size classes above the request a refill prefers to split from
pub const TRICKLE_REFILL_LEVELS: usize = 5;

/// Low cookie bits holding the block index inside a node
pub const COOKIE_OFFSET_BITS: usize = 6;

const OFFSET_MASK: Word = (1 << COOKIE_OFFSET_BITS) - 1;

const_assert!(1usize << TRICKLE_REFILL_LEVELS <= 1usize << COOKIE_OFFSET_BITS);
const_assert!(1usize << COOKIE_OFFSET_BITS == u64::BITS as usize);

#[derive(Debug)]
struct TrickleNode {
    /// Root untyped every block is retyped from
    ut: CSpacePath,
    /// Byte offset of block 0 inside `ut`
    offset: Word,
    paddr: Option<Word>,
    /// Block of the parent node this node was split from
    parent: Option<Cookie>,
    levels: usize,
    size_bits: usize,
    kind: UntypedKind,
    bitmap: u64,
    prev: Option<usize>,
    next: Option<usize>,
    chunk: MChunk,
}

/// Bookkeeping bytes charged per node
pub const NODE_BYTES: usize = core::mem::size_of::<TrickleNode>();

/// A claimed block
#[derive(Debug, Clone, Copy)]
struct Block {
    cookie: Cookie,
    ut: CSpacePath,
    offset: Word,
    paddr: Option<Word>,
}

#[inline]
const fn full_bitmap(levels: usize) -> u64 {
    u64::MAX << (u64::BITS as usize - (1 << levels))
}

#[inline]
const fn bit(block: usize) -> u64 {
    1 << (u64::BITS as usize - 1 - block)
}

#[inline]
const fn make_cookie(index: usize, block: usize) -> Cookie {
    Cookie((index << COOKIE_OFFSET_BITS) | block)
}

#[inline]
const fn decode(cookie: Cookie) -> (usize, usize) {
    (cookie.0 >> COOKIE_OFFSET_BITS, cookie.0 & OFFSET_MASK)
}

/// Buddy allocator over untyped regions
#[derive(Debug)]
pub struct TrickleUtSpace {
    nodes: Vec<Option<TrickleNode>>,
    vacant: Vec<usize>,
    heads: [[Option<usize>; WORD_BITS]; UntypedKind::COUNT],
}

impl Default for TrickleUtSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl TrickleUtSpace {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            heads: [[None; WORD_BITS]; UntypedKind::COUNT],
        }
    }

    /// Number of live bookkeeping nodes
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Total bytes not currently handed out, across every kind
    pub fn free_bytes(&self) -> u128 {
        self.nodes
            .iter()
            .flatten()
            .map(|n| (n.bitmap.count_ones() as u128) << n.size_bits)
            .sum()
    }

    /// Whether a request of `size_bits` can be served without a refill
    pub fn has_free_block(&self, kind: UntypedKind, size_bits: usize) -> bool {
        size_bits < WORD_BITS && self.heads[kind.index()][size_bits].is_some()
    }

    fn insert(&mut self, node: TrickleNode) -> usize {
        match self.vacant.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize) -> Option<TrickleNode> {
        let node = self.nodes.get_mut(index)?.take()?;
        self.vacant.push(index);
        Some(node)
    }

    fn node(&self, index: usize) -> Option<&TrickleNode> {
        self.nodes.get(index).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut TrickleNode> {
        self.nodes.get_mut(index).and_then(Option::as_mut)
    }

    fn link(&mut self, index: usize) {
        let Some(node) = self.node(index) else {
            return;
        };
        let (kind, size_bits) = (node.kind.index(), node.size_bits);
        let head = self.heads[kind][size_bits];
        if let Some(next) = head.and_then(|h| self.node_mut(h)) {
            next.prev = Some(index);
        }
        if let Some(node) = self.node_mut(index) {
            node.prev = None;
            node.next = head;
        }
        self.heads[kind][size_bits] = Some(index);
    }

    fn unlink(&mut self, index: usize) {
        let Some(node) = self.node_mut(index) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        let (kind, size_bits) = (node.kind.index(), node.size_bits);
        if let Some(n) = next.and_then(|n| self.node_mut(n)) {
            n.prev = prev;
        }
        match prev.and_then(|p| self.node_mut(p)) {
            Some(p) => p.next = next,
            None => self.heads[kind][size_bits] = next,
        }
    }

    /// Mark `block` of node `index` as allocated
    fn claim(&mut self, index: usize, block: usize) -> Result<Block> {
        let node = self
            .node_mut(index)
            .ok_or(AllocError::InvalidArgument("claim from a vacant node"))?;
        node.bitmap &= !bit(block);
        let claimed = Block {
            cookie: make_cookie(index, block),
            ut: node.ut,
            offset: node.offset + (block << node.size_bits),
            paddr: node.paddr.map(|p| p + (block << node.size_bits)),
        };
        if node.bitmap == 0 {
            self.unlink(index);
        }
        Ok(claimed)
    }

    /// Install a child node of `size_bits` blocks inside block `block` of
    /// node `parent`, which holds blocks of `level` bits
    fn split(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        kind: UntypedKind,
        parent: usize,
        block: usize,
        level: usize,
        size_bits: usize,
    ) -> Result<usize> {
        let chunk = ctx.mspace_alloc(NODE_BYTES)?;
        let taken = match self.claim(parent, block) {
            Ok(taken) => taken,
            Err(e) => {
                ctx.mspace_free(chunk);
                return Err(e);
            }
        };
        let levels = level - size_bits;
        let index = self.insert(TrickleNode {
            ut: taken.ut,
            offset: taken.offset,
            paddr: taken.paddr,
            parent: Some(taken.cookie),
            levels,
            size_bits,
            kind,
            bitmap: full_bitmap(levels),
            prev: None,
            next: None,
            chunk,
        });
        self.link(index);
        debug!(
            "trickle: split 2^{} block into {} blocks of 2^{}",
            level,
            1usize << levels,
            size_bits
        );
        Ok(index)
    }

    fn refill(&mut self, ctx: &mut dyn Bookkeeping, kind: UntypedKind, size_bits: usize) -> Result<()> {
        let heads = &self.heads[kind.index()];
        let preferred = (size_bits + TRICKLE_REFILL_LEVELS).min(WORD_BITS - 1);
        let level = if heads[preferred..].iter().any(Option::is_some) {
            preferred
        } else {
            (size_bits + 1..preferred)
                .rev()
                .find(|&l| heads[l].is_some())
                .ok_or(AllocError::OutOfMemory { size_bits })?
        };

        let (parent, block) = self.first_free(ctx, kind, level)?;
        if let Err(e) = self.split(ctx, kind, parent, block, level, size_bits) {
            // `parent` may be a node the lookup above just split off
            self.settle(ctx, parent)?;
            return Err(e);
        }
        Ok(())
    }

    /// First free block at `size_bits`, refilling the bucket if needed
    fn first_free(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        kind: UntypedKind,
        size_bits: usize,
    ) -> Result<(usize, usize)> {
        if self.heads[kind.index()][size_bits].is_none() {
            self.refill(ctx, kind, size_bits)?;
        }
        let index = self.heads[kind.index()][size_bits].ok_or(AllocError::OutOfMemory { size_bits })?;
        let node = self.node(index).ok_or(AllocError::OutOfMemory { size_bits })?;
        Ok((index, node.bitmap.leading_zeros() as usize))
    }

    /// Free block at `size_bits` starting at physical address `target`
    fn covering(&self, kind: UntypedKind, size_bits: usize, target: Word) -> Option<(usize, usize)> {
        let mut cursor = self.heads[kind.index()][size_bits];
        while let Some(index) = cursor {
            let node = self.node(index)?;
            if let Some(base) = node.paddr {
                if target >= base {
                    let block = (target - base) >> size_bits;
                    if block < (1 << node.levels) && node.bitmap & bit(block) != 0 {
                        return Some((index, block));
                    }
                }
            }
            cursor = node.next;
        }
        None
    }

    /// Split down from whichever free block covers `target` until a block
    /// of `size_bits` starting at `target` is free
    fn ensure_at(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        kind: UntypedKind,
        size_bits: usize,
        target: Word,
    ) -> Result<(usize, usize)> {
        if let Some(found) = self.covering(kind, size_bits, target) {
            return Ok(found);
        }
        let mut level = (size_bits + 1..WORD_BITS)
            .find(|&l| self.covering(kind, l, target).is_some())
            .ok_or(AllocError::OutOfMemory { size_bits })?;

        let mut created = None;
        while level > size_bits {
            let next = level - (level - size_bits).min(TRICKLE_REFILL_LEVELS);
            let (parent, block) = self
                .covering(kind, level, target)
                .ok_or(AllocError::OutOfMemory { size_bits })?;
            match self.split(ctx, kind, parent, block, level, next) {
                Ok(index) => created = Some(index),
                Err(e) => {
                    if let Some(index) = created {
                        self.settle(ctx, index)?;
                    }
                    return Err(e);
                }
            }
            level = next;
        }
        self.covering(kind, size_bits, target)
            .ok_or(AllocError::OutOfMemory { size_bits })
    }

    /// Drop node `index` if it was split from a parent and is entirely free,
    /// returning the parent block to release
    fn collapse(&mut self, ctx: &mut dyn Bookkeeping, index: usize) -> Option<(Cookie, usize)> {
        let node = self.node(index)?;
        let parent = node.parent?;
        if node.bitmap != full_bitmap(node.levels) {
            return None;
        }
        let parent_bits = node.size_bits + node.levels;
        self.unlink(index);
        let node = self.remove(index)?;
        ctx.mspace_free(node.chunk);
        Some((parent, parent_bits))
    }

    fn settle(&mut self, ctx: &mut dyn Bookkeeping, index: usize) -> Result<()> {
        match self.collapse(ctx, index) {
            Some((parent, size_bits)) => self.release(ctx, parent, size_bits),
            None => Ok(()),
        }
    }

    /// Return a block and coalesce upwards. Bounded by the number of size
    /// classes since every step moves to a strictly larger one.
    fn release(&mut self, ctx: &mut dyn Bookkeeping, cookie: Cookie, size_bits: usize) -> Result<()> {
        let (mut cookie, mut size_bits) = (cookie, size_bits);
        for _ in 0..WORD_BITS {
            let (index, block) = decode(cookie);
            let node = self.node_mut(index).ok_or(AllocError::InvalidFree)?;
            if node.size_bits != size_bits
                || block >= (1 << node.levels)
                || node.bitmap & bit(block) != 0
            {
                return Err(AllocError::InvalidFree);
            }
            let listed = node.bitmap != 0;
            node.bitmap |= bit(block);
            if !listed {
                self.link(index);
            }
            match self.collapse(ctx, index) {
                Some((parent, parent_bits)) => {
                    cookie = parent;
                    size_bits = parent_bits;
                }
                None => return Ok(()),
            }
        }
        Ok(())
    }
}

impl UtSpace for TrickleUtSpace {
    fn add_uts(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        regions: &[UntypedRegion],
        kind: UntypedKind,
    ) -> Result<()> {
        let mut added = Vec::with_capacity(regions.len());
        for region in regions {
            if region.size_bits == 0 || region.size_bits >= WORD_BITS {
                self.rollback(ctx, &added);
                return Err(AllocError::InvalidArgument("untyped size out of range"));
            }
            let chunk = match ctx.mspace_alloc(NODE_BYTES) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.rollback(ctx, &added);
                    return Err(e);
                }
            };
            let index = self.insert(TrickleNode {
                ut: region.path,
                offset: 0,
                paddr: region.paddr,
                parent: None,
                levels: 0,
                size_bits: region.size_bits,
                kind,
                bitmap: full_bitmap(0),
                prev: None,
                next: None,
                chunk,
            });
            self.link(index);
            added.push(index);
        }
        Ok(())
    }

    fn alloc(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
        paddr: Option<Word>,
        can_use_device: bool,
    ) -> Result<Cookie> {
        if !is_valid_footprint(object_type, size_bits) {
            return Err(AllocError::InvalidArgument("size does not match object type"));
        }
        if paddr.is_some_and(|p| p & ((1 << size_bits) - 1) != 0) {
            return Err(AllocError::InvalidArgument("physical address not aligned to object"));
        }

        for &kind in UntypedKind::search_order(paddr, can_use_device) {
            let found = match paddr {
                Some(target) => self.ensure_at(ctx, kind, size_bits, target),
                None => self.first_free(ctx, kind, size_bits),
            };
            let (index, block) = match found {
                Ok(found) => found,
                Err(AllocError::OutOfMemory { .. }) => continue,
                Err(e) => return Err(e),
            };

            let claimed = self.claim(index, block)?;
            let retyped = ctx.kernel().retype(
                &claimed.ut,
                object_type,
                claimed.offset,
                sel4_object_size(object_type, size_bits),
                dest,
            );
            if let Err(e) = retyped {
                self.release(ctx, claimed.cookie, size_bits)?;
                return Err(e);
            }
            return Ok(claimed.cookie);
        }
        Err(AllocError::OutOfMemory { size_bits })
    }

    fn free(&mut self, ctx: &mut dyn Bookkeeping, cookie: Cookie, size_bits: usize) -> Result<()> {
        self.release(ctx, cookie, size_bits)
    }

    fn paddr(&self, cookie: Cookie, size_bits: usize) -> Option<Word> {
        let (index, block) = decode(cookie);
        let node = self.node(index)?;
        if node.size_bits != size_bits {
            return None;
        }
        node.paddr.map(|p| p + (block << size_bits))
    }
}

impl TrickleUtSpace {
    fn rollback(&mut self, ctx: &mut dyn Bookkeeping, added: &[usize]) {
        for &index in added {
            self.unlink(index);
            if let Some(node) = self.remove(index) {
                ctx.mspace_free(node.chunk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Invocation, InvocationKind, KernelError};
    use crate::mspace::FixedPool;
    use crate::testing::Harness;

    fn region(slot: Word, size_bits: usize, paddr: Option<Word>) -> UntypedRegion {
        UntypedRegion {
            path: Harness::root_path(slot),
            size_bits,
            paddr,
        }
    }

    fn seeded(harness: &mut Harness, size_bits: usize, paddr: Option<Word>) -> TrickleUtSpace {
        let mut ut = TrickleUtSpace::new();
        ut.add_uts(harness, &[region(10, size_bits, paddr)], UntypedKind::Kernel)
            .unwrap();
        ut
    }

    fn alloc(ut: &mut TrickleUtSpace, harness: &mut Harness, size_bits: usize) -> Result<Cookie> {
        let dest = Harness::root_path(100);
        ut.alloc(harness, size_bits, ObjectType::Untyped, &dest, None, false)
    }

    #[test]
    fn test_msb_first_block_selection() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 8, Some(0x1000));

        let c1 = alloc(&mut ut, &mut harness, 6).unwrap();
        assert_eq!(ut.paddr(c1, 6), Some(0x1000));
        let c2 = alloc(&mut ut, &mut harness, 6).unwrap();
        assert_eq!(ut.paddr(c2, 6), Some(0x1040));

        // Both objects were retyped from the root untyped at byte offsets
        let offsets: Vec<Word> = harness
            .kernel
            .retypes()
            .iter()
            .filter_map(|inv| match inv {
                Invocation::Retype { untyped, offset, .. } if untyped.cap_ptr == 10 => {
                    Some(*offset)
                }
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 0x40]);
    }

    #[test]
    fn test_refill_prefers_five_levels_up() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 20, None);

        alloc(&mut ut, &mut harness, 12).unwrap();
        // 20 -> 17 -> 12: the second split is exactly five levels
        assert_eq!(ut.node_count(), 3);
        assert!(ut.has_free_block(UntypedKind::Kernel, 17));
        assert!(ut.has_free_block(UntypedKind::Kernel, 12));
    }

    #[test]
    fn test_free_coalesces_to_root() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 16, Some(0));
        let bookkeeping = harness.pool.in_use();

        let cookies: Vec<Cookie> = (0..8).map(|_| alloc(&mut ut, &mut harness, 12).unwrap()).collect();
        assert!(ut.node_count() > 1);
        for cookie in cookies.into_iter().rev() {
            ut.free(&mut harness, cookie, 12).unwrap();
        }
        assert_eq!(ut.node_count(), 1);
        assert_eq!(ut.free_bytes(), 1 << 16);
        assert_eq!(harness.pool.in_use(), bookkeeping);

        // The whole region is available again without a refill
        let whole = alloc(&mut ut, &mut harness, 16).unwrap();
        assert_eq!(ut.paddr(whole, 16), Some(0));
    }

    #[test]
    fn test_out_of_memory() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 12, None);
        alloc(&mut ut, &mut harness, 12).unwrap();
        assert_eq!(
            alloc(&mut ut, &mut harness, 10),
            Err(AllocError::OutOfMemory { size_bits: 10 })
        );
        assert_eq!(
            alloc(&mut ut, &mut harness, 13),
            Err(AllocError::OutOfMemory { size_bits: 13 })
        );
    }

    #[test]
    fn test_invalid_free() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 12, None);
        let cookie = alloc(&mut ut, &mut harness, 10).unwrap();

        assert_eq!(ut.free(&mut harness, cookie, 11), Err(AllocError::InvalidFree));
        ut.free(&mut harness, cookie, 10).unwrap();
        assert_eq!(ut.free(&mut harness, Cookie(0xdead << COOKIE_OFFSET_BITS), 10), Err(AllocError::InvalidFree));
    }

    #[test]
    fn test_rejects_mismatched_footprint() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 16, None);
        let dest = Harness::root_path(100);
        assert!(matches!(
            ut.alloc(&mut harness, 12, ObjectType::Tcb, &dest, None, false),
            Err(AllocError::InvalidArgument(_))
        ));
        assert!(matches!(
            ut.alloc(&mut harness, 0, ObjectType::Untyped, &dest, None, false),
            Err(AllocError::InvalidArgument(_))
        ));
        assert!(ut
            .alloc(&mut harness, crate::object::TCB_BITS, ObjectType::Tcb, &dest, None, false)
            .is_ok());
    }

    #[test]
    fn test_failed_retype_leaves_no_trace() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 16, None);
        harness
            .kernel
            .fail_next(InvocationKind::Retype, KernelError::NOT_ENOUGH_MEMORY);

        assert!(matches!(
            alloc(&mut ut, &mut harness, 12),
            Err(AllocError::Kernel { .. })
        ));
        assert_eq!(ut.node_count(), 1);
        assert_eq!(ut.free_bytes(), 1 << 16);
    }

    #[test]
    fn test_bookkeeping_runs_out_between_splits() {
        // Room for the root node and one child: 20 -> 17 succeeds, 17 -> 12 fails
        let mut harness = Harness::new();
        harness.pool = FixedPool::new(2 * NODE_BYTES);
        let mut ut = seeded(&mut harness, 20, None);

        assert!(matches!(
            alloc(&mut ut, &mut harness, 12),
            Err(AllocError::BookkeepingExhausted { .. })
        ));
        assert_eq!(ut.node_count(), 1);
        assert_eq!(ut.free_bytes(), 1 << 20);
        assert_eq!(harness.pool.in_use(), NODE_BYTES);

        // The root block was handed back whole
        let whole = alloc(&mut ut, &mut harness, 20).unwrap();
        ut.free(&mut harness, whole, 20).unwrap();
    }

    #[test]
    fn test_every_failing_budget_leaves_no_trace() {
        for budget in 1..6 {
            let mut harness = Harness::new();
            harness.pool = FixedPool::new(budget * NODE_BYTES);
            let mut ut = seeded(&mut harness, 40, None);
            let before = (ut.node_count(), ut.free_bytes(), harness.pool.in_use());

            // 40 -> 37 -> ... -> 12 needs more nodes than any of these budgets
            assert!(alloc(&mut ut, &mut harness, 12).is_err(), "budget {}", budget);
            assert_eq!(
                (ut.node_count(), ut.free_bytes(), harness.pool.in_use()),
                before,
                "budget {}",
                budget
            );
        }
    }

    #[test]
    fn test_alloc_at_physical_address() {
        let mut harness = Harness::new();
        let mut ut = seeded(&mut harness, 20, Some(0x10_0000));
        let dest = Harness::root_path(100);

        let cookie = ut
            .alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, Some(0x17_3000), false)
            .unwrap();
        assert_eq!(ut.paddr(cookie, 12), Some(0x17_3000));
        assert_eq!(ut.free_bytes(), (1 << 20) - (1 << 12));

        // Same address again is taken
        assert!(ut
            .alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, Some(0x17_3000), false)
            .is_err());
        // Misaligned request
        assert!(matches!(
            ut.alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, Some(0x17_3800), false),
            Err(AllocError::InvalidArgument(_))
        ));

        ut.free(&mut harness, cookie, 12).unwrap();
        assert_eq!(ut.node_count(), 1);
    }

    #[test]
    fn test_device_regions_need_explicit_address() {
        let mut harness = Harness::new();
        let mut ut = TrickleUtSpace::new();
        ut.add_uts(&mut harness, &[region(11, 12, Some(0x9000_0000))], UntypedKind::Device)
            .unwrap();
        let dest = Harness::root_path(100);

        assert!(ut
            .alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, None, true)
            .is_err());
        let cookie = ut
            .alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, Some(0x9000_0000), false)
            .unwrap();
        assert_eq!(ut.paddr(cookie, 12), Some(0x9000_0000));
    }

    #[test]
    fn test_device_memory_needs_opt_in() {
        let mut harness = Harness::new();
        let mut ut = TrickleUtSpace::new();
        ut.add_uts(&mut harness, &[region(11, 14, None)], UntypedKind::DeviceMemory)
            .unwrap();
        let dest = Harness::root_path(100);

        assert!(ut
            .alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, None, false)
            .is_err());
        assert!(ut
            .alloc(&mut harness, 12, ObjectType::SMALL_PAGE, &dest, None, true)
            .is_ok());
    }

    #[test]
    fn test_add_uts_charges_bookkeeping() {
        let mut harness = Harness::new();
        let mut ut = TrickleUtSpace::new();
        let regions = [region(10, 12, None), region(11, 13, None)];
        ut.add_uts(&mut harness, &regions, UntypedKind::Kernel).unwrap();
        assert_eq!(ut.node_count(), 2);
        assert!(harness.pool.in_use() >= 2 * NODE_BYTES);
    }
}
