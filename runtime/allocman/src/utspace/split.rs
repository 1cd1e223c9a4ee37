//! Split utspace
//!
//! Binary buddy allocator that materialises every split. Splitting a free
//! untyped of `n + 1` bits retypes it into two untyped children of `n` bits,
//! each in its own freshly allocated slot. When both halves are free again
//! their capabilities are deleted, their slots returned and the parent is
//! free once more.
//!
//! Costs two slots per split but every free block is a real untyped
//! capability, so blocks can be handed to someone else wholesale. Colour
//! domains are built on it.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::allocman::Bookkeeping;
use crate::error::{AllocError, Result};
use crate::mspace::MChunk;
use crate::object::{is_valid_footprint, sel4_object_size, ObjectType, WORD_BITS};
use crate::path::CSpacePath;
use crate::utspace::{Cookie, UntypedKind, UntypedRegion, UtSpace};
use crate::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Split,
    Taken,
}

#[derive(Debug)]
struct SplitNode {
    ut: CSpacePath,
    paddr: Option<Word>,
    size_bits: usize,
    kind: UntypedKind,
    parent: Option<usize>,
    sibling: Option<usize>,
    state: State,
    prev: Option<usize>,
    next: Option<usize>,
    chunk: MChunk,
}

/// Bookkeeping bytes charged per node
pub const NODE_BYTES: usize = core::mem::size_of::<SplitNode>();

/// A region handed to a [`SplitUtSpace`] with [`UtSpace::add_uts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRegion {
    pub paddr: Option<Word>,
    pub size_bits: usize,
    pub kind: UntypedKind,
}

/// Buddy allocator whose free blocks are untyped capabilities
#[derive(Debug)]
pub struct SplitUtSpace {
    nodes: Vec<Option<SplitNode>>,
    vacant: Vec<usize>,
    heads: [[Option<usize>; WORD_BITS]; UntypedKind::COUNT],
}

impl Default for SplitUtSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitUtSpace {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            heads: [[None; WORD_BITS]; UntypedKind::COUNT],
        }
    }

    /// Regions added with [`UtSpace::add_uts`], in no particular order
    pub fn regions(&self) -> Vec<SplitRegion> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.parent.is_none())
            .map(|n| SplitRegion {
                paddr: n.paddr,
                size_bits: n.size_bits,
                kind: n.kind,
            })
            .collect()
    }

    /// Bytes held in free blocks
    pub fn free_bytes(&self) -> u128 {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.state == State::Free)
            .map(|n| 1u128 << n.size_bits)
            .sum()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    fn insert(&mut self, node: SplitNode) -> usize {
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

    fn node(&self, index: usize) -> Option<&SplitNode> {
        self.nodes.get(index).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut SplitNode> {
        self.nodes.get_mut(index).and_then(Option::as_mut)
    }

    /// Put a node on its free list
    fn link(&mut self, index: usize) {
        let Some(node) = self.node_mut(index) else {
            return;
        };
        node.state = State::Free;
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

    /// Take a node off its free list and mark it `state`
    fn unlink(&mut self, index: usize, state: State) {
        let Some(node) = self.node_mut(index) else {
            return;
        };
        node.state = state;
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

    /// Slot and bookkeeping for one child
    fn new_child(ctx: &mut dyn Bookkeeping) -> Result<(CSpacePath, MChunk)> {
        let chunk = ctx.mspace_alloc(NODE_BYTES)?;
        match ctx.cspace_alloc() {
            Ok(slot) => Ok((slot, chunk)),
            Err(e) => {
                ctx.mspace_free(chunk);
                Err(e)
            }
        }
    }

    fn drop_child(ctx: &mut dyn Bookkeeping, slot: &CSpacePath, chunk: MChunk, retyped: bool) {
        if retyped {
            if let Err(e) = ctx.kernel().delete(slot) {
                warn!("split: failed to delete child untyped: {}", e);
            }
        }
        ctx.cspace_free(slot);
        ctx.mspace_free(chunk);
    }

    /// Retype free node `index` into two halves, left half first on the
    /// free list
    fn split(&mut self, ctx: &mut dyn Bookkeeping, index: usize) -> Result<(usize, usize)> {
        let (ut, paddr, size_bits, kind) = match self.node(index) {
            Some(n) if n.state == State::Free && n.size_bits > 1 => {
                (n.ut, n.paddr, n.size_bits - 1, n.kind)
            }
            _ => return Err(AllocError::OutOfMemory { size_bits: 0 }),
        };

        let (left_slot, left_chunk) = Self::new_child(ctx)?;
        let (right_slot, right_chunk) = match Self::new_child(ctx) {
            Ok(child) => child,
            Err(e) => {
                Self::drop_child(ctx, &left_slot, left_chunk, false);
                return Err(e);
            }
        };

        if let Err(e) = ctx
            .kernel()
            .retype(&ut, ObjectType::Untyped, 0, size_bits, &left_slot)
        {
            Self::drop_child(ctx, &left_slot, left_chunk, false);
            Self::drop_child(ctx, &right_slot, right_chunk, false);
            return Err(e);
        }
        if let Err(e) = ctx
            .kernel()
            .retype(&ut, ObjectType::Untyped, 1 << size_bits, size_bits, &right_slot)
        {
            Self::drop_child(ctx, &left_slot, left_chunk, true);
            Self::drop_child(ctx, &right_slot, right_chunk, false);
            return Err(e);
        }

        self.unlink(index, State::Split);
        let child = |slot, paddr, chunk| SplitNode {
            ut: slot,
            paddr,
            size_bits,
            kind,
            parent: Some(index),
            sibling: None,
            state: State::Free,
            prev: None,
            next: None,
            chunk,
        };
        let left = self.insert(child(left_slot, paddr, left_chunk));
        let right = self.insert(child(right_slot, paddr.map(|p| p + (1 << size_bits)), right_chunk));
        if let Some(n) = self.node_mut(left) {
            n.sibling = Some(right);
        }
        if let Some(n) = self.node_mut(right) {
            n.sibling = Some(left);
        }
        // Left is linked last so blocks come off in address order
        self.link(right);
        self.link(left);
        debug!("split: 2^{} untyped into two halves", size_bits + 1);
        Ok((left, right))
    }

    fn ensure(&mut self, ctx: &mut dyn Bookkeeping, kind: UntypedKind, size_bits: usize) -> Result<usize> {
        if let Some(index) = self.heads[kind.index()][size_bits] {
            return Ok(index);
        }
        let level = (size_bits + 1..WORD_BITS)
            .find(|&l| self.heads[kind.index()][l].is_some())
            .ok_or(AllocError::OutOfMemory { size_bits })?;

        let top = self.heads[kind.index()][level].ok_or(AllocError::OutOfMemory { size_bits })?;
        let mut index = top;
        for _ in size_bits..level {
            index = match self.split(ctx, index) {
                Ok((left, _)) => left,
                Err(e) => {
                    self.unsplit(ctx, index, top);
                    return Err(e);
                }
            };
        }
        Ok(index)
    }

    /// Free node of `level` bits containing physical address `target`
    fn covering(&self, kind: UntypedKind, level: usize, target: Word) -> Option<usize> {
        let mut cursor = self.heads[kind.index()][level];
        while let Some(index) = cursor {
            let node = self.node(index)?;
            if let Some(base) = node.paddr {
                if target >= base && (target - base) >> level == 0 {
                    return Some(index);
                }
            }
            cursor = node.next;
        }
        None
    }

    fn ensure_at(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        kind: UntypedKind,
        size_bits: usize,
        target: Word,
    ) -> Result<usize> {
        let level = (size_bits..WORD_BITS)
            .find(|&l| self.covering(kind, l, target).is_some())
            .ok_or(AllocError::OutOfMemory { size_bits })?;
        let top = self
            .covering(kind, level, target)
            .ok_or(AllocError::OutOfMemory { size_bits })?;

        let mut index = top;
        for l in (size_bits..level).rev() {
            let (left, right) = match self.split(ctx, index) {
                Ok(halves) => halves,
                Err(e) => {
                    self.unsplit(ctx, index, top);
                    return Err(e);
                }
            };
            let upper = self.node(right).and_then(|n| n.paddr).unwrap_or(Word::MAX);
            index = if target >= upper { right } else { left };
            debug_assert_eq!(self.node(index).map(|n| n.size_bits), Some(l));
        }
        Ok(index)
    }

    /// Undo the splits that led from free node `top` down to free node
    /// `index`. Every sibling along the way is still free.
    fn unsplit(&mut self, ctx: &mut dyn Bookkeeping, index: usize, top: usize) {
        if index == top {
            return;
        }
        let mut index = index;
        while index != top {
            let Some((Some(parent), Some(sibling))) = self.node(index).map(|n| (n.parent, n.sibling)) else {
                warn!("split: lost track of a partial split chain");
                return;
            };
            for child in [sibling, index] {
                if self.node(child).is_some_and(|n| n.state == State::Free) {
                    self.unlink(child, State::Taken);
                }
                if let Some(node) = self.nodes[child].take() {
                    self.vacant.push(child);
                    Self::drop_child(ctx, &node.ut, node.chunk, true);
                }
            }
            index = parent;
        }
        self.link(top);
    }

    /// Return node `index` and coalesce with free siblings
    fn release(&mut self, ctx: &mut dyn Bookkeeping, index: usize) {
        let mut index = index;
        for _ in 0..WORD_BITS {
            let (parent, sibling) = match self.node(index) {
                Some(n) => (n.parent, n.sibling),
                None => return,
            };
            let sibling_free = sibling
                .and_then(|s| self.node(s))
                .is_some_and(|s| s.state == State::Free);
            match (parent, sibling) {
                (Some(parent), Some(sibling)) if sibling_free => {
                    self.unlink(sibling, State::Taken);
                    for child in [sibling, index] {
                        if let Some(node) = self.nodes[child].take() {
                            self.vacant.push(child);
                            Self::drop_child(ctx, &node.ut, node.chunk, true);
                        }
                    }
                    index = parent;
                }
                _ => {
                    self.link(index);
                    return;
                }
            }
        }
    }
}

impl UtSpace for SplitUtSpace {
    fn add_uts(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        regions: &[UntypedRegion],
        kind: UntypedKind,
    ) -> Result<()> {
        for region in regions {
            if region.size_bits == 0 || region.size_bits >= WORD_BITS {
                return Err(AllocError::InvalidArgument("untyped size out of range"));
            }
            let chunk = ctx.mspace_alloc(NODE_BYTES)?;
            let index = self.insert(SplitNode {
                ut: region.path,
                paddr: region.paddr,
                size_bits: region.size_bits,
                kind,
                parent: None,
                sibling: None,
                state: State::Free,
                prev: None,
                next: None,
                chunk,
            });
            self.link(index);
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
                None => self.ensure(ctx, kind, size_bits),
            };
            let index = match found {
                Ok(index) => index,
                Err(AllocError::OutOfMemory { .. }) => continue,
                Err(e) => return Err(e),
            };
            let ut = match self.node(index) {
                Some(node) => node.ut,
                None => continue,
            };

            self.unlink(index, State::Taken);
            let retyped = ctx.kernel().retype(
                &ut,
                object_type,
                0,
                sel4_object_size(object_type, size_bits),
                dest,
            );
            if let Err(e) = retyped {
                self.release(ctx, index);
                return Err(e);
            }
            return Ok(Cookie(index));
        }
        Err(AllocError::OutOfMemory { size_bits })
    }

    fn free(&mut self, ctx: &mut dyn Bookkeeping, cookie: Cookie, size_bits: usize) -> Result<()> {
        match self.node(cookie.0) {
            Some(n) if n.state == State::Taken && n.size_bits == size_bits => {}
            _ => return Err(AllocError::InvalidFree),
        }
        self.release(ctx, cookie.0);
        Ok(())
    }

    fn paddr(&self, cookie: Cookie, size_bits: usize) -> Option<Word> {
        self.node(cookie.0)
            .filter(|n| n.size_bits == size_bits)
            .and_then(|n| n.paddr)
    }
}
