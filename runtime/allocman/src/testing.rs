//! Stand-in bookkeeping context for component tests
//!
//! Lets a cspace or utspace allocator run on its own: slots come from a
//! counter, untyped requests are recorded and answered with fresh cookies,
//! and kernel invocations go to a [`RecordingKernel`].

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::allocman::{AllocMan, Bookkeeping};
use crate::cspace::{SingleLevelCSpace, SingleLevelConfig};
use crate::error::{AllocError, Result};
use crate::kernel::{KernelObjects, RecordingKernel};
use crate::mspace::{FixedPool, MChunk, MSpace};
use crate::object::ObjectType;
use crate::path::CSpacePath;
use crate::utspace::{Cookie, TrickleUtSpace, UntypedKind, UntypedRegion};
use crate::{CPtr, Word};

const ROOT_CNODE: CPtr = 2;
const ROOT_BITS: usize = 12;
const FIRST_FREE_SLOT: CPtr = 1000;

/// Physical address of the region [`manager`] is seeded with
pub const MANAGER_PADDR: Word = 0x4000_0000;

/// A manager over root CNode slots `[slots.0, slots.1)` and a trickle
/// utspace holding one 1 MiB region
pub(crate) fn manager(slots: (CPtr, CPtr), kernel: &RecordingKernel) -> AllocMan {
    let mut alloc = AllocMan::new(FixedPool::new(1 << 16), kernel.clone());
    let cspace = SingleLevelCSpace::new(
        &mut alloc,
        SingleLevelConfig {
            cnode: ROOT_CNODE,
            cnode_size_bits: ROOT_BITS,
            cnode_guard_bits: 0,
            first_slot: slots.0,
            end_slot: slots.1,
        },
    )
    .unwrap();
    alloc.attach_cspace(cspace).unwrap();
    alloc.attach_utspace(TrickleUtSpace::new()).unwrap();
    let region = UntypedRegion {
        path: Harness::root_path(10),
        size_bits: 20,
        paddr: Some(MANAGER_PADDR),
    };
    alloc.add_untypeds(&[region], UntypedKind::Kernel).unwrap();
    alloc
}

pub(crate) struct Harness {
    pub pool: FixedPool,
    pub kernel: RecordingKernel,
    pub fail_utspace: bool,
    next_slot: CPtr,
    live: BTreeSet<CPtr>,
    cspace_budget: Option<usize>,
    next_cookie: Word,
    utspace_allocs: Vec<(usize, ObjectType, CSpacePath)>,
    utspace_frees: Vec<(Cookie, usize)>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            pool: FixedPool::new(1 << 20),
            kernel: RecordingKernel::new(),
            fail_utspace: false,
            next_slot: FIRST_FREE_SLOT,
            live: BTreeSet::new(),
            cspace_budget: None,
            next_cookie: 1,
            utspace_allocs: Vec::new(),
            utspace_frees: Vec::new(),
        }
    }

    /// Path of `slot` in the root CNode
    pub fn root_path(slot: CPtr) -> CSpacePath {
        CSpacePath {
            root: ROOT_CNODE,
            cap_ptr: slot,
            cap_depth: ROOT_BITS,
            dest: 0,
            dest_depth: 0,
            offset: slot,
        }
    }

    /// Let `n` more slot allocations succeed, then fail with `OutOfSlots`
    pub fn fail_cspace_after(&mut self, n: usize) {
        self.cspace_budget = Some(n);
    }

    /// Slots handed out and not yet returned
    pub fn live_slots(&self) -> usize {
        self.live.len()
    }

    pub fn utspace_allocs(&self) -> Vec<(usize, ObjectType, CSpacePath)> {
        self.utspace_allocs.clone()
    }

    pub fn utspace_frees(&self) -> Vec<(Cookie, usize)> {
        self.utspace_frees.clone()
    }
}

impl Bookkeeping for Harness {
    fn mspace_alloc(&mut self, bytes: usize) -> Result<MChunk> {
        self.pool.alloc(bytes)
    }

    fn mspace_free(&mut self, chunk: MChunk) {
        assert!(
            self.pool.free(chunk).is_ok(),
            "bookkeeping chunk {:?} freed twice",
            chunk
        );
    }

    fn cspace_alloc(&mut self) -> Result<CSpacePath> {
        match self.cspace_budget {
            Some(0) => return Err(AllocError::OutOfSlots),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.live.insert(slot);
        Ok(Self::root_path(slot))
    }

    fn cspace_free(&mut self, slot: &CSpacePath) {
        assert!(self.live.remove(&slot.cap_ptr), "slot {} freed twice", slot.cap_ptr);
    }

    fn utspace_alloc(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
    ) -> Result<Cookie> {
        if self.fail_utspace {
            return Err(AllocError::OutOfMemory { size_bits });
        }
        self.utspace_allocs.push((size_bits, object_type, *dest));
        let cookie = Cookie(self.next_cookie);
        self.next_cookie += 1;
        Ok(cookie)
    }

    fn utspace_free(&mut self, cookie: Cookie, size_bits: usize) {
        self.utspace_frees.push((cookie, size_bits));
    }

    fn kernel(&mut self) -> &mut dyn KernelObjects {
        &mut self.kernel
    }
}
