//! Allocation manager
//!
//! [`AllocMan`] owns one bookkeeping pool, one cspace and one utspace and
//! wires them together. Components never call back into the public entry
//! points; they receive the manager as a [`Bookkeeping`] context instead.
//!
//! # Reserve protocol
//!
//! A component that is already running cannot be re-entered. If, while the
//! utspace is busy splitting a block, it asks for another object (or the
//! cspace asks for a slot while creating a second level), the request is
//! served from a reserve of pre-created slots, bookkeeping chunks and
//! objects. Frees that arrive for a busy component are queued.
//!
//! Every public operation that is not nested inside another one ends with a
//! refill: queued frees are drained and the reserves are topped back up to
//! their quotas. The refill is best effort and its failure is not an error
//! for the operation that triggered it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use log::{info, warn};

use crate::config::{MspaceReserve, ReserveConfig, UtspaceReserve};
use crate::cspace::CSpace;
use crate::error::{AllocError, Component, Result};
use crate::kernel::KernelObjects;
use crate::mspace::{MChunk, MSpace};
use crate::object::ObjectType;
use crate::path::CSpacePath;
use crate::utspace::{Cookie, UntypedKind, UntypedRegion, UtSpace};
use crate::{CPtr, Word};

/// Rounds of the refill that ends every operation
const REFILL_ROUNDS: usize = 4;

/// Resources a running component may need while it works
///
/// Calls made through this context never trigger a reserve refill and fall
/// back to the reserve when the backing component is busy or exhausted.
pub trait Bookkeeping {
    fn mspace_alloc(&mut self, bytes: usize) -> Result<MChunk>;
    fn mspace_free(&mut self, chunk: MChunk);
    fn cspace_alloc(&mut self) -> Result<CSpacePath>;
    /// Return a slot; failures are logged, as the caller cannot act on them
    fn cspace_free(&mut self, slot: &CSpacePath);
    fn utspace_alloc(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
    ) -> Result<Cookie>;
    fn utspace_free(&mut self, cookie: Cookie, size_bits: usize);
    fn kernel(&mut self) -> &mut dyn KernelObjects;
}

enum Attached<T: ?Sized> {
    Detached,
    Ready(Box<T>),
    /// Taken out while one of its operations runs
    Busy,
}

impl<T: ?Sized> Attached<T> {
    /// Take the component out, leaving it busy. `None` if it already is.
    fn take(&mut self, which: Component) -> Result<Option<Box<T>>> {
        match mem::replace(self, Attached::Busy) {
            Attached::Ready(inner) => Ok(Some(inner)),
            Attached::Busy => Ok(None),
            Attached::Detached => {
                *self = Attached::Detached;
                Err(AllocError::NotAttached(which))
            }
        }
    }

    fn restore(&mut self, inner: Box<T>) {
        *self = Attached::Ready(inner);
    }
}

struct MspaceBucket {
    size: usize,
    count: usize,
    held: Vec<MChunk>,
    chunk: MChunk,
}

struct UtspaceBucket {
    size_bits: usize,
    object_type: ObjectType,
    count: usize,
    /// Objects already created, each in its own slot
    held: Vec<(Cookie, CSpacePath)>,
    chunk: MChunk,
}

/// A bounded array whose storage is charged to the bookkeeping pool
struct Charged<T> {
    items: Vec<T>,
    limit: usize,
    chunk: Option<MChunk>,
}

impl<T> Charged<T> {
    const fn new() -> Self {
        Self {
            items: Vec::new(),
            limit: 0,
            chunk: None,
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }
}

#[derive(Default)]
struct Reserve {
    slots: Option<Charged<CSpacePath>>,
    freed_slots: Option<Charged<CSpacePath>>,
    freed_untypeds: Option<Charged<(Cookie, usize)>>,
    mspace: Vec<MspaceBucket>,
    utspace: Vec<UtspaceBucket>,
}

impl Reserve {
    fn slots(&mut self) -> &mut Option<Charged<CSpacePath>> {
        &mut self.slots
    }

    fn freed_slots(&mut self) -> &mut Option<Charged<CSpacePath>> {
        &mut self.freed_slots
    }

    fn freed_untypeds(&mut self) -> &mut Option<Charged<(Cookie, usize)>> {
        &mut self.freed_untypeds
    }

    /// Bookkeeping bytes the reserve's own arrays are charged for
    fn charged_bytes(&self) -> usize {
        let charged = |c: Option<MChunk>| c.map_or(0, |c| c.size);
        charged(self.slots.as_ref().and_then(|r| r.chunk))
            + charged(self.freed_slots.as_ref().and_then(|r| r.chunk))
            + charged(self.freed_untypeds.as_ref().and_then(|r| r.chunk))
            + self.mspace.iter().map(|b| b.chunk.size).sum::<usize>()
            + self.utspace.iter().map(|b| b.chunk.size).sum::<usize>()
    }
}

/// Fill level of one reserve bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStatus {
    pub held: usize,
    pub quota: usize,
}

impl BucketStatus {
    pub fn is_full(&self) -> bool {
        self.held >= self.quota
    }
}

/// Snapshot of the reserve pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveStatus {
    pub cspace_slots: BucketStatus,
    /// `(chunk size, fill)` per bookkeeping reserve
    pub mspace: Vec<(usize, BucketStatus)>,
    /// `(size_bits, object type, fill)` per object reserve
    pub utspace: Vec<(usize, ObjectType, BucketStatus)>,
    pub queued_slot_frees: usize,
    pub queued_untyped_frees: usize,
    /// Bookkeeping memory charged for the reserve arrays themselves
    pub charged_bytes: usize,
}

impl ReserveStatus {
    /// Every reserve at its quota and nothing waiting to be freed
    pub fn is_full(&self) -> bool {
        self.cspace_slots.is_full()
            && self.mspace.iter().all(|(_, b)| b.is_full())
            && self.utspace.iter().all(|(_, _, b)| b.is_full())
            && self.queued_slot_frees == 0
            && self.queued_untyped_frees == 0
    }
}

/// The allocation manager
pub struct AllocMan {
    mspace: Box<dyn MSpace>,
    kernel: Box<dyn KernelObjects>,
    cspace: Attached<dyn CSpace>,
    utspace: Attached<dyn UtSpace>,
    in_operation: bool,
    used_reserve: bool,
    refilling: bool,
    reserve: Reserve,
}

impl AllocMan {
    /// Create a manager around a bookkeeping pool. A cspace and a utspace
    /// must be attached before slots or objects can be allocated.
    pub fn new(mspace: impl MSpace + 'static, kernel: impl KernelObjects + 'static) -> Self {
        Self {
            mspace: Box::new(mspace),
            kernel: Box::new(kernel),
            cspace: Attached::Detached,
            utspace: Attached::Detached,
            in_operation: false,
            used_reserve: false,
            refilling: false,
            reserve: Reserve::default(),
        }
    }

    pub fn attach_cspace(&mut self, cspace: impl CSpace + 'static) -> Result<()> {
        if !matches!(self.cspace, Attached::Detached) {
            return Err(AllocError::AlreadyAttached(Component::CSpace));
        }
        self.cspace = Attached::Ready(Box::new(cspace));
        self.operation(|_| ());
        Ok(())
    }

    pub fn attach_utspace(&mut self, utspace: impl UtSpace + 'static) -> Result<()> {
        if !matches!(self.utspace, Attached::Detached) {
            return Err(AllocError::AlreadyAttached(Component::UtSpace));
        }
        self.utspace = Attached::Ready(Box::new(utspace));
        self.operation(|_| ());
        Ok(())
    }

    /// Remove the cspace so a different one can be attached
    pub fn detach_cspace(&mut self) -> Result<Box<dyn CSpace>> {
        match mem::replace(&mut self.cspace, Attached::Detached) {
            Attached::Ready(cspace) => Ok(cspace),
            other => {
                self.cspace = other;
                Err(AllocError::NotAttached(Component::CSpace))
            }
        }
    }

    /// Remove the utspace so a different one can be attached
    pub fn detach_utspace(&mut self) -> Result<Box<dyn UtSpace>> {
        match mem::replace(&mut self.utspace, Attached::Detached) {
            Attached::Ready(utspace) => Ok(utspace),
            other => {
                self.utspace = other;
                Err(AllocError::NotAttached(Component::UtSpace))
            }
        }
    }

    /// Invocation interface used by every component
    pub fn kernel_mut(&mut self) -> &mut dyn KernelObjects {
        self.kernel.as_mut()
    }

    fn start_operation(&mut self) -> bool {
        let root = !self.in_operation;
        self.in_operation = true;
        root
    }

    fn end_operation(&mut self, root: bool) {
        if root {
            self.in_operation = false;
            self.refill_reserves(Some(REFILL_ROUNDS));
        }
    }

    fn operation<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let root = self.start_operation();
        let result = f(self);
        self.end_operation(root);
        result
    }

    // -- mspace -----------------------------------------------------------

    fn mspace_alloc_inner(&mut self, bytes: usize, use_reserve: bool) -> Result<MChunk> {
        match self.mspace.alloc(bytes) {
            Ok(chunk) => Ok(chunk),
            Err(e) if use_reserve => self.take_reserved_chunk(bytes).ok_or(e),
            Err(e) => Err(e),
        }
    }

    fn take_reserved_chunk(&mut self, bytes: usize) -> Option<MChunk> {
        let bucket = self
            .reserve
            .mspace
            .iter_mut()
            .find(|b| b.size == bytes && !b.held.is_empty())?;
        let chunk = bucket.held.pop()?;
        self.used_reserve = true;
        info!("allocman: served {} byte chunk from reserve", bytes);
        Some(chunk)
    }

    /// Allocate bookkeeping memory
    pub fn mspace_alloc(&mut self, bytes: usize) -> Result<MChunk> {
        self.operation(|this| this.mspace_alloc_inner(bytes, true))
    }

    pub fn mspace_free(&mut self, chunk: MChunk) {
        if let Err(e) = self.mspace.free(chunk) {
            warn!("allocman: dropped free of bookkeeping chunk {:?}: {}", chunk, e);
        }
    }

    // -- cspace -----------------------------------------------------------

    fn cspace_alloc_inner(&mut self, use_reserve: bool) -> Result<CSpacePath> {
        let Some(mut cspace) = self.cspace.take(Component::CSpace)? else {
            return if use_reserve {
                self.take_reserved_slot()
            } else {
                Err(AllocError::OutOfSlots)
            };
        };
        let root = self.start_operation();
        let result = cspace.alloc(self);
        self.cspace.restore(cspace);
        let result = match result {
            Err(e) if use_reserve => self.take_reserved_slot().map_err(|_| e),
            other => other,
        };
        self.end_operation(root);
        result
    }

    fn take_reserved_slot(&mut self) -> Result<CSpacePath> {
        let slot = self
            .reserve
            .slots
            .as_mut()
            .and_then(|r| r.items.pop())
            .ok_or(AllocError::OutOfSlots)?;
        self.used_reserve = true;
        info!("allocman: served slot from reserve");
        Ok(slot)
    }

    fn cspace_free_inner(&mut self, slot: &CSpacePath) -> Result<()> {
        let Some(mut cspace) = self.cspace.take(Component::CSpace)? else {
            Self::queue(&mut self.reserve.freed_slots, *slot, "slot");
            return Ok(());
        };
        let root = self.start_operation();
        let result = cspace.free(self, slot);
        self.cspace.restore(cspace);
        self.end_operation(root);
        result
    }

    fn queue<T>(queue: &mut Option<Charged<T>>, item: T, what: &str) {
        match queue {
            Some(q) if !q.is_full() => q.items.push(item),
            _ => warn!("allocman: no room to queue freed {}, leaking it", what),
        }
    }

    /// Allocate an empty slot
    pub fn cspace_alloc(&mut self) -> Result<CSpacePath> {
        self.cspace_alloc_inner(true)
    }

    /// Mark a specific slot as allocated
    pub fn cspace_alloc_at(&mut self, slot: CPtr) -> Result<()> {
        let mut cspace = self
            .cspace
            .take(Component::CSpace)?
            .ok_or(AllocError::NotAttached(Component::CSpace))?;
        let root = self.start_operation();
        let result = cspace.alloc_at(self, slot);
        self.cspace.restore(cspace);
        self.end_operation(root);
        result
    }

    /// Free a slot. The capability in it must already have been deleted.
    pub fn cspace_free(&mut self, slot: &CSpacePath) -> Result<()> {
        self.cspace_free_inner(slot)
    }

    pub fn cspace_make_path(&self, slot: CPtr) -> Result<CSpacePath> {
        match &self.cspace {
            Attached::Ready(cspace) => Ok(cspace.make_path(slot)),
            _ => Err(AllocError::NotAttached(Component::CSpace)),
        }
    }

    // -- utspace ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn utspace_alloc_inner(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
        paddr: Option<Word>,
        can_use_device: bool,
        use_reserve: bool,
    ) -> Result<Cookie> {
        let use_reserve = use_reserve && paddr.is_none();
        let Some(mut utspace) = self.utspace.take(Component::UtSpace)? else {
            return if use_reserve {
                self.take_reserved_object(size_bits, object_type, dest)
            } else {
                Err(AllocError::OutOfMemory { size_bits })
            };
        };
        let root = self.start_operation();
        let result = utspace.alloc(self, size_bits, object_type, dest, paddr, can_use_device);
        self.utspace.restore(utspace);
        let result = match result {
            Err(e) if use_reserve => self
                .take_reserved_object(size_bits, object_type, dest)
                .map_err(|_| e),
            other => other,
        };
        self.end_operation(root);
        result
    }

    fn take_reserved_object(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
    ) -> Result<Cookie> {
        let bucket = self
            .reserve
            .utspace
            .iter_mut()
            .find(|b| b.size_bits == size_bits && b.object_type == object_type && !b.held.is_empty())
            .ok_or(AllocError::OutOfMemory { size_bits })?;
        let (cookie, slot) = bucket.held.pop().ok_or(AllocError::OutOfMemory { size_bits })?;

        if let Err(e) = self.kernel.move_cap(dest, &slot) {
            if let Some(bucket) = self
                .reserve
                .utspace
                .iter_mut()
                .find(|b| b.size_bits == size_bits && b.object_type == object_type)
            {
                bucket.held.push((cookie, slot));
            }
            return Err(e);
        }
        self.used_reserve = true;
        info!(
            "allocman: served {:?} of 2^{} bytes from reserve",
            object_type, size_bits
        );
        if let Err(e) = self.cspace_free_inner(&slot) {
            warn!("allocman: failed to return reserve slot: {}", e);
        }
        Ok(cookie)
    }

    fn utspace_free_inner(&mut self, cookie: Cookie, size_bits: usize) -> Result<()> {
        let Some(mut utspace) = self.utspace.take(Component::UtSpace)? else {
            Self::queue(&mut self.reserve.freed_untypeds, (cookie, size_bits), "object");
            return Ok(());
        };
        let root = self.start_operation();
        let result = utspace.free(self, cookie, size_bits);
        self.utspace.restore(utspace);
        self.end_operation(root);
        result
    }

    /// Create an object of footprint `size_bits` into `dest`
    pub fn utspace_alloc(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
        can_use_device: bool,
    ) -> Result<Cookie> {
        self.utspace_alloc_inner(size_bits, object_type, dest, None, can_use_device, true)
    }

    /// Create an object at physical address `paddr`. Unless `exact` is set,
    /// an object anywhere else is acceptable when `paddr` is unavailable.
    pub fn utspace_alloc_at(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
        paddr: Word,
        exact: bool,
    ) -> Result<Cookie> {
        match self.utspace_alloc_inner(size_bits, object_type, dest, Some(paddr), true, true) {
            Err(AllocError::OutOfMemory { .. }) if !exact => {
                self.utspace_alloc_inner(size_bits, object_type, dest, None, false, true)
            }
            other => other,
        }
    }

    /// Free an object. Every capability to it must already have been deleted.
    pub fn utspace_free(&mut self, cookie: Cookie, size_bits: usize) -> Result<()> {
        self.utspace_free_inner(cookie, size_bits)
    }

    pub fn utspace_paddr(&self, cookie: Cookie, size_bits: usize) -> Option<Word> {
        match &self.utspace {
            Attached::Ready(utspace) => utspace.paddr(cookie, size_bits),
            _ => None,
        }
    }

    /// Hand untyped regions to the attached utspace
    pub fn add_untypeds(&mut self, regions: &[UntypedRegion], kind: UntypedKind) -> Result<()> {
        let mut utspace = self
            .utspace
            .take(Component::UtSpace)?
            .ok_or(AllocError::NotAttached(Component::UtSpace))?;
        let root = self.start_operation();
        let result = utspace.add_uts(self, regions, kind);
        self.utspace.restore(utspace);
        self.end_operation(root);
        result
    }

    // -- reserves ---------------------------------------------------------

    /// Replace the storage charged for an array of `count` items of `T`
    fn recharge<T>(&mut self, old: Option<MChunk>, count: usize) -> Result<MChunk> {
        let chunk = self.mspace_alloc_inner(count.max(1) * mem::size_of::<T>().max(1), true)?;
        if let Some(old) = old {
            self.mspace_free(old);
        }
        Ok(chunk)
    }

    fn resize<T>(
        &mut self,
        which: fn(&mut Reserve) -> &mut Option<Charged<T>>,
        limit: usize,
    ) -> Result<()> {
        self.operation(|this| {
            let current = which(&mut this.reserve).as_ref().map_or(0, |r| r.items.len());
            if limit < current {
                return Err(AllocError::InvalidArgument("reserve smaller than its contents"));
            }
            let old = which(&mut this.reserve).as_ref().and_then(|r| r.chunk);
            let chunk = this.recharge::<T>(old, limit)?;
            let reserve = which(&mut this.reserve).get_or_insert_with(Charged::new);
            reserve.limit = limit;
            reserve.chunk = Some(chunk);
            this.used_reserve = true;
            Ok(())
        })
    }

    /// Keep `count` empty slots in reserve
    pub fn configure_cspace_reserve(&mut self, count: usize) -> Result<()> {
        self.resize(Reserve::slots, count)
    }

    /// Allow up to `count` slot frees to be queued while the cspace is busy
    pub fn configure_max_freed_slots(&mut self, count: usize) -> Result<()> {
        self.resize(Reserve::freed_slots, count)
    }

    /// Allow up to `count` object frees to be queued while the utspace is busy
    pub fn configure_max_freed_untyped_chunks(&mut self, count: usize) -> Result<()> {
        self.resize(Reserve::freed_untypeds, count)
    }

    /// Keep bookkeeping chunks of one size in reserve
    pub fn configure_mspace_reserve(&mut self, reserve: MspaceReserve) -> Result<()> {
        if self.reserve.mspace.iter().any(|b| b.size == reserve.size) {
            return Err(AllocError::ReserveExists);
        }
        self.operation(|this| {
            let chunk = this.recharge::<MChunk>(None, reserve.count)?;
            this.reserve.mspace.push(MspaceBucket {
                size: reserve.size,
                count: reserve.count,
                held: Vec::with_capacity(reserve.count),
                chunk,
            });
            this.used_reserve = true;
            Ok(())
        })
    }

    /// Keep pre-created objects of one type and size in reserve
    pub fn configure_utspace_reserve(&mut self, reserve: UtspaceReserve) -> Result<()> {
        if self
            .reserve
            .utspace
            .iter()
            .any(|b| b.size_bits == reserve.size_bits && b.object_type == reserve.object_type)
        {
            return Err(AllocError::ReserveExists);
        }
        self.operation(|this| {
            let chunk = this.recharge::<(Cookie, CSpacePath)>(None, reserve.count)?;
            this.reserve.utspace.push(UtspaceBucket {
                size_bits: reserve.size_bits,
                object_type: reserve.object_type,
                count: reserve.count,
                held: Vec::with_capacity(reserve.count),
                chunk,
            });
            this.used_reserve = true;
            Ok(())
        })
    }

    /// Apply a whole reserve configuration
    pub fn configure_reserves(&mut self, config: &ReserveConfig) -> Result<()> {
        self.configure_max_freed_slots(config.max_freed_slots)?;
        self.configure_max_freed_untyped_chunks(config.max_freed_untyped_chunks)?;
        self.configure_cspace_reserve(config.cspace_slots)
    }

    /// Top every reserve up to its quota. Returns whether all of them are full.
    ///
    /// Unlike the refill that follows every operation, this keeps going for
    /// as long as any reserve grows.
    pub fn fill_reserves(&mut self) -> bool {
        let root = self.start_operation();
        self.used_reserve = true;
        let full = self.refill_reserves(None);
        self.end_operation(root);
        full
    }

    pub fn reserve_status(&self) -> ReserveStatus {
        let charged = |c: &Option<Charged<CSpacePath>>| BucketStatus {
            held: c.as_ref().map_or(0, |r| r.items.len()),
            quota: c.as_ref().map_or(0, |r| r.limit),
        };
        ReserveStatus {
            cspace_slots: charged(&self.reserve.slots),
            mspace: self
                .reserve
                .mspace
                .iter()
                .map(|b| (b.size, BucketStatus { held: b.held.len(), quota: b.count }))
                .collect(),
            utspace: self
                .reserve
                .utspace
                .iter()
                .map(|b| {
                    (
                        b.size_bits,
                        b.object_type,
                        BucketStatus { held: b.held.len(), quota: b.count },
                    )
                })
                .collect(),
            queued_slot_frees: self.reserve.freed_slots.as_ref().map_or(0, |q| q.items.len()),
            queued_untyped_frees: self.reserve.freed_untypeds.as_ref().map_or(0, |q| q.items.len()),
            charged_bytes: self.reserve.charged_bytes(),
        }
    }

    /// Drain queued frees and top up the reserves, one item per reserve per
    /// round. Returns whether every reserve is full.
    fn refill_reserves(&mut self, max_rounds: Option<usize>) -> bool {
        if self.refilling || !self.used_reserve {
            return !self.used_reserve;
        }
        self.refilling = true;

        let mut rounds = 0;
        let mut found_empty;
        loop {
            found_empty = false;
            let mut progress = false;

            while let Some(slot) = self.reserve.freed_slots.as_mut().and_then(|q| q.items.pop()) {
                if let Err(e) = self.cspace_free_inner(&slot) {
                    warn!("allocman: queued slot free failed: {}", e);
                }
                progress = true;
            }
            while let Some((cookie, size_bits)) =
                self.reserve.freed_untypeds.as_mut().and_then(|q| q.items.pop())
            {
                if let Err(e) = self.utspace_free_inner(cookie, size_bits) {
                    warn!("allocman: queued object free failed: {}", e);
                }
                progress = true;
            }

            if self.reserve.slots.as_ref().is_some_and(|r| !r.is_full()) {
                found_empty = true;
                if let Ok(slot) = self.cspace_alloc_inner(false) {
                    if let Some(r) = self.reserve.slots.as_mut() {
                        r.items.push(slot);
                    }
                    progress = true;
                }
            }

            for i in 0..self.reserve.utspace.len() {
                let bucket = &self.reserve.utspace[i];
                if bucket.held.len() >= bucket.count {
                    continue;
                }
                found_empty = true;
                let (size_bits, object_type) = (bucket.size_bits, bucket.object_type);
                let Ok(slot) = self.cspace_alloc_inner(true) else {
                    continue;
                };
                match self.utspace_alloc_inner(size_bits, object_type, &slot, None, false, false) {
                    Ok(cookie) => {
                        self.reserve.utspace[i].held.push((cookie, slot));
                        progress = true;
                    }
                    Err(_) => {
                        if let Err(e) = self.cspace_free_inner(&slot) {
                            warn!("allocman: failed to return refill slot: {}", e);
                        }
                    }
                }
            }

            for i in 0..self.reserve.mspace.len() {
                let bucket = &self.reserve.mspace[i];
                if bucket.held.len() >= bucket.count {
                    continue;
                }
                found_empty = true;
                let size = bucket.size;
                if let Ok(chunk) = self.mspace_alloc_inner(size, false) {
                    self.reserve.mspace[i].held.push(chunk);
                    progress = true;
                }
            }

            rounds += 1;
            if !(found_empty && progress && max_rounds.map_or(true, |max| rounds < max)) {
                break;
            }
        }

        self.refilling = false;
        if found_empty {
            info!("allocman: reserves not full after {} rounds", rounds);
        } else {
            self.used_reserve = false;
        }
        !found_empty
    }
}

impl Bookkeeping for AllocMan {
    fn mspace_alloc(&mut self, bytes: usize) -> Result<MChunk> {
        AllocMan::mspace_alloc(self, bytes)
    }

    fn mspace_free(&mut self, chunk: MChunk) {
        AllocMan::mspace_free(self, chunk)
    }

    fn cspace_alloc(&mut self) -> Result<CSpacePath> {
        AllocMan::cspace_alloc(self)
    }

    fn cspace_free(&mut self, slot: &CSpacePath) {
        if let Err(e) = AllocMan::cspace_free(self, slot) {
            warn!("allocman: failed to free slot {:#x}: {}", slot.cap_ptr, e);
        }
    }

    fn utspace_alloc(
        &mut self,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
    ) -> Result<Cookie> {
        AllocMan::utspace_alloc(self, size_bits, object_type, dest, false)
    }

    fn utspace_free(&mut self, cookie: Cookie, size_bits: usize) {
        if let Err(e) = AllocMan::utspace_free(self, cookie, size_bits) {
            warn!("allocman: failed to free object {:#x}: {}", cookie.0, e);
        }
    }

    fn kernel(&mut self) -> &mut dyn KernelObjects {
        self.kernel.as_mut()
    }
}
