//! Virtual kernel allocator interface
//!
//! [`Vka`] is what process, thread and address-space construction code
//! allocates through. It speaks in slot indices and retype sizes (the size
//! argument a kernel invocation takes) rather than paths and footprints, and
//! it is implemented by [`AllocMan`], by colour domains
//! ([`ColorVka`](crate::color::ColorVka)) and by [`DebugVka`], so any of them
//! can be handed to the same consumer.

use alloc::collections::{BTreeMap, BTreeSet};
use core::fmt;

use log::{error, warn};

use crate::allocman::AllocMan;
use crate::error::{AllocError, Result};
use crate::kernel::{CapRights, KernelObjects};
use crate::object::{
    object_size, ArchObjectType, ObjectType, HUGE_PAGE_BITS, LARGE_PAGE_BITS, PAGE_BITS,
};
use crate::path::CSpacePath;
use crate::utspace::Cookie;
use crate::{CPtr, Word};

/// Allocation interface for kernel object consumers
pub trait Vka {
    /// Allocate an empty slot
    fn cspace_alloc(&mut self) -> Result<CPtr>;

    fn cspace_make_path(&self, slot: CPtr) -> Result<CSpacePath>;

    /// Free a slot whose capability has already been deleted
    fn cspace_free(&mut self, slot: CPtr) -> Result<()>;

    /// Create an object from general purpose memory
    fn utspace_alloc(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
    ) -> Result<Cookie> {
        self.utspace_alloc_maybe_device(dest, object_type, size_bits, false)
    }

    /// Create an object, optionally accepting device memory
    fn utspace_alloc_maybe_device(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        can_use_device: bool,
    ) -> Result<Cookie>;

    /// Create an object at exactly `paddr`
    fn utspace_alloc_at(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        paddr: Word,
    ) -> Result<Cookie>;

    /// Free an object. Its type and size must match the allocation.
    fn utspace_free(&mut self, object_type: ObjectType, size_bits: usize, cookie: Cookie)
        -> Result<()>;

    fn utspace_paddr(&self, cookie: Cookie, object_type: ObjectType, size_bits: usize)
        -> Option<Word>;

    fn kernel(&mut self) -> &mut dyn KernelObjects;
}

impl Vka for AllocMan {
    fn cspace_alloc(&mut self) -> Result<CPtr> {
        AllocMan::cspace_alloc(self).map(|path| path.cap_ptr)
    }

    fn cspace_make_path(&self, slot: CPtr) -> Result<CSpacePath> {
        AllocMan::cspace_make_path(self, slot)
    }

    fn cspace_free(&mut self, slot: CPtr) -> Result<()> {
        let path = AllocMan::cspace_make_path(self, slot)?;
        AllocMan::cspace_free(self, &path)
    }

    fn utspace_alloc_maybe_device(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        can_use_device: bool,
    ) -> Result<Cookie> {
        let footprint = object_size(object_type, size_bits);
        AllocMan::utspace_alloc(self, footprint, object_type, dest, can_use_device)
    }

    fn utspace_alloc_at(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        paddr: Word,
    ) -> Result<Cookie> {
        let footprint = object_size(object_type, size_bits);
        AllocMan::utspace_alloc_at(self, footprint, object_type, dest, paddr, true)
    }

    fn utspace_free(
        &mut self,
        object_type: ObjectType,
        size_bits: usize,
        cookie: Cookie,
    ) -> Result<()> {
        AllocMan::utspace_free(self, cookie, object_size(object_type, size_bits))
    }

    fn utspace_paddr(
        &self,
        cookie: Cookie,
        object_type: ObjectType,
        size_bits: usize,
    ) -> Option<Word> {
        AllocMan::utspace_paddr(self, cookie, object_size(object_type, size_bits))
    }

    fn kernel(&mut self) -> &mut dyn KernelObjects {
        self.kernel_mut()
    }
}

/// A kernel object together with the slot it lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkaObject {
    pub cptr: CPtr,
    pub ut: Cookie,
    pub object_type: ObjectType,
    /// Retype size the object was created with
    pub size_bits: usize,
}

/// Allocate a slot and create an object of `object_type` in it
pub fn alloc_object<V: Vka + ?Sized>(
    vka: &mut V,
    object_type: ObjectType,
    size_bits: usize,
) -> Result<VkaObject> {
    let cptr = vka.cspace_alloc()?;
    let created = vka
        .cspace_make_path(cptr)
        .and_then(|path| vka.utspace_alloc(&path, object_type, size_bits));
    match created {
        Ok(ut) => Ok(VkaObject {
            cptr,
            ut,
            object_type,
            size_bits,
        }),
        Err(e) => {
            if let Err(free_err) = vka.cspace_free(cptr) {
                warn!("vka: failed to return slot {:#x}: {}", cptr, free_err);
            }
            Err(e)
        }
    }
}

/// Delete the object's capability, then free its memory and its slot
pub fn free_object<V: Vka + ?Sized>(vka: &mut V, object: &VkaObject) -> Result<()> {
    let path = vka.cspace_make_path(object.cptr)?;
    vka.kernel().delete(&path)?;
    vka.utspace_free(object.object_type, object.size_bits, object.ut)?;
    vka.cspace_free(object.cptr)
}

pub fn alloc_endpoint<V: Vka + ?Sized>(vka: &mut V) -> Result<VkaObject> {
    alloc_object(vka, ObjectType::Endpoint, 0)
}

pub fn alloc_notification<V: Vka + ?Sized>(vka: &mut V) -> Result<VkaObject> {
    alloc_object(vka, ObjectType::Notification, 0)
}

pub fn alloc_tcb<V: Vka + ?Sized>(vka: &mut V) -> Result<VkaObject> {
    alloc_object(vka, ObjectType::Tcb, 0)
}

pub fn alloc_reply<V: Vka + ?Sized>(vka: &mut V) -> Result<VkaObject> {
    alloc_object(vka, ObjectType::Reply, 0)
}

/// CNode with `2^slot_bits` slots
pub fn alloc_cnode<V: Vka + ?Sized>(vka: &mut V, slot_bits: usize) -> Result<VkaObject> {
    alloc_object(vka, ObjectType::CNode, slot_bits)
}

pub fn alloc_untyped<V: Vka + ?Sized>(vka: &mut V, size_bits: usize) -> Result<VkaObject> {
    alloc_object(vka, ObjectType::Untyped, size_bits)
}

/// Frame of `2^size_bits` bytes; only the architecture's page sizes exist
pub fn alloc_frame<V: Vka + ?Sized>(vka: &mut V, size_bits: usize) -> Result<VkaObject> {
    let object_type = if size_bits == PAGE_BITS {
        ObjectType::SMALL_PAGE
    } else if size_bits == LARGE_PAGE_BITS {
        ObjectType::LARGE_PAGE
    } else if size_bits == HUGE_PAGE_BITS {
        ObjectType::Arch(ArchObjectType::HugePage)
    } else {
        return Err(AllocError::InvalidArgument("no frame object of this size"));
    };
    alloc_object(vka, object_type, size_bits)
}

pub fn cnode_delete<V: Vka + ?Sized>(vka: &mut V, slot: CPtr) -> Result<()> {
    let path = vka.cspace_make_path(slot)?;
    vka.kernel().delete(&path)
}

pub fn cnode_copy<V: Vka + ?Sized>(
    vka: &mut V,
    dest: CPtr,
    src: CPtr,
    rights: CapRights,
) -> Result<()> {
    let dest = vka.cspace_make_path(dest)?;
    let src = vka.cspace_make_path(src)?;
    vka.kernel().copy(&dest, &src, rights)
}

pub fn cnode_mint<V: Vka + ?Sized>(
    vka: &mut V,
    dest: CPtr,
    src: CPtr,
    rights: CapRights,
    badge: Word,
) -> Result<()> {
    let dest = vka.cspace_make_path(dest)?;
    let src = vka.cspace_make_path(src)?;
    vka.kernel().mint(&dest, &src, rights, badge)
}

pub fn cnode_move<V: Vka + ?Sized>(vka: &mut V, dest: CPtr, src: CPtr) -> Result<()> {
    let dest = vka.cspace_make_path(dest)?;
    let src = vka.cspace_make_path(src)?;
    vka.kernel().move_cap(&dest, &src)
}

/// Entries a [`DebugVka`] tracks unless told otherwise
pub const DEFAULT_DEBUG_CAPACITY: usize = 4096;

fn violation(args: fmt::Arguments<'_>) -> ! {
    error!("vka misuse: {}", args);
    panic!("vka misuse: {}", args)
}

/// Wrapper that checks every call made through a [`Vka`]
///
/// Live slots and objects are kept in a bounded table. Freeing something
/// twice, freeing something that was never handed out, or freeing an
/// object with a different type or size than it was allocated with is a
/// programming error and aborts. So is running out of bookkeeping memory,
/// since the allocator cannot be trusted after that.
pub struct DebugVka<V> {
    inner: V,
    slots: BTreeSet<CPtr>,
    objects: BTreeMap<Cookie, (ObjectType, usize)>,
    capacity: usize,
}

impl<V: Vka> DebugVka<V> {
    pub fn new(inner: V) -> Self {
        Self::with_capacity(inner, DEFAULT_DEBUG_CAPACITY)
    }

    /// Track at most `capacity` slots and `capacity` objects
    pub fn with_capacity(inner: V, capacity: usize) -> Self {
        Self {
            inner,
            slots: BTreeSet::new(),
            objects: BTreeMap::new(),
            capacity,
        }
    }

    pub fn live_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn inner(&self) -> &V {
        &self.inner
    }

    pub fn into_inner(self) -> V {
        self.inner
    }

    /// Abort on exhausted bookkeeping, pass every other result through
    fn checked<T>(result: Result<T>) -> Result<T> {
        if let Err(AllocError::BookkeepingExhausted { bytes }) = result {
            violation(format_args!("bookkeeping exhausted allocating {} bytes", bytes));
        }
        result
    }

    fn track_object(&mut self, cookie: Cookie, object_type: ObjectType, size_bits: usize) {
        if self.objects.len() >= self.capacity {
            violation(format_args!("object table full ({} entries)", self.capacity));
        }
        if self.objects.insert(cookie, (object_type, size_bits)).is_some() {
            violation(format_args!("object {:#x} handed out twice", cookie.0));
        }
    }
}

impl<V: Vka> Vka for DebugVka<V> {
    fn cspace_alloc(&mut self) -> Result<CPtr> {
        let slot = Self::checked(self.inner.cspace_alloc())?;
        if self.slots.len() >= self.capacity {
            violation(format_args!("slot table full ({} entries)", self.capacity));
        }
        if !self.slots.insert(slot) {
            violation(format_args!("slot {:#x} handed out twice", slot));
        }
        Ok(slot)
    }

    fn cspace_make_path(&self, slot: CPtr) -> Result<CSpacePath> {
        self.inner.cspace_make_path(slot)
    }

    fn cspace_free(&mut self, slot: CPtr) -> Result<()> {
        if !self.slots.remove(&slot) {
            violation(format_args!("freed slot {:#x} that is not allocated", slot));
        }
        Self::checked(self.inner.cspace_free(slot))
    }

    fn utspace_alloc_maybe_device(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        can_use_device: bool,
    ) -> Result<Cookie> {
        let cookie = Self::checked(self.inner.utspace_alloc_maybe_device(
            dest,
            object_type,
            size_bits,
            can_use_device,
        ))?;
        self.track_object(cookie, object_type, size_bits);
        Ok(cookie)
    }

    fn utspace_alloc_at(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        paddr: Word,
    ) -> Result<Cookie> {
        let cookie = Self::checked(self.inner.utspace_alloc_at(dest, object_type, size_bits, paddr))?;
        self.track_object(cookie, object_type, size_bits);
        Ok(cookie)
    }

    fn utspace_free(
        &mut self,
        object_type: ObjectType,
        size_bits: usize,
        cookie: Cookie,
    ) -> Result<()> {
        match self.objects.remove(&cookie) {
            None => violation(format_args!(
                "freed object {:#x} that is not allocated",
                cookie.0
            )),
            Some(recorded) if recorded != (object_type, size_bits) => violation(format_args!(
                "object {:#x} allocated as {:?}/{} but freed as {:?}/{}",
                cookie.0, recorded.0, recorded.1, object_type, size_bits
            )),
            Some(_) => Self::checked(self.inner.utspace_free(object_type, size_bits, cookie)),
        }
    }

    fn utspace_paddr(
        &self,
        cookie: Cookie,
        object_type: ObjectType,
        size_bits: usize,
    ) -> Option<Word> {
        self.inner.utspace_paddr(cookie, object_type, size_bits)
    }

    fn kernel(&mut self) -> &mut dyn KernelObjects {
        self.inner.kernel()
    }
}
