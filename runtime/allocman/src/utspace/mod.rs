//! Untyped memory allocators
//!
//! A utspace allocator turns untyped regions into kernel objects. Callers
//! name the object by type and *footprint* (see [`crate::object`]) and
//! receive an opaque [`Cookie`] that must be handed back, together with the
//! same footprint, to free the object again.

pub mod split;
pub mod trickle;

use crate::allocman::Bookkeeping;
use crate::error::Result;
use crate::object::ObjectType;
use crate::path::CSpacePath;
use crate::Word;

pub use split::SplitUtSpace;
pub use trickle::TrickleUtSpace;

/// Handle to one allocated object, meaningful only to the allocator that
/// produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(pub Word);

/// Where an untyped region may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UntypedKind {
    /// General purpose memory
    Kernel,
    /// Device region; only handed out when requested by physical address
    Device,
    /// RAM inside a device region; handed out when the caller accepts device
    /// memory. Objects may not be zeroed and the kernel cannot write them.
    DeviceMemory,
}

impl UntypedKind {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        match self {
            UntypedKind::Kernel => 0,
            UntypedKind::Device => 1,
            UntypedKind::DeviceMemory => 2,
        }
    }

    /// Kinds an allocation may be served from, in preference order
    pub fn search_order(paddr: Option<Word>, can_use_device: bool) -> &'static [UntypedKind] {
        match (paddr, can_use_device) {
            (Some(_), _) => &[UntypedKind::Kernel, UntypedKind::DeviceMemory, UntypedKind::Device],
            (None, true) => &[UntypedKind::Kernel, UntypedKind::DeviceMemory],
            (None, false) => &[UntypedKind::Kernel],
        }
    }
}

/// An untyped capability handed to a utspace allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UntypedRegion {
    /// Slot holding the untyped capability
    pub path: CSpacePath,
    /// Size of the region in bits
    pub size_bits: usize,
    /// Physical address of the region, when known
    pub paddr: Option<Word>,
}

/// Interface every untyped allocator provides to an
/// [`AllocMan`](crate::AllocMan)
pub trait UtSpace {
    /// Take ownership of a batch of untyped regions of one kind
    fn add_uts(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        regions: &[UntypedRegion],
        kind: UntypedKind,
    ) -> Result<()>;

    /// Create an object with footprint `size_bits` into `dest`
    ///
    /// When `paddr` is given the object must start at exactly that physical
    /// address, and device regions become eligible.
    fn alloc(
        &mut self,
        ctx: &mut dyn Bookkeeping,
        size_bits: usize,
        object_type: ObjectType,
        dest: &CSpacePath,
        paddr: Option<Word>,
        can_use_device: bool,
    ) -> Result<Cookie>;

    /// Return the memory behind `cookie`; the object's capabilities must
    /// already have been deleted
    fn free(&mut self, ctx: &mut dyn Bookkeeping, cookie: Cookie, size_bits: usize) -> Result<()>;

    /// Physical address of an allocated object, if its region had one
    fn paddr(&self, cookie: Cookie, size_bits: usize) -> Option<Word>;
}
