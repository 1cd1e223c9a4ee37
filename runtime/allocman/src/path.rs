//! Capability paths
//!
//! A [`CSpacePath`] is everything an invocation needs to name one slot: the
//! root CNode it is resolved from, the index of the capability (with its
//! depth) and the destination CNode/offset pair used when the slot is the
//! target of a retype or copy.

use crate::{CPtr, Word};

/// A fully resolved reference to one capability slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CSpacePath {
    /// CNode the lookup starts from
    pub root: CPtr,
    /// Address of the slot itself
    pub cap_ptr: CPtr,
    /// Number of bits of `cap_ptr` that are resolved
    pub cap_depth: usize,
    /// Address of the CNode that contains the slot
    pub dest: CPtr,
    /// Number of bits of `dest` that are resolved
    pub dest_depth: usize,
    /// Index of the slot inside `dest`
    pub offset: Word,
}

impl CSpacePath {
    /// The empty path. Never refers to a usable slot.
    pub const fn null() -> Self {
        Self {
            root: 0,
            cap_ptr: 0,
            cap_depth: 0,
            dest: 0,
            dest_depth: 0,
            offset: 0,
        }
    }

    /// Join a slot in a first level table with a slot of the table it points to
    ///
    /// Only the addressing contract of the two paths is used, so `inner` may
    /// itself be the result of another composition.
    pub fn compose(outer: &CSpacePath, inner: &CSpacePath) -> CSpacePath {
        CSpacePath {
            root: outer.root,
            cap_ptr: (outer.cap_ptr << inner.cap_depth) | inner.cap_ptr,
            cap_depth: outer.cap_depth + inner.cap_depth,
            dest: (outer.cap_ptr << inner.dest_depth) | inner.dest,
            dest_depth: outer.cap_depth + inner.dest_depth,
            offset: inner.offset,
        }
    }
}
