//! Kernel object invocations
//!
//! The allocators never issue system calls directly. Retyping untyped memory
//! and moving capabilities between slots goes through [`KernelObjects`], which
//! the owner of an [`AllocMan`](crate::AllocMan) supplies once at
//! construction. [`Sel4Kernel`] forwards to the platform bindings;
//! [`RecordingKernel`] keeps a log of every invocation and is used to drive
//! the allocators in tests and on development hosts.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use bitflags::bitflags;
use sel4_platform::adapter as sel4;

use crate::error::{AllocError, Result};
use crate::object::ObjectType;
use crate::path::CSpacePath;
use crate::Word;

/// Error code returned by a rejected invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError(pub i32);

impl KernelError {
    pub const INVALID_ARGUMENT: Self = Self(sel4::seL4_InvalidArgument);
    pub const NOT_ENOUGH_MEMORY: Self = Self(sel4::seL4_NotEnoughMemory);
    pub const DELETE_FIRST: Self = Self(sel4::seL4_DeleteFirst);
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            sel4::seL4_InvalidArgument => "InvalidArgument",
            sel4::seL4_InvalidCapability => "InvalidCapability",
            sel4::seL4_IllegalOperation => "IllegalOperation",
            sel4::seL4_RangeError => "RangeError",
            sel4::seL4_AlignmentError => "AlignmentError",
            sel4::seL4_FailedLookup => "FailedLookup",
            sel4::seL4_TruncatedMessage => "TruncatedMessage",
            sel4::seL4_DeleteFirst => "DeleteFirst",
            sel4::seL4_RevokeFirst => "RevokeFirst",
            sel4::seL4_NotEnoughMemory => "NotEnoughMemory",
            _ => return write!(f, "error {}", self.0),
        };
        f.write_str(name)
    }
}

impl From<KernelError> for AllocError {
    fn from(error: KernelError) -> Self {
        AllocError::Kernel { error }
    }
}

fn check(error: sel4::Error) -> Result<()> {
    if sel4::is_ok(error) {
        Ok(())
    } else {
        Err(KernelError(error).into())
    }
}

bitflags! {
    /// Rights carried by a capability
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapRights: Word {
        const WRITE       = sel4::seL4_CanWrite;
        const READ        = sel4::seL4_CanRead;
        const GRANT       = sel4::seL4_CanGrant;
        const GRANT_REPLY = sel4::seL4_CanGrantReply;
        const ALL         = sel4::seL4_AllRights;
    }
}

/// Invocations the allocators need from the kernel
pub trait KernelObjects {
    /// Create one object of `object_type` from `untyped`, starting `offset`
    /// bytes into it, and place its capability in `dest`
    fn retype(
        &mut self,
        untyped: &CSpacePath,
        object_type: ObjectType,
        offset: Word,
        size_bits: usize,
        dest: &CSpacePath,
    ) -> Result<()>;

    /// Remove the capability in `slot`
    fn delete(&mut self, slot: &CSpacePath) -> Result<()>;

    /// Copy the capability in `src` to `dest`, keeping only `rights`
    fn copy(&mut self, dest: &CSpacePath, src: &CSpacePath, rights: CapRights) -> Result<()>;

    /// Copy the capability in `src` to `dest` with new rights and badge
    fn mint(
        &mut self,
        dest: &CSpacePath,
        src: &CSpacePath,
        rights: CapRights,
        badge: Word,
    ) -> Result<()>;

    /// Move the capability in `src` to `dest`, leaving `src` empty
    fn move_cap(&mut self, dest: &CSpacePath, src: &CSpacePath) -> Result<()>;
}

/// Invocations through the platform bindings
#[derive(Debug, Default, Clone, Copy)]
pub struct Sel4Kernel;

impl KernelObjects for Sel4Kernel {
    fn retype(
        &mut self,
        untyped: &CSpacePath,
        object_type: ObjectType,
        offset: Word,
        size_bits: usize,
        dest: &CSpacePath,
    ) -> Result<()> {
        let error = unsafe {
            sel4::seL4_Untyped_RetypeAtOffset(
                untyped.cap_ptr,
                object_type.to_sel4(),
                offset,
                size_bits,
                dest.root,
                dest.dest,
                dest.dest_depth,
                dest.offset,
                1,
            )
        };
        check(error)
    }

    fn delete(&mut self, slot: &CSpacePath) -> Result<()> {
        let error = unsafe {
            sel4::seL4_CNode_Delete(slot.root, slot.cap_ptr, sel4::depth(slot.cap_depth))
        };
        check(error)
    }

    fn copy(&mut self, dest: &CSpacePath, src: &CSpacePath, rights: CapRights) -> Result<()> {
        let error = unsafe {
            sel4::seL4_CNode_Copy(
                dest.root,
                dest.cap_ptr,
                sel4::depth(dest.cap_depth),
                src.root,
                src.cap_ptr,
                sel4::depth(src.cap_depth),
                rights.bits(),
            )
        };
        check(error)
    }

    fn mint(
        &mut self,
        dest: &CSpacePath,
        src: &CSpacePath,
        rights: CapRights,
        badge: Word,
    ) -> Result<()> {
        let error = unsafe {
            sel4::seL4_CNode_Mint(
                dest.root,
                dest.cap_ptr,
                sel4::depth(dest.cap_depth),
                src.root,
                src.cap_ptr,
                sel4::depth(src.cap_depth),
                rights.bits(),
                badge,
            )
        };
        check(error)
    }

    fn move_cap(&mut self, dest: &CSpacePath, src: &CSpacePath) -> Result<()> {
        let error = unsafe {
            sel4::seL4_CNode_Move(
                dest.root,
                dest.cap_ptr,
                sel4::depth(dest.cap_depth),
                src.root,
                src.cap_ptr,
                sel4::depth(src.cap_depth),
            )
        };
        check(error)
    }
}

/// One invocation seen by a [`RecordingKernel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    Retype {
        untyped: CSpacePath,
        object_type: ObjectType,
        offset: Word,
        size_bits: usize,
        dest: CSpacePath,
    },
    Delete {
        slot: CSpacePath,
    },
    Copy {
        dest: CSpacePath,
        src: CSpacePath,
        rights: CapRights,
    },
    Mint {
        dest: CSpacePath,
        src: CSpacePath,
        rights: CapRights,
        badge: Word,
    },
    Move {
        dest: CSpacePath,
        src: CSpacePath,
    },
}

/// Which invocation a scheduled failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Retype,
    Delete,
    Copy,
    Mint,
    Move,
}

impl Invocation {
    pub fn kind(&self) -> InvocationKind {
        match self {
            Invocation::Retype { .. } => InvocationKind::Retype,
            Invocation::Delete { .. } => InvocationKind::Delete,
            Invocation::Copy { .. } => InvocationKind::Copy,
            Invocation::Mint { .. } => InvocationKind::Mint,
            Invocation::Move { .. } => InvocationKind::Move,
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    invocations: Vec<Invocation>,
    /// Scheduled failures with the number of matching invocations to let
    /// through first
    failures: Vec<(InvocationKind, usize, KernelError)>,
}

/// Kernel stand-in that records every invocation
///
/// Clones share one journal, so a test can keep a handle after moving the
/// kernel into an allocator. Failures can be scheduled per invocation kind;
/// each scheduled failure rejects exactly one matching invocation, which is
/// then not recorded.
#[derive(Debug, Default, Clone)]
pub struct RecordingKernel {
    journal: Rc<RefCell<Journal>>,
}

impl RecordingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next invocation of `kind` with `error`
    pub fn fail_next(&self, kind: InvocationKind, error: KernelError) {
        self.fail_after(kind, 0, error);
    }

    /// Let `skip` invocations of `kind` succeed, then reject one with `error`
    pub fn fail_after(&self, kind: InvocationKind, skip: usize, error: KernelError) {
        self.journal.borrow_mut().failures.push((kind, skip, error));
    }

    /// All successful invocations, oldest first
    pub fn invocations(&self) -> Vec<Invocation> {
        self.journal.borrow().invocations.clone()
    }

    /// Successful retypes, oldest first
    pub fn retypes(&self) -> Vec<Invocation> {
        self.of_kind(InvocationKind::Retype)
    }

    pub fn of_kind(&self, kind: InvocationKind) -> Vec<Invocation> {
        self.journal
            .borrow()
            .invocations
            .iter()
            .filter(|inv| inv.kind() == kind)
            .copied()
            .collect()
    }

    pub fn count(&self, kind: InvocationKind) -> usize {
        self.journal
            .borrow()
            .invocations
            .iter()
            .filter(|inv| inv.kind() == kind)
            .count()
    }

    fn record(&mut self, invocation: Invocation) -> Result<()> {
        let mut journal = self.journal.borrow_mut();
        let kind = invocation.kind();
        if let Some(pos) = journal.failures.iter().position(|(k, _, _)| *k == kind) {
            let skip = &mut journal.failures[pos].1;
            if *skip > 0 {
                *skip -= 1;
            } else {
                let (_, _, error) = journal.failures.remove(pos);
                return Err(error.into());
            }
        }
        journal.invocations.push(invocation);
        Ok(())
    }
}

impl KernelObjects for RecordingKernel {
    fn retype(
        &mut self,
        untyped: &CSpacePath,
        object_type: ObjectType,
        offset: Word,
        size_bits: usize,
        dest: &CSpacePath,
    ) -> Result<()> {
        self.record(Invocation::Retype {
            untyped: *untyped,
            object_type,
            offset,
            size_bits,
            dest: *dest,
        })
    }

    fn delete(&mut self, slot: &CSpacePath) -> Result<()> {
        self.record(Invocation::Delete { slot: *slot })
    }

    fn copy(&mut self, dest: &CSpacePath, src: &CSpacePath, rights: CapRights) -> Result<()> {
        self.record(Invocation::Copy {
            dest: *dest,
            src: *src,
            rights,
        })
    }

    fn mint(
        &mut self,
        dest: &CSpacePath,
        src: &CSpacePath,
        rights: CapRights,
        badge: Word,
    ) -> Result<()> {
        self.record(Invocation::Mint {
            dest: *dest,
            src: *src,
            rights,
            badge,
        })
    }

    fn move_cap(&mut self, dest: &CSpacePath, src: &CSpacePath) -> Result<()> {
        self.record(Invocation::Move {
            dest: *dest,
            src: *src,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: Word) -> CSpacePath {
        CSpacePath {
            root: 2,
            cap_ptr: n,
            cap_depth: 12,
            dest: 0,
            dest_depth: 0,
            offset: n,
        }
    }

    #[test]
    fn test_sel4_kernel_mock_succeeds() {
        let mut kernel = Sel4Kernel;
        assert!(kernel
            .retype(&slot(10), ObjectType::Endpoint, 0, 0, &slot(100))
            .is_ok());
        assert!(kernel.delete(&slot(100)).is_ok());
        assert!(kernel.mint(&slot(101), &slot(100), CapRights::ALL, 7).is_ok());
    }

    #[test]
    fn test_recording_kernel_shares_journal() {
        let kernel = RecordingKernel::new();
        let mut handle = kernel.clone();
        handle.delete(&slot(5)).unwrap();
        handle.move_cap(&slot(6), &slot(5)).unwrap();

        assert_eq!(kernel.invocations().len(), 2);
        assert_eq!(kernel.count(InvocationKind::Delete), 1);
        assert_eq!(kernel.count(InvocationKind::Move), 1);
    }

    #[test]
    fn test_recording_kernel_failure_injection() {
        let mut kernel = RecordingKernel::new();
        kernel.fail_next(InvocationKind::Retype, KernelError::NOT_ENOUGH_MEMORY);

        // Other kinds are unaffected
        assert!(kernel.delete(&slot(1)).is_ok());

        let err = kernel
            .retype(&slot(10), ObjectType::Tcb, 0, 11, &slot(100))
            .unwrap_err();
        assert_eq!(
            err,
            AllocError::Kernel {
                error: KernelError::NOT_ENOUGH_MEMORY
            }
        );
        // Only one failure was scheduled
        assert!(kernel
            .retype(&slot(10), ObjectType::Tcb, 0, 11, &slot(100))
            .is_ok());
        assert_eq!(kernel.retypes().len(), 1);
    }

    #[test]
    fn test_recording_kernel_delayed_failure() {
        let mut kernel = RecordingKernel::new();
        kernel.fail_after(InvocationKind::Delete, 2, KernelError::DELETE_FIRST);

        assert!(kernel.delete(&slot(1)).is_ok());
        assert!(kernel.delete(&slot(2)).is_ok());
        assert!(kernel.delete(&slot(3)).is_err());
        assert!(kernel.delete(&slot(4)).is_ok());
        assert_eq!(kernel.count(InvocationKind::Delete), 3);
    }

    #[test]
    fn test_kernel_error_display() {
        use alloc::string::ToString;
        assert_eq!(KernelError::DELETE_FIRST.to_string(), "DeleteFirst");
        assert_eq!(KernelError(99).to_string(), "error 99");
    }
}
