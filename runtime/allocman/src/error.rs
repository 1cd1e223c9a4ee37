//! Error types shared by every allocator in the crate

use core::fmt;

use thiserror::Error;

use crate::kernel::KernelError;

/// The pluggable pieces an [`AllocMan`](crate::AllocMan) is assembled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    CSpace,
    UtSpace,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::CSpace => write!(f, "cspace"),
            Component::UtSpace => write!(f, "utspace"),
        }
    }
}

/// Error types for allocation operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("Out of capability slots")]
    OutOfSlots,

    #[error("Out of untyped memory (requested: 2^{size_bits} bytes)")]
    OutOfMemory { size_bits: usize },

    #[error("Bookkeeping memory exhausted (requested: {bytes} bytes)")]
    BookkeepingExhausted { bytes: usize },

    #[error("Freed a slot or object that is not allocated")]
    InvalidFree,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("A {0} allocator is already attached")]
    AlreadyAttached(Component),

    #[error("No {0} allocator is attached")]
    NotAttached(Component),

    #[error("A reserve for this chunk is already configured")]
    ReserveExists,

    #[error("seL4 error: {error}")]
    Kernel { error: KernelError },
}

pub type Result<T> = core::result::Result<T, AllocError>;
