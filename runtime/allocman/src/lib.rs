//! Allocman - Capability slot and untyped memory allocation for KaaL
//!
//! # Purpose
//! Hands out empty capability slots and kernel objects carved from untyped
//! memory, and keeps enough in reserve that the allocators can always make
//! progress on their own bookkeeping.
//!
//! # Integration Points
//! - Depends on: seL4 kernel (retype and CNode invocations)
//! - Provides to: process, thread and address-space construction code
//! - Capabilities required: a CNode with free slots and untyped memory
//!
//! # Architecture
//! [`AllocMan`] wires together three pluggable pieces:
//! - an [`MSpace`] for the allocators' own bookkeeping ([`FixedPool`])
//! - a [`CSpace`] for slots ([`SingleLevelCSpace`], [`TwoLevelCSpace`])
//! - a [`UtSpace`] for objects ([`TrickleUtSpace`], [`SplitUtSpace`])
//!
//! Consumers allocate through the [`Vka`] trait, which [`AllocMan`],
//! colour domains ([`ColorVka`]) and the checking [`DebugVka`] implement.
//! [`bootstrap`] builds a ready-to-use allocator from the boot description.
//!
//! # Testing Strategy
//! - Unit tests: each allocator against a recording kernel
//! - Integration tests: bootstrap to allocation through the public API
//! - Property tests: slot uniqueness, buddy conservation, colour disjointness

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod allocman;
pub mod bootstrap;
pub mod color;
pub mod config;
pub mod cspace;
pub mod error;
pub mod kernel;
pub mod mspace;
pub mod object;
pub mod path;
pub mod utspace;
pub mod vka;

#[cfg(test)]
mod testing;

/// Machine word
pub type Word = usize;

/// Address of a capability slot
pub type CPtr = usize;

pub use allocman::{AllocMan, Bookkeeping, BucketStatus, ReserveStatus};
pub use bootstrap::{BootInfo, SlotRegion, UntypedDescriptor};
pub use color::{ColorAllocator, ColorVka, INIT_DOMAIN};
pub use config::{ColorConfig, MspaceReserve, ReserveConfig, UtspaceReserve};
pub use cspace::{CSpace, SingleLevelCSpace, SingleLevelConfig, TwoLevelCSpace, TwoLevelConfig};
pub use error::{AllocError, Component, Result};
pub use kernel::{CapRights, KernelError, KernelObjects, RecordingKernel, Sel4Kernel};
pub use mspace::{FixedPool, MChunk, MSpace};
pub use object::{object_size, ObjectType};
pub use path::CSpacePath;
pub use utspace::{Cookie, SplitUtSpace, TrickleUtSpace, UntypedKind, UntypedRegion, UtSpace};
pub use vka::{DebugVka, Vka, VkaObject};
