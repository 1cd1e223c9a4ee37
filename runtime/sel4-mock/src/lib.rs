//! Mock seL4 bindings for host-side development
//!
//! This crate models the slice of the seL4 ABI that the KaaL allocators
//! touch: word and capability types, error codes, object type numbers,
//! object size constants and the untyped/CNode invocations. Every
//! invocation succeeds without touching any kernel state, which is enough
//! to drive the allocators' bookkeeping on a development host.
//!
//! Sizes follow the aarch64 configuration of the kernel.

#![no_std]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
#![allow(clippy::too_many_arguments)]

// Basic seL4 types (mocked)
pub type seL4_Word = usize;
pub type seL4_CPtr = seL4_Word;
pub type seL4_CNode = seL4_Word;
pub type seL4_Untyped = seL4_Word;
pub type seL4_Error = i32;

// Error codes
pub const seL4_NoError: seL4_Error = 0;
pub const seL4_InvalidArgument: seL4_Error = 1;
pub const seL4_InvalidCapability: seL4_Error = 2;
pub const seL4_IllegalOperation: seL4_Error = 3;
pub const seL4_RangeError: seL4_Error = 4;
pub const seL4_AlignmentError: seL4_Error = 5;
pub const seL4_FailedLookup: seL4_Error = 6;
pub const seL4_TruncatedMessage: seL4_Error = 7;
pub const seL4_DeleteFirst: seL4_Error = 8;
pub const seL4_RevokeFirst: seL4_Error = 9;
pub const seL4_NotEnoughMemory: seL4_Error = 10;

// Capability rights
pub const seL4_CanWrite: seL4_Word = 0x01;
pub const seL4_CanRead: seL4_Word = 0x02;
pub const seL4_CanGrant: seL4_Word = 0x04;
pub const seL4_CanGrantReply: seL4_Word = 0x08;
pub const seL4_AllRights: seL4_Word = 0x0f;

// Object type numbers
pub const seL4_UntypedObject: seL4_Word = 0;
pub const seL4_TCBObject: seL4_Word = 1;
pub const seL4_EndpointObject: seL4_Word = 2;
pub const seL4_NotificationObject: seL4_Word = 3;
pub const seL4_CapTableObject: seL4_Word = 4;
pub const seL4_SchedContextObject: seL4_Word = 5;
pub const seL4_ReplyObject: seL4_Word = 6;
pub const seL4_ARM_HugePageObject: seL4_Word = 7;
pub const seL4_ARM_VSpaceObject: seL4_Word = 8;
pub const seL4_ARM_SmallPageObject: seL4_Word = 9;
pub const seL4_ARM_LargePageObject: seL4_Word = 10;
pub const seL4_ARM_PageTableObject: seL4_Word = 11;

// Architecture aliases
pub const seL4_ARCH_4KPage: seL4_Word = seL4_ARM_SmallPageObject;
pub const seL4_ARCH_LargePage: seL4_Word = seL4_ARM_LargePageObject;
pub const seL4_ARCH_HugePage: seL4_Word = seL4_ARM_HugePageObject;
pub const seL4_ARCH_PageTableObject: seL4_Word = seL4_ARM_PageTableObject;
pub const seL4_ARCH_VSpaceObject: seL4_Word = seL4_ARM_VSpaceObject;

// Object sizes (log2 bytes)
pub const seL4_WordBits: usize = 64;
pub const seL4_SlotBits: usize = 5;
pub const seL4_TCBBits: usize = 11;
pub const seL4_EndpointBits: usize = 4;
pub const seL4_NotificationBits: usize = 5;
pub const seL4_ReplyBits: usize = 5;
pub const seL4_MinSchedContextBits: usize = 7;
pub const seL4_PageBits: usize = 12;
pub const seL4_LargePageBits: usize = 21;
pub const seL4_HugePageBits: usize = 30;
pub const seL4_PageTableBits: usize = 12;
pub const seL4_VSpaceBits: usize = 12;
pub const seL4_MinUntypedBits: usize = 4;
pub const seL4_MaxUntypedBits: usize = 47;

// Well-known root task slots
pub const seL4_CapNull: seL4_CPtr = 0;
pub const seL4_CapInitThreadTCB: seL4_CPtr = 1;
pub const seL4_CapInitThreadCNode: seL4_CPtr = 2;
pub const seL4_CapInitThreadVSpace: seL4_CPtr = 3;

/// Mock Untyped_Retype - carve objects from the next free part of an untyped
pub unsafe fn seL4_Untyped_Retype(
    _service: seL4_Untyped,
    _type: seL4_Word,
    _size_bits: seL4_Word,
    _root: seL4_CNode,
    _node_index: seL4_Word,
    _node_depth: seL4_Word,
    _node_offset: seL4_Word,
    _num_objects: seL4_Word,
) -> seL4_Error {
    seL4_NoError
}

/// Mock Untyped_RetypeAtOffset - carve objects at a byte offset into an untyped
pub unsafe fn seL4_Untyped_RetypeAtOffset(
    _service: seL4_Untyped,
    _type: seL4_Word,
    _offset: seL4_Word,
    _size_bits: seL4_Word,
    _root: seL4_CNode,
    _node_index: seL4_Word,
    _node_depth: seL4_Word,
    _node_offset: seL4_Word,
    _num_objects: seL4_Word,
) -> seL4_Error {
    seL4_NoError
}

/// Mock CNode_Delete - remove the capability in a slot
pub unsafe fn seL4_CNode_Delete(
    _service: seL4_CNode,
    _index: seL4_Word,
    _depth: u8,
) -> seL4_Error {
    seL4_NoError
}

/// Mock CNode_Copy - duplicate a capability with reduced rights
pub unsafe fn seL4_CNode_Copy(
    _service: seL4_CNode,
    _dest_index: seL4_Word,
    _dest_depth: u8,
    _src_root: seL4_CNode,
    _src_index: seL4_Word,
    _src_depth: u8,
    _rights: seL4_Word,
) -> seL4_Error {
    seL4_NoError
}

/// Mock CNode_Mint - duplicate a capability with new rights and badge
pub unsafe fn seL4_CNode_Mint(
    _service: seL4_CNode,
    _dest_index: seL4_Word,
    _dest_depth: u8,
    _src_root: seL4_CNode,
    _src_index: seL4_Word,
    _src_depth: u8,
    _rights: seL4_Word,
    _badge: seL4_Word,
) -> seL4_Error {
    seL4_NoError
}

/// Mock CNode_Move - move a capability between slots
pub unsafe fn seL4_CNode_Move(
    _service: seL4_CNode,
    _dest_index: seL4_Word,
    _dest_depth: u8,
    _src_root: seL4_CNode,
    _src_index: seL4_Word,
    _src_depth: u8,
) -> seL4_Error {
    seL4_NoError
}
