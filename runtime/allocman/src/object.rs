//! Kernel object types and their memory footprint
//!
//! Allocators work in *footprint* sizes: the number of bytes (log2) of
//! untyped memory an object consumes. The kernel's retype invocation takes a
//! different *object* size for some types (a CNode is sized by its slot
//! count, a TCB ignores the argument entirely). [`object_size`] maps the
//! retype argument to the footprint and [`sel4_object_size`] goes back the
//! other way. Both directions must agree or buddy bitmaps desynchronise, so
//! every allocator validates a request with [`is_valid_footprint`] first.

use sel4_platform::adapter as sel4;

use crate::Word;

pub const SLOT_BITS: usize = sel4::seL4_SlotBits;
pub const TCB_BITS: usize = sel4::seL4_TCBBits;
pub const ENDPOINT_BITS: usize = sel4::seL4_EndpointBits;
pub const NOTIFICATION_BITS: usize = sel4::seL4_NotificationBits;
pub const REPLY_BITS: usize = sel4::seL4_ReplyBits;
pub const MIN_SCHED_CONTEXT_BITS: usize = sel4::seL4_MinSchedContextBits;
pub const PAGE_BITS: usize = sel4::seL4_PageBits;
pub const LARGE_PAGE_BITS: usize = sel4::seL4_LargePageBits;
pub const HUGE_PAGE_BITS: usize = sel4::seL4_HugePageBits;
pub const PAGE_TABLE_BITS: usize = sel4::seL4_PageTableBits;
pub const VSPACE_BITS: usize = sel4::seL4_VSpaceBits;
pub const WORD_BITS: usize = sel4::seL4_WordBits;

/// Kernel object types an allocator can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    Untyped,
    Tcb,
    Endpoint,
    Notification,
    CNode,
    SchedContext,
    Reply,
    /// Architecture specific objects
    Arch(ArchObjectType),
}

/// aarch64 paging objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchObjectType {
    SmallPage,
    LargePage,
    HugePage,
    PageTable,
    VSpace,
}

impl ObjectType {
    pub const SMALL_PAGE: ObjectType = ObjectType::Arch(ArchObjectType::SmallPage);
    pub const LARGE_PAGE: ObjectType = ObjectType::Arch(ArchObjectType::LargePage);
    pub const PAGE_TABLE: ObjectType = ObjectType::Arch(ArchObjectType::PageTable);

    /// Object type number passed to the retype invocation
    pub fn to_sel4(self) -> Word {
        match self {
            ObjectType::Untyped => sel4::seL4_UntypedObject,
            ObjectType::Tcb => sel4::seL4_TCBObject,
            ObjectType::Endpoint => sel4::seL4_EndpointObject,
            ObjectType::Notification => sel4::seL4_NotificationObject,
            ObjectType::CNode => sel4::seL4_CapTableObject,
            ObjectType::SchedContext => sel4::seL4_SchedContextObject,
            ObjectType::Reply => sel4::seL4_ReplyObject,
            ObjectType::Arch(arch) => arch.to_sel4(),
        }
    }

    pub fn from_sel4(value: Word) -> Option<Self> {
        let ty = match value {
            sel4::seL4_UntypedObject => ObjectType::Untyped,
            sel4::seL4_TCBObject => ObjectType::Tcb,
            sel4::seL4_EndpointObject => ObjectType::Endpoint,
            sel4::seL4_NotificationObject => ObjectType::Notification,
            sel4::seL4_CapTableObject => ObjectType::CNode,
            sel4::seL4_SchedContextObject => ObjectType::SchedContext,
            sel4::seL4_ReplyObject => ObjectType::Reply,
            other => ObjectType::Arch(ArchObjectType::from_sel4(other)?),
        };
        Some(ty)
    }
}

impl ArchObjectType {
    pub fn to_sel4(self) -> Word {
        match self {
            ArchObjectType::SmallPage => sel4::seL4_ARCH_4KPage,
            ArchObjectType::LargePage => sel4::seL4_ARCH_LargePage,
            ArchObjectType::HugePage => sel4::seL4_ARCH_HugePage,
            ArchObjectType::PageTable => sel4::seL4_ARCH_PageTableObject,
            ArchObjectType::VSpace => sel4::seL4_ARCH_VSpaceObject,
        }
    }

    pub fn from_sel4(value: Word) -> Option<Self> {
        match value {
            sel4::seL4_ARCH_4KPage => Some(ArchObjectType::SmallPage),
            sel4::seL4_ARCH_LargePage => Some(ArchObjectType::LargePage),
            sel4::seL4_ARCH_HugePage => Some(ArchObjectType::HugePage),
            sel4::seL4_ARCH_PageTableObject => Some(ArchObjectType::PageTable),
            sel4::seL4_ARCH_VSpaceObject => Some(ArchObjectType::VSpace),
            _ => None,
        }
    }

    /// Footprint of an architecture object; these are all fixed size
    pub const fn size_bits(self) -> usize {
        match self {
            ArchObjectType::SmallPage => PAGE_BITS,
            ArchObjectType::LargePage => LARGE_PAGE_BITS,
            ArchObjectType::HugePage => HUGE_PAGE_BITS,
            ArchObjectType::PageTable => PAGE_TABLE_BITS,
            ArchObjectType::VSpace => VSPACE_BITS,
        }
    }
}

/// Footprint (log2 bytes) of an object created with retype size `size_bits`
pub const fn object_size(object_type: ObjectType, size_bits: usize) -> usize {
    match object_type {
        ObjectType::Untyped => size_bits,
        ObjectType::Tcb => TCB_BITS,
        ObjectType::Endpoint => ENDPOINT_BITS,
        ObjectType::Notification => NOTIFICATION_BITS,
        ObjectType::CNode => SLOT_BITS + size_bits,
        ObjectType::SchedContext => {
            if size_bits > MIN_SCHED_CONTEXT_BITS {
                size_bits
            } else {
                MIN_SCHED_CONTEXT_BITS
            }
        }
        ObjectType::Reply => REPLY_BITS,
        ObjectType::Arch(arch) => arch.size_bits(),
    }
}

/// Retype size argument for an object whose footprint is `size_bits`
///
/// A CNode footprint smaller than one slot saturates to zero slots bits; the
/// result is then rejected by [`is_valid_footprint`].
pub const fn sel4_object_size(object_type: ObjectType, size_bits: usize) -> usize {
    match object_type {
        ObjectType::CNode => size_bits.saturating_sub(SLOT_BITS),
        other => object_size(other, size_bits),
    }
}

/// Whether `size_bits` is a footprint `object_type` can actually have
pub const fn is_valid_footprint(object_type: ObjectType, size_bits: usize) -> bool {
    size_bits != 0
        && size_bits < WORD_BITS
        && object_size(object_type, sel4_object_size(object_type, size_bits)) == size_bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size_objects() {
        assert_eq!(object_size(ObjectType::Tcb, 0), TCB_BITS);
        assert_eq!(object_size(ObjectType::Tcb, 20), TCB_BITS);
        assert_eq!(object_size(ObjectType::Endpoint, 0), ENDPOINT_BITS);
        assert_eq!(object_size(ObjectType::Notification, 3), NOTIFICATION_BITS);
        assert_eq!(object_size(ObjectType::Reply, 0), REPLY_BITS);
        assert_eq!(object_size(ObjectType::SMALL_PAGE, 0), PAGE_BITS);
    }

    #[test]
    fn test_cnode_footprint_includes_slot_size() {
        assert_eq!(object_size(ObjectType::CNode, 10), 10 + SLOT_BITS);
        assert_eq!(sel4_object_size(ObjectType::CNode, 10 + SLOT_BITS), 10);
    }

    #[test]
    fn test_sched_context_minimum() {
        assert_eq!(object_size(ObjectType::SchedContext, 2), MIN_SCHED_CONTEXT_BITS);
        assert_eq!(object_size(ObjectType::SchedContext, 9), 9);
    }

    #[test]
    fn test_footprint_validation() {
        assert!(is_valid_footprint(ObjectType::Tcb, TCB_BITS));
        assert!(!is_valid_footprint(ObjectType::Tcb, TCB_BITS + 1));
        assert!(is_valid_footprint(ObjectType::Untyped, 20));
        assert!(!is_valid_footprint(ObjectType::Untyped, 0));
        assert!(!is_valid_footprint(ObjectType::Untyped, WORD_BITS));
        assert!(is_valid_footprint(ObjectType::CNode, SLOT_BITS + 4));
        assert!(!is_valid_footprint(ObjectType::SchedContext, MIN_SCHED_CONTEXT_BITS - 1));
    }

    #[test]
    fn test_sel4_numbers_round_trip() {
        for ty in [
            ObjectType::Untyped,
            ObjectType::Tcb,
            ObjectType::CNode,
            ObjectType::Reply,
            ObjectType::LARGE_PAGE,
            ObjectType::PAGE_TABLE,
        ] {
            assert_eq!(ObjectType::from_sel4(ty.to_sel4()), Some(ty));
        }
        assert_eq!(ObjectType::from_sel4(999), None);
    }
}
