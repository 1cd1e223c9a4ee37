//! Integration tests for the complete allocator
//!
//! These tests drive the public API end to end:
//! - Slot allocation and reuse
//! - Object allocation from untyped memory
//! - Bootstrapping from a boot description
//! - The reserve pool under pressure
//! - Cache colouring

use kaal_allocman::bootstrap::{self, BootInfo, SlotRegion, UntypedDescriptor};
use kaal_allocman::kernel::{Invocation, InvocationKind};
use kaal_allocman::object::{PAGE_BITS, SLOT_BITS};
use kaal_allocman::vka::{
    alloc_cnode, alloc_endpoint, alloc_frame, alloc_notification, alloc_tcb, cnode_copy,
    free_object,
};
use kaal_allocman::*;

fn root_path(slot: CPtr) -> CSpacePath {
    SingleLevelConfig {
        cnode: 2,
        cnode_size_bits: 12,
        cnode_guard_bits: 0,
        first_slot: 0,
        end_slot: 0,
    }
    .make_path(slot)
}

fn manager(first_slot: CPtr, end_slot: CPtr, kernel: &RecordingKernel) -> AllocMan {
    let mut alloc = AllocMan::new(FixedPool::new(1 << 16), kernel.clone());
    let cspace = SingleLevelCSpace::new(
        &mut alloc,
        SingleLevelConfig {
            cnode: 2,
            cnode_size_bits: 12,
            cnode_guard_bits: 0,
            first_slot,
            end_slot,
        },
    )
    .expect("Failed to create cspace");
    alloc.attach_cspace(cspace).expect("Failed to attach cspace");
    alloc
        .attach_utspace(TrickleUtSpace::new())
        .expect("Failed to attach utspace");
    alloc
}

fn boot_info() -> BootInfo {
    BootInfo {
        root_cnode: 2,
        cnode_size_bits: 12,
        empty: SlotRegion {
            start: 100,
            end: 4096,
        },
        untyped: vec![
            UntypedDescriptor {
                cap: 10,
                paddr: 0x1000_0000,
                size_bits: 22, // 4MB
                is_device: false,
            },
            UntypedDescriptor {
                cap: 11,
                paddr: 0xFEBC_0000,
                size_bits: 17,
                is_device: true,
            },
        ],
    }
}

/// Four slots, handed out once each, reused most recently freed first
#[test]
fn test_single_level_slot_scenario() {
    let kernel = RecordingKernel::new();
    let mut alloc = manager(1, 5, &kernel);

    let mut slots: Vec<CPtr> = (0..4)
        .map(|_| alloc.cspace_alloc().expect("slot").cap_ptr)
        .collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![1, 2, 3, 4]);

    assert_eq!(alloc.cspace_alloc(), Err(AllocError::OutOfSlots));

    let path = alloc.cspace_make_path(3).unwrap();
    alloc.cspace_free(&path).unwrap();
    assert_eq!(alloc.cspace_alloc().unwrap().cap_ptr, 3);
}

/// Blocks are taken from the low end of a region first
#[test]
fn test_trickle_block_scenario() {
    let kernel = RecordingKernel::new();
    let mut alloc = manager(100, 200, &kernel);
    let region = UntypedRegion {
        path: root_path(10),
        size_bits: 8,
        paddr: Some(0x1000),
    };
    alloc.add_untypeds(&[region], UntypedKind::Kernel).unwrap();

    let dest = alloc.cspace_alloc().unwrap();
    let c1 = alloc
        .utspace_alloc(6, ObjectType::Untyped, &dest, false)
        .unwrap();
    assert_eq!(alloc.utspace_paddr(c1, 6), Some(0x1000));

    let dest = alloc.cspace_alloc().unwrap();
    let c2 = alloc
        .utspace_alloc(6, ObjectType::Untyped, &dest, false)
        .unwrap();
    assert_eq!(alloc.utspace_paddr(c2, 6), Some(0x1040));
}

/// Bootstrap, create a process worth of objects, tear them down
#[test]
fn test_bootstrap_process_workflow() {
    let kernel = RecordingKernel::new();
    let mut alloc =
        bootstrap::use_current_cspace(&boot_info(), 1 << 16, kernel.clone()).expect("bootstrap");

    let tcb = alloc_tcb(&mut alloc).unwrap();
    let fault_ep = alloc_endpoint(&mut alloc).unwrap();
    let ntfn = alloc_notification(&mut alloc).unwrap();
    let cnode = alloc_cnode(&mut alloc, 8).unwrap();
    let frames: Vec<VkaObject> = (0..16)
        .map(|_| alloc_frame(&mut alloc, PAGE_BITS).unwrap())
        .collect();

    // Every object was retyped into the slot that was handed out for it
    for object in [&tcb, &fault_ep, &ntfn, &cnode] {
        let path = alloc.cspace_make_path(object.cptr).unwrap();
        assert!(kernel.retypes().iter().any(|inv| matches!(
            inv,
            Invocation::Retype { dest, object_type, .. }
                if *dest == path && *object_type == object.object_type
        )));
    }
    let cnode_paddr = Vka::utspace_paddr(&alloc, cnode.ut, ObjectType::CNode, 8).unwrap();
    assert_eq!(cnode_paddr % (1 << (8 + SLOT_BITS)), 0);

    for object in frames.iter().chain([&tcb, &fault_ep, &ntfn, &cnode]) {
        free_object(&mut alloc, object).unwrap();
    }
    assert_eq!(
        kernel.count(InvocationKind::Delete),
        frames.len() + 4,
        "every capability deleted exactly once"
    );
    assert!(alloc.fill_reserves());
}

/// The same consumer code runs against the checking wrapper
#[test]
fn test_debug_vka_workflow() {
    let kernel = RecordingKernel::new();
    let alloc = bootstrap::use_current_cspace(&boot_info(), 1 << 16, kernel).unwrap();
    let mut vka = DebugVka::new(alloc);

    let ep = alloc_endpoint(&mut vka).unwrap();
    let copy = vka.cspace_alloc().unwrap();
    cnode_copy(&mut vka, copy, ep.cptr, CapRights::READ | CapRights::WRITE).unwrap();
    assert_eq!(vka.live_slots(), 2);
    assert_eq!(vka.live_objects(), 1);

    kaal_allocman::vka::cnode_delete(&mut vka, copy).unwrap();
    vka.cspace_free(copy).unwrap();
    free_object(&mut vka, &ep).unwrap();
    assert_eq!(vka.live_slots(), 0);
    assert_eq!(vka.live_objects(), 0);
}

/// Objects keep coming from the reserve while the utspace cannot deliver
#[test]
fn test_reserve_covers_dip() {
    let kernel = RecordingKernel::new();
    let mut alloc = manager(100, 400, &kernel);
    let region = UntypedRegion {
        path: root_path(10),
        size_bits: 16,
        paddr: Some(0x8000_0000),
    };
    alloc.add_untypeds(&[region], UntypedKind::Kernel).unwrap();
    alloc
        .configure_utspace_reserve(UtspaceReserve {
            size_bits: PAGE_BITS,
            object_type: ObjectType::SMALL_PAGE,
            count: 2,
        })
        .unwrap();
    alloc.configure_reserves(&ReserveConfig::default()).unwrap();
    assert!(alloc.fill_reserves());

    // Sixteen pages in the region, two of them already sit in the reserve
    let mut pages = Vec::new();
    loop {
        let dest = alloc.cspace_alloc().unwrap();
        match alloc.utspace_alloc(PAGE_BITS, ObjectType::SMALL_PAGE, &dest, false) {
            Ok(cookie) => pages.push((cookie, dest)),
            Err(e) => {
                assert_eq!(e, AllocError::OutOfMemory { size_bits: PAGE_BITS });
                break;
            }
        }
    }
    assert_eq!(pages.len(), 16);
    // The last two were moved out of the reserve
    assert_eq!(kernel.count(InvocationKind::Move), 2);
    assert!(!alloc.fill_reserves());

    // Returning memory lets the reserve recover
    for (cookie, dest) in pages.drain(..4) {
        alloc.kernel_mut().delete(&dest).unwrap();
        alloc.utspace_free(cookie, PAGE_BITS).unwrap();
        alloc.cspace_free(&dest).unwrap();
    }
    assert!(alloc.fill_reserves());
    let status = alloc.reserve_status();
    assert_eq!(status.utspace[0].2, BucketStatus { held: 2, quota: 2 });
}

/// Two-level bootstrap grows past the first second-level CNode
#[test]
fn test_two_level_growth() {
    let kernel = RecordingKernel::new();
    let mut alloc = bootstrap::new_two_level(&boot_info(), 6, 1 << 18, kernel.clone()).unwrap();

    let slots: Vec<CSpacePath> = (0..200).map(|_| alloc.cspace_alloc().unwrap()).collect();
    let mut indices: Vec<CPtr> = slots.iter().map(|p| p.cap_ptr).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 200);
    for path in &slots {
        assert_eq!(path.cap_depth, 12 + 6);
        assert_eq!(path.dest, path.cap_ptr >> 6);
    }

    for path in &slots {
        alloc.cspace_free(path).unwrap();
    }
    assert!(kernel.count(InvocationKind::Delete) > 0);
}

/// Each colour domain only receives pages of its own colours
#[test]
fn test_colour_domains() {
    let kernel = RecordingKernel::new();
    let root = bootstrap::use_current_cspace(&boot_info(), 1 << 18, kernel).unwrap();
    let config = ColorConfig::new(8);
    let mut colors = ColorAllocator::new(root, config, &[2, 2, 4]).unwrap();

    for domain in 0..3 {
        let owned = colors.colors(domain).unwrap();
        let mut vka = colors.domain(domain).unwrap();
        for _ in 0..6 {
            let frame = alloc_frame(&mut vka, PAGE_BITS).unwrap();
            let paddr = vka
                .utspace_paddr(frame.ut, frame.object_type, PAGE_BITS)
                .unwrap();
            assert!(owned.contains(&config.color_of(paddr)));
        }
    }
    assert!(colors.domain(3).is_err());

    let mut init = colors.domain(INIT_DOMAIN).unwrap();
    assert!(alloc_frame(&mut init, PAGE_BITS).is_ok());
}
