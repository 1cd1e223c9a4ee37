//! Cache colouring allocator
//!
//! Splits the memory of a root [`AllocMan`] between domains by cache colour.
//! Each domain owns a contiguous range of colours and a [`SplitUtSpace`] that
//! only ever holds memory of those colours, so objects of different domains
//! never compete for the same cache sets.
//!
//! Domains start empty. When one runs out, a block of one page per colour is
//! taken from the root allocator and every domain receives the pages of its
//! own colours from it, retyped as untypeds of the largest aligned size
//! possible. Allocations from [`INIT_DOMAIN`] bypass colouring.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::allocman::AllocMan;
use crate::config::{ColorConfig, MspaceReserve};
use crate::error::{AllocError, Result};
use crate::kernel::KernelObjects;
use crate::mspace::MChunk;
use crate::object::{object_size, ObjectType};
use crate::path::CSpacePath;
use crate::utspace::split::{SplitRegion, NODE_BYTES};
use crate::utspace::{Cookie, SplitUtSpace, UntypedKind, UntypedRegion, UtSpace};
use crate::vka::Vka;
use crate::{CPtr, Word};

/// Domain handle that allocates straight from the root allocator
pub const INIT_DOMAIN: usize = usize::MAX;

/// Root allocator plus one coloured sub-allocator per domain
pub struct ColorAllocator {
    root: AllocMan,
    config: ColorConfig,
    /// Number of colours owned by each domain
    div: Vec<usize>,
    domains: Vec<SplitUtSpace>,
    /// Refill blocks taken from the root allocator
    blocks: Vec<(Cookie, CSpacePath)>,
}

fn floor_log2(n: usize) -> usize {
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

impl ColorAllocator {
    /// Colour the memory of `root`. Domain `n` owns `div[n]` colours.
    pub fn new(mut root: AllocMan, config: ColorConfig, div: &[usize]) -> Result<Self> {
        if config.num_colors == 0 || !config.num_colors.is_power_of_two() {
            return Err(AllocError::InvalidArgument("colour count must be a power of two"));
        }
        if div.is_empty() || div.contains(&0) {
            return Err(AllocError::InvalidArgument("every domain needs a colour"));
        }
        if div.iter().sum::<usize>() != config.num_colors {
            return Err(AllocError::InvalidArgument("domain shares must cover every colour"));
        }

        // Splitting a domain block needs split nodes while the root is busy
        let reserve = MspaceReserve {
            size: NODE_BYTES,
            count: config.mspace_reserves,
        };
        match root.configure_mspace_reserve(reserve) {
            Ok(()) | Err(AllocError::ReserveExists) => {}
            Err(e) => return Err(e),
        }

        Ok(Self {
            root,
            config,
            div: div.to_vec(),
            domains: div.iter().map(|_| SplitUtSpace::new()).collect(),
            blocks: Vec::new(),
        })
    }

    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    pub fn num_domains(&self) -> usize {
        self.div.len()
    }

    /// Colours owned by `domain`. [`INIT_DOMAIN`] owns none of its own.
    pub fn colors(&self, domain: usize) -> Option<core::ops::Range<usize>> {
        let count = *self.div.get(domain)?;
        let first: usize = self.div[..domain].iter().sum();
        Some(first..first + count)
    }

    /// Number of refill blocks taken from the root allocator
    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn root(&self) -> &AllocMan {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut AllocMan {
        &mut self.root
    }

    pub fn into_root(self) -> AllocMan {
        self.root
    }

    pub fn mspace_alloc(&mut self, bytes: usize) -> Result<MChunk> {
        self.root.mspace_alloc(bytes)
    }

    pub fn mspace_free(&mut self, chunk: MChunk) {
        self.root.mspace_free(chunk)
    }

    /// Allocation handle for `domain`
    pub fn domain(&mut self, domain: usize) -> Result<ColorVka<'_>> {
        if domain != INIT_DOMAIN && domain >= self.div.len() {
            return Err(AllocError::InvalidArgument("no such colour domain"));
        }
        Ok(ColorVka {
            alloc: self,
            domain,
        })
    }

    /// Regions given to `domain` so far
    pub fn domain_regions(&self, domain: usize) -> Result<Vec<SplitRegion>> {
        self.domains
            .get(domain)
            .map(SplitUtSpace::regions)
            .ok_or(AllocError::InvalidArgument("no such colour domain"))
    }

    fn free_root_slot(&mut self, slot: &CSpacePath) {
        if let Err(e) = self.root.cspace_free(slot) {
            warn!("color: failed to return slot {:#x}: {}", slot.cap_ptr, e);
        }
    }

    /// Take one block from the root and deal its pages out to every domain
    ///
    /// With a `target`, the block containing that address is taken.
    fn refill(&mut self, target: Option<Word>) -> Result<()> {
        let block_bits = self.config.block_bits();
        let slot = self.root.cspace_alloc()?;
        let allocated = match target {
            Some(paddr) => {
                let aligned = paddr & !((1 << block_bits) - 1);
                self.root
                    .utspace_alloc_at(block_bits, ObjectType::Untyped, &slot, aligned, true)
            }
            None => self
                .root
                .utspace_alloc(block_bits, ObjectType::Untyped, &slot, false),
        };
        let cookie = match allocated {
            Ok(cookie) => cookie,
            Err(e) => {
                self.free_root_slot(&slot);
                return Err(e);
            }
        };
        let Some(base) = self.root.utspace_paddr(cookie, block_bits) else {
            if let Err(e) = self.root.kernel_mut().delete(&slot) {
                warn!("color: failed to delete refill block: {}", e);
            }
            if let Err(e) = self.root.utspace_free(cookie, block_bits) {
                warn!("color: failed to return refill block: {}", e);
            }
            self.free_root_slot(&slot);
            return Err(AllocError::InvalidArgument("untyped memory without a physical address"));
        };
        self.blocks.push((cookie, slot));

        let page_bits = self.config.page_bits;
        for domain in 0..self.div.len() {
            let Some(colors) = self.colors(domain) else {
                continue;
            };
            let mut start = colors.start;
            while start < colors.end {
                let bits = (start.trailing_zeros() as usize).min(floor_log2(colors.end - start));
                let piece = self.root.cspace_alloc()?;
                let offset = start << page_bits;
                let size_bits = bits + page_bits;
                if let Err(e) = self.root.kernel_mut().retype(
                    &slot,
                    ObjectType::Untyped,
                    offset,
                    size_bits,
                    &piece,
                ) {
                    self.free_root_slot(&piece);
                    return Err(e);
                }
                let region = UntypedRegion {
                    path: piece,
                    size_bits,
                    paddr: Some(base + offset),
                };
                self.domains[domain].add_uts(&mut self.root, &[region], UntypedKind::Kernel)?;
                start += 1 << bits;
            }
        }
        debug!(
            "color: refilled {} domains from block at {:#x}",
            self.div.len(),
            base
        );
        Ok(())
    }
}

/// [`Vka`] for one colour domain
pub struct ColorVka<'a> {
    alloc: &'a mut ColorAllocator,
    domain: usize,
}

impl ColorVka<'_> {
    pub fn domain(&self) -> usize {
        self.domain
    }

    fn alloc_colored(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        paddr: Option<Word>,
        can_use_device: bool,
    ) -> Result<Cookie> {
        let footprint = object_size(object_type, size_bits);
        let alloc = &mut *self.alloc;
        let first = alloc.domains[self.domain].alloc(
            &mut alloc.root,
            footprint,
            object_type,
            dest,
            paddr,
            can_use_device,
        );
        match first {
            Err(AllocError::OutOfMemory { .. }) => {
                alloc.refill(paddr)?;
                alloc.domains[self.domain].alloc(
                    &mut alloc.root,
                    footprint,
                    object_type,
                    dest,
                    paddr,
                    can_use_device,
                )
            }
            other => other,
        }
    }
}

impl Vka for ColorVka<'_> {
    fn cspace_alloc(&mut self) -> Result<CPtr> {
        Vka::cspace_alloc(&mut self.alloc.root)
    }

    fn cspace_make_path(&self, slot: CPtr) -> Result<CSpacePath> {
        self.alloc.root.cspace_make_path(slot)
    }

    fn cspace_free(&mut self, slot: CPtr) -> Result<()> {
        Vka::cspace_free(&mut self.alloc.root, slot)
    }

    fn utspace_alloc_maybe_device(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        can_use_device: bool,
    ) -> Result<Cookie> {
        if self.domain == INIT_DOMAIN {
            return self.alloc.root.utspace_alloc_maybe_device(
                dest,
                object_type,
                size_bits,
                can_use_device,
            );
        }
        self.alloc_colored(dest, object_type, size_bits, None, can_use_device)
    }

    fn utspace_alloc_at(
        &mut self,
        dest: &CSpacePath,
        object_type: ObjectType,
        size_bits: usize,
        paddr: Word,
    ) -> Result<Cookie> {
        if self.domain == INIT_DOMAIN {
            return Vka::utspace_alloc_at(&mut self.alloc.root, dest, object_type, size_bits, paddr);
        }
        self.alloc_colored(dest, object_type, size_bits, Some(paddr), false)
    }

    fn utspace_free(
        &mut self,
        object_type: ObjectType,
        size_bits: usize,
        cookie: Cookie,
    ) -> Result<()> {
        if self.domain == INIT_DOMAIN {
            return Vka::utspace_free(&mut self.alloc.root, object_type, size_bits, cookie);
        }
        let footprint = object_size(object_type, size_bits);
        let alloc = &mut *self.alloc;
        alloc.domains[self.domain].free(&mut alloc.root, cookie, footprint)
    }

    fn utspace_paddr(
        &self,
        cookie: Cookie,
        object_type: ObjectType,
        size_bits: usize,
    ) -> Option<Word> {
        if self.domain == INIT_DOMAIN {
            return Vka::utspace_paddr(&self.alloc.root, cookie, object_type, size_bits);
        }
        self.alloc.domains[self.domain].paddr(cookie, object_size(object_type, size_bits))
    }

    fn kernel(&mut self) -> &mut dyn KernelObjects {
        self.alloc.root.kernel_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{InvocationKind, RecordingKernel};
    use crate::object::PAGE_BITS;
    use crate::testing::manager;
    use crate::vka::{alloc_frame, free_object, VkaObject};

    fn colored(div: &[usize], kernel: &RecordingKernel) -> ColorAllocator {
        ColorAllocator::new(manager((100, 1000), kernel), ColorConfig::new(4), div).unwrap()
    }

    fn color_of(vka: &ColorVka<'_>, frame: &VkaObject) -> usize {
        let paddr = vka
            .utspace_paddr(frame.ut, frame.object_type, frame.size_bits)
            .unwrap();
        ColorConfig::new(4).color_of(paddr)
    }

    #[test]
    fn test_rejects_bad_divisions() {
        let kernel = RecordingKernel::new();
        for div in [&[][..], &[2, 1][..], &[4, 0][..], &[1, 1, 1, 2][..]] {
            assert!(matches!(
                ColorAllocator::new(manager((100, 200), &kernel), ColorConfig::new(4), div),
                Err(AllocError::InvalidArgument(_))
            ));
        }
        assert!(ColorAllocator::new(manager((100, 200), &kernel), ColorConfig::new(3), &[3]).is_err());
    }

    #[test]
    fn test_domain_bounds() {
        let kernel = RecordingKernel::new();
        let mut colors = colored(&[1, 3], &kernel);
        assert!(colors.domain(1).is_ok());
        assert!(colors.domain(INIT_DOMAIN).is_ok());
        assert!(colors.domain(2).is_err());
        assert_eq!(colors.colors(0), Some(0..1));
        assert_eq!(colors.colors(1), Some(1..4));
        assert_eq!(colors.colors(2), None);
        assert_eq!(colors.colors(INIT_DOMAIN), None);
    }

    #[test]
    fn test_first_allocation_refills() {
        let kernel = RecordingKernel::new();
        let mut colors = colored(&[1, 3], &kernel);
        assert_eq!(colors.blocks(), 0);

        let mut vka = colors.domain(0).unwrap();
        let frame = alloc_frame(&mut vka, PAGE_BITS).unwrap();
        assert_eq!(color_of(&vka, &frame), 0);
        assert_eq!(colors.blocks(), 1);

        // Colours 1..4 went to domain 1 as one page and one aligned pair
        let mut regions = colors.domain_regions(1).unwrap();
        regions.sort_by_key(|r| r.paddr);
        let base = colors.domain_regions(0).unwrap()[0].paddr.unwrap();
        assert_eq!(
            regions
                .iter()
                .map(|r| (r.paddr.unwrap() - base, r.size_bits))
                .collect::<Vec<_>>(),
            vec![(0x1000, PAGE_BITS), (0x2000, PAGE_BITS + 1)]
        );
    }

    #[test]
    fn test_domains_only_see_their_colours() {
        let kernel = RecordingKernel::new();
        let mut colors = colored(&[1, 3], &kernel);

        let mut vka = colors.domain(1).unwrap();
        for _ in 0..7 {
            let frame = alloc_frame(&mut vka, PAGE_BITS).unwrap();
            assert!((1..4).contains(&color_of(&vka, &frame)));
        }
        // Three pages per block for domain 1
        assert_eq!(colors.blocks(), 3);

        let mut vka = colors.domain(0).unwrap();
        for _ in 0..3 {
            let frame = alloc_frame(&mut vka, PAGE_BITS).unwrap();
            assert_eq!(color_of(&vka, &frame), 0);
        }
        // Domain 0 already had a page from each block
        assert_eq!(colors.blocks(), 3);
    }

    #[test]
    fn test_init_domain_uses_root() {
        let kernel = RecordingKernel::new();
        let mut colors = colored(&[2, 2], &kernel);
        let before = kernel.count(InvocationKind::Retype);

        let mut vka = colors.domain(INIT_DOMAIN).unwrap();
        let frame = alloc_frame(&mut vka, PAGE_BITS).unwrap();
        free_object(&mut vka, &frame).unwrap();

        assert_eq!(kernel.count(InvocationKind::Retype), before + 1);
        assert_eq!(colors.blocks(), 0);
        assert!(colors.domain_regions(0).unwrap().is_empty());
    }

    #[test]
    fn test_free_returns_to_domain() {
        let kernel = RecordingKernel::new();
        let mut colors = colored(&[2, 2], &kernel);

        let mut vka = colors.domain(0).unwrap();
        let frame = alloc_frame(&mut vka, PAGE_BITS).unwrap();
        let paddr = vka.utspace_paddr(frame.ut, frame.object_type, PAGE_BITS);
        free_object(&mut vka, &frame).unwrap();

        let again = alloc_frame(&mut vka, PAGE_BITS).unwrap();
        assert_eq!(vka.utspace_paddr(again.ut, again.object_type, PAGE_BITS), paddr);
        assert_eq!(colors.blocks(), 1);
    }

    #[test]
    fn test_alloc_at_refills_target_block() {
        let kernel = RecordingKernel::new();
        let mut colors = colored(&[2, 2], &kernel);
        let target = crate::testing::MANAGER_PADDR + 0x8000 + 0x2000;

        let mut vka = colors.domain(1).unwrap();
        let dest = vka.cspace_alloc().unwrap();
        let dest = vka.cspace_make_path(dest).unwrap();
        let cookie = vka
            .utspace_alloc_at(&dest, ObjectType::SMALL_PAGE, PAGE_BITS, target)
            .unwrap();
        assert_eq!(
            vka.utspace_paddr(cookie, ObjectType::SMALL_PAGE, PAGE_BITS),
            Some(target)
        );
    }
}
