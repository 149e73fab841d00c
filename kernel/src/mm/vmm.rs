//! Virtual memory manager
//!
//! Builds and mutates 4-level page tables reached through the direct map.
//! Address spaces share the kernel's upper half by copying PML4 entries
//! 256..511 at creation; the kernel must never add a new top-level entry
//! after the first address space exists, because nobody would see it.
//!
//! TLB discipline: every PTE mutation is followed on the issuing core by a
//! single-page invalidation or, for ranges, one full flush at the end.
//! There is no cross-core shootdown in this revision; mappings are mutated
//! by one core at a time.

use log::error;

use super::{DirectMap, FrameSource, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::arch::cpu;
use crate::error::{KernelError, KernelResult};
use crate::sync::GlobalState;

/// Entries per page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Mask selecting the physical frame bits of a PTE.
pub const PTE_PHYS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// PML4 slot where the shared kernel upper half begins.
pub const KERNEL_PML4_START: usize = 256;

const fn pml4_index(v: u64) -> usize {
    ((v >> 39) & 0x1FF) as usize
}

const fn pdpt_index(v: u64) -> usize {
    ((v >> 30) & 0x1FF) as usize
}

const fn pd_index(v: u64) -> usize {
    ((v >> 21) & 0x1FF) as usize
}

const fn pt_index(v: u64) -> usize {
    ((v >> 12) & 0x1FF) as usize
}

/// A task's address space: the owned PML4 root plus accounting.
pub struct AddressSpace {
    pml4: PhysAddr,
    total_pages: u64,
    flags: u64,
    dm: DirectMap,
}

// SAFETY: The raw table pointers derived from `pml4` all target frames
// owned by this address space (or the shared kernel half, which is never
// mutated through it); access is serialized by the owning task.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Create an address space with a zeroed root and the kernel's upper
    /// half copied in.
    pub fn new(
        dm: DirectMap,
        frames: &mut impl FrameSource,
        kernel: Option<&AddressSpace>,
    ) -> KernelResult<Self> {
        let pml4 = frames.alloc_frame()?;
        // SAFETY: The frame was just handed to us exclusively and is
        // covered by the direct map.
        unsafe {
            core::ptr::write_bytes(dm.ptr(pml4), 0, PAGE_SIZE);
        }

        let space = Self {
            pml4,
            total_pages: 0,
            flags: 0,
            dm,
        };

        if let Some(kernel) = kernel {
            let src = kernel.table(kernel.pml4);
            let dst = space.table(pml4);
            // SAFETY: Both tables are live page-table frames under the
            // direct map; only the upper-half entries are copied, and the
            // kernel table is not concurrently mutated (upper-half
            // mappings are fixed after early boot).
            unsafe {
                for i in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
                    (*dst.add(i)) = *src.add(i);
                }
            }
        }

        Ok(space)
    }

    /// Wrap an already-built hierarchy (the boot page tables).
    pub fn from_existing_root(dm: DirectMap, pml4: PhysAddr) -> Self {
        Self {
            pml4,
            total_pages: 0,
            flags: 0,
            dm,
        }
    }

    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Raw view of one page-table frame.
    fn table(&self, phys: PhysAddr) -> *mut u64 {
        self.dm.ptr(phys) as *mut u64
    }

    /// PML4 entry `i` of this space (diagnostics and upper-half checks).
    pub fn pml4_entry(&self, i: usize) -> u64 {
        debug_assert!(i < PAGE_TABLE_ENTRIES);
        // SAFETY: The root is a live page-table frame under the direct map.
        unsafe { *self.table(self.pml4).add(i) }
    }

    /// Walk to the PTE slot for `vaddr`.
    ///
    /// With `create`, missing intermediate tables are allocated zeroed and
    /// wired `PRESENT | WRITABLE | USER` (the kernel's own pages live in
    /// the upper half, so lower-half intermediates always allow user
    /// access and the leaf PTE decides). Without `create`, an absent level
    /// ends the walk.
    fn walk(
        &self,
        vaddr: VirtAddr,
        create: bool,
        mut frames: Option<&mut dyn FrameSource>,
    ) -> Option<*mut u64> {
        let v = vaddr.as_u64();
        let indices = [pml4_index(v), pdpt_index(v), pd_index(v), pt_index(v)];
        let mut current = self.pml4;

        for (level, &idx) in indices.iter().enumerate() {
            // SAFETY: `current` is a live page-table frame: either the
            // root or a frame installed by a lower iteration/previous walk.
            let entry_ptr = unsafe { self.table(current).add(idx) };

            if level == 3 {
                return Some(entry_ptr);
            }

            // SAFETY: entry_ptr points into a live table as above.
            let entry = unsafe { *entry_ptr };
            if entry & PageFlags::PRESENT.bits() == 0 {
                if !create {
                    return None;
                }
                let frames = frames.as_deref_mut()?;
                let table = frames.alloc_frame().ok()?;
                // SAFETY: Fresh exclusive frame under the direct map.
                unsafe {
                    core::ptr::write_bytes(self.dm.ptr(table), 0, PAGE_SIZE);
                    *entry_ptr = table.as_u64()
                        | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
                }
                current = table;
            } else {
                current = PhysAddr::new(entry & PTE_PHYS_MASK);
            }
        }
        None
    }

    fn map_page_inner(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        let vaddr = vaddr.align_down();
        let paddr = paddr.align_down();

        let pte = self
            .walk(vaddr, true, Some(frames))
            .ok_or(KernelError::oom(PAGE_SIZE))?;

        // SAFETY: `pte` points at the leaf slot for `vaddr` inside a live
        // page table owned by this space.
        unsafe {
            if *pte & PageFlags::PRESENT.bits() != 0 {
                error!("mapping {} which is already present", vaddr);
                return Err(KernelError::AlreadyMapped {
                    addr: vaddr.as_u64(),
                });
            }
            *pte = paddr.as_u64() | flags.bits() | PageFlags::PRESENT.bits();
        }
        self.total_pages += 1;
        Ok(())
    }

    /// Map one page and invalidate its TLB entry.
    pub fn map_page(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        self.map_page_inner(vaddr, paddr, flags, frames)?;
        cpu::flush_tlb_page(vaddr.align_down().as_u64());
        Ok(())
    }

    /// Map `[vaddr, vaddr + size)` to `[paddr, ...)`.
    ///
    /// Pages are mapped without per-page invalidation; one full TLB flush
    /// at the end amortizes the cost. A failure midway unmaps everything
    /// this call already mapped.
    pub fn map_range(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        if size == 0 {
            error!("zero-size mapping request at {}", vaddr);
            return Err(KernelError::InvalidArgument { name: "size" });
        }

        let vstart = vaddr.align_down().as_u64();
        let vend = VirtAddr::new(vaddr.as_u64() + size as u64).align_up().as_u64();
        let pstart = paddr.align_down().as_u64();

        let mut v = vstart;
        let mut p = pstart;
        while v < vend {
            if let Err(e) =
                self.map_page_inner(VirtAddr::new(v), PhysAddr::new(p), flags, frames)
            {
                // Roll back the pages mapped so far.
                self.unmap_range(VirtAddr::new(vstart), (v - vstart) as usize);
                return Err(e);
            }
            v += PAGE_SIZE as u64;
            p += PAGE_SIZE as u64;
        }
        cpu::flush_tlb_all();
        Ok(())
    }

    fn unmap_page_inner(&mut self, vaddr: VirtAddr) -> KernelResult<()> {
        let vaddr = vaddr.align_down();
        let Some(pte) = self.walk(vaddr, false, None) else {
            return Err(KernelError::NotMapped {
                addr: vaddr.as_u64(),
            });
        };
        // SAFETY: `pte` points at the live leaf slot for `vaddr`.
        unsafe {
            if *pte & PageFlags::PRESENT.bits() == 0 {
                return Err(KernelError::NotMapped {
                    addr: vaddr.as_u64(),
                });
            }
            *pte = 0;
        }
        self.total_pages -= 1;
        Ok(())
    }

    /// Unmap one page and invalidate its TLB entry.
    pub fn unmap_page(&mut self, vaddr: VirtAddr) -> KernelResult<()> {
        self.unmap_page_inner(vaddr)?;
        cpu::flush_tlb_page(vaddr.align_down().as_u64());
        Ok(())
    }

    /// Unmap `[vaddr, vaddr + size)`, skipping holes, one flush at the end.
    pub fn unmap_range(&mut self, vaddr: VirtAddr, size: usize) {
        if size == 0 {
            return;
        }
        let vstart = vaddr.align_down().as_u64();
        let vend = VirtAddr::new(vaddr.as_u64() + size as u64).align_up().as_u64();

        let mut v = vstart;
        while v < vend {
            let _ = self.unmap_page_inner(VirtAddr::new(v));
            v += PAGE_SIZE as u64;
        }
        cpu::flush_tlb_all();
    }

    /// Translate a virtual address. Returns the null address if unmapped.
    pub fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
        let Some(pte) = self.walk(vaddr, false, None) else {
            return PhysAddr::zero();
        };
        // SAFETY: `pte` points at the live leaf slot for `vaddr`.
        let entry = unsafe { *pte };
        if entry & PageFlags::PRESENT.bits() == 0 {
            return PhysAddr::zero();
        }
        PhysAddr::new((entry & PTE_PHYS_MASK) | vaddr.page_offset())
    }

    pub fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        !self.virt_to_phys(vaddr).is_null()
    }

    /// Tear the address space down: free every present lower-half table
    /// frame (PDPT, PD, PT), then the root. Upper-half children belong to
    /// the kernel and are never touched. Mapped data frames are owned by
    /// the memory descriptor layer, not the page tables.
    pub fn destroy(self, frames: &mut impl FrameSource) {
        for i in 0..KERNEL_PML4_START {
            let entry = self.pml4_entry(i);
            if entry & PageFlags::PRESENT.bits() != 0 {
                self.free_pdpt(PhysAddr::new(entry & PTE_PHYS_MASK), frames);
            }
        }
        frames.free_frame(self.pml4);
    }

    fn free_pdpt(&self, pdpt: PhysAddr, frames: &mut impl FrameSource) {
        let table = self.table(pdpt);
        for i in 0..PAGE_TABLE_ENTRIES {
            // SAFETY: `pdpt` is a live table frame owned by this space.
            let entry = unsafe { *table.add(i) };
            if entry & PageFlags::PRESENT.bits() != 0 && entry & PageFlags::HUGE.bits() == 0 {
                self.free_pd(PhysAddr::new(entry & PTE_PHYS_MASK), frames);
            }
        }
        frames.free_frame(pdpt);
    }

    fn free_pd(&self, pd: PhysAddr, frames: &mut impl FrameSource) {
        let table = self.table(pd);
        for i in 0..PAGE_TABLE_ENTRIES {
            // SAFETY: `pd` is a live table frame owned by this space.
            let entry = unsafe { *table.add(i) };
            if entry & PageFlags::PRESENT.bits() != 0 && entry & PageFlags::HUGE.bits() == 0 {
                frames.free_frame(PhysAddr::new(entry & PTE_PHYS_MASK));
            }
        }
        frames.free_frame(pd);
    }
}

// ---------------------------------------------------------------------------
// Kernel address space
// ---------------------------------------------------------------------------

/// The kernel's own address space, wrapping the boot page tables.
static KERNEL_SPACE: GlobalState<AddressSpace> = GlobalState::new();

/// Adopt the currently active page tables as the kernel address space.
/// Bare-metal boot path; must run after the direct map is recorded.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    let dm = super::direct_map();
    let root = PhysAddr::new(cpu::read_cr3());
    let space = AddressSpace::from_existing_root(dm, root);
    KERNEL_SPACE
        .init(space)
        .map_err(|_| KernelError::InvalidArgument { name: "vmm::init" })
}

/// Install a prebuilt kernel address space. Host tests use this to stand
/// in for the boot path.
pub fn init_with_space(space: AddressSpace) -> KernelResult<()> {
    KERNEL_SPACE
        .init(space)
        .map_err(|_| KernelError::InvalidArgument { name: "vmm::init" })
}

/// Run `f` against the kernel address space.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> KernelResult<R> {
    KERNEL_SPACE
        .with_mut(f)
        .ok_or(KernelError::NotInitialized { subsystem: "vmm" })
}

/// Create an address space sharing the kernel upper half.
pub fn create_address_space(frames: &mut impl FrameSource) -> KernelResult<AddressSpace> {
    let dm = super::direct_map();
    KERNEL_SPACE
        .with(|kernel| AddressSpace::new(dm, frames, Some(kernel)))
        .ok_or(KernelError::NotInitialized { subsystem: "vmm" })?
}

/// Destroy an address space. Refuses the kernel's own.
pub fn destroy_address_space(space: AddressSpace, frames: &mut impl FrameSource) {
    let is_kernel = KERNEL_SPACE
        .with(|k| k.pml4_phys() == space.pml4_phys())
        .unwrap_or(false);
    if is_kernel {
        error!("refusing to destroy the kernel address space");
        return;
    }
    space.destroy(frames);
}

/// Make `space` the active address space on this core.
pub fn switch_address_space(space: &AddressSpace) {
    cpu::write_cr3(space.pml4_phys().as_u64());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::buddy::BuddyAllocator;
    use crate::mm::testing::TestArena;

    const MIB: usize = 1024 * 1024;

    fn frames_over(arena: &TestArena) -> BuddyAllocator {
        let mut buddy = BuddyAllocator::new(arena.dm);
        buddy
            .add_arena(arena.base, arena.len as u64)
            .expect("arena accepted");
        buddy
    }

    /// A stand-in kernel space with a distinctive upper half.
    fn fake_kernel_space(dm: DirectMap, frames: &mut BuddyAllocator) -> AddressSpace {
        let space = AddressSpace::new(dm, frames, None).expect("kernel root frame");
        let table = space.table(space.pml4_phys());
        // SAFETY (test): the root frame is exclusively owned.
        unsafe {
            for i in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
                *table.add(i) = ((i as u64) << 16) | PageFlags::PRESENT.bits();
            }
        }
        space
    }

    #[test]
    fn map_and_translate_round_trip() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let mut space = AddressSpace::new(arena.dm, &mut frames, None).expect("address space");

        let v = VirtAddr::new(0x40_0000);
        let p = PhysAddr::new(0x10_0000);
        space
            .map_page(v, p, PageFlags::WRITABLE | PageFlags::USER, &mut frames)
            .expect("mapping succeeds");

        assert_eq!(space.virt_to_phys(v), p);
        assert_eq!(
            space.virt_to_phys(VirtAddr::new(0x40_0123)).as_u64(),
            0x10_0123
        );
        assert!(space.is_mapped(v));
        assert_eq!(space.total_pages(), 1);

        space.unmap_page(v).expect("unmapping succeeds");
        assert_eq!(space.virt_to_phys(v), PhysAddr::zero());
        assert!(!space.is_mapped(v));
        assert_eq!(space.total_pages(), 0);
    }

    #[test]
    fn double_map_is_rejected() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let mut space = AddressSpace::new(arena.dm, &mut frames, None).expect("address space");

        let v = VirtAddr::new(0x1000);
        space
            .map_page(v, PhysAddr::new(0x2000), PageFlags::WRITABLE, &mut frames)
            .expect("first mapping");
        assert_eq!(
            space.map_page(v, PhysAddr::new(0x3000), PageFlags::WRITABLE, &mut frames),
            Err(KernelError::AlreadyMapped { addr: 0x1000 })
        );
        // The original translation is untouched.
        assert_eq!(space.virt_to_phys(v).as_u64(), 0x2000);
    }

    #[test]
    fn unmap_of_unmapped_is_an_error() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let mut space = AddressSpace::new(arena.dm, &mut frames, None).expect("address space");

        assert_eq!(
            space.unmap_page(VirtAddr::new(0x5000)),
            Err(KernelError::NotMapped { addr: 0x5000 })
        );
    }

    #[test]
    fn map_range_spans_and_unmaps() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let mut space = AddressSpace::new(arena.dm, &mut frames, None).expect("address space");

        space
            .map_range(
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x10_0000),
                16 * PAGE_SIZE,
                PageFlags::WRITABLE | PageFlags::USER,
                &mut frames,
            )
            .expect("range mapping");

        for i in 0..16u64 {
            assert_eq!(
                space
                    .virt_to_phys(VirtAddr::new(0x40_0000 + i * PAGE_SIZE as u64))
                    .as_u64(),
                0x10_0000 + i * PAGE_SIZE as u64
            );
        }
        assert_eq!(space.total_pages(), 16);

        space.unmap_range(VirtAddr::new(0x40_0000), 16 * PAGE_SIZE);
        assert_eq!(space.total_pages(), 0);
        assert!(!space.is_mapped(VirtAddr::new(0x40_0000)));
    }

    #[test]
    fn map_range_rolls_back_on_collision() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let mut space = AddressSpace::new(arena.dm, &mut frames, None).expect("address space");

        // Pre-map the third page of the range so the bulk map collides.
        space
            .map_page(
                VirtAddr::new(0x40_2000),
                PhysAddr::new(0x9_0000),
                PageFlags::WRITABLE,
                &mut frames,
            )
            .expect("collision page");

        let result = space.map_range(
            VirtAddr::new(0x40_0000),
            PhysAddr::new(0x10_0000),
            4 * PAGE_SIZE,
            PageFlags::WRITABLE,
            &mut frames,
        );
        assert_eq!(result, Err(KernelError::AlreadyMapped { addr: 0x40_2000 }));

        // The two pages mapped before the collision were rolled back; the
        // pre-existing page survives.
        assert!(!space.is_mapped(VirtAddr::new(0x40_0000)));
        assert!(!space.is_mapped(VirtAddr::new(0x40_1000)));
        assert_eq!(space.virt_to_phys(VirtAddr::new(0x40_2000)).as_u64(), 0x9_0000);
        assert_eq!(space.total_pages(), 1);
    }

    #[test]
    fn fresh_space_shares_kernel_upper_half() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let kernel = fake_kernel_space(arena.dm, &mut frames);

        let space =
            AddressSpace::new(arena.dm, &mut frames, Some(&kernel)).expect("user space");
        for i in KERNEL_PML4_START..PAGE_TABLE_ENTRIES {
            assert_eq!(space.pml4_entry(i), kernel.pml4_entry(i), "slot {}", i);
        }
        // Lower half starts empty.
        for i in 0..KERNEL_PML4_START {
            assert_eq!(space.pml4_entry(i), 0, "slot {}", i);
        }
    }

    #[test]
    fn destroy_frees_lower_half_tables_only() {
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let kernel = fake_kernel_space(arena.dm, &mut frames);

        let free_before = frames.arena_stats(0).free_bytes;
        let mut space =
            AddressSpace::new(arena.dm, &mut frames, Some(&kernel)).expect("user space");
        space
            .map_page(
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x10_0000),
                PageFlags::WRITABLE | PageFlags::USER,
                &mut frames,
            )
            .expect("one mapping");

        // Root + PDPT + PD + PT allocated.
        assert_eq!(
            frames.arena_stats(0).free_bytes,
            free_before - 4 * PAGE_SIZE as u64
        );

        space.destroy(&mut frames);
        assert_eq!(frames.arena_stats(0).free_bytes, free_before);
    }

    #[test]
    fn scenario_map_translate_destroy() {
        // Create, map 0x400000 -> 0x100000, translate, destroy; the
        // "kernel" space must survive untouched.
        let arena = TestArena::new(0x40_0000, 4 * MIB);
        let mut frames = frames_over(&arena);
        let kernel = fake_kernel_space(arena.dm, &mut frames);
        let kernel_root = kernel.pml4_phys();

        let mut space =
            AddressSpace::new(arena.dm, &mut frames, Some(&kernel)).expect("user space");
        space
            .map_range(
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x10_0000),
                PAGE_SIZE,
                PageFlags::WRITABLE | PageFlags::USER,
                &mut frames,
            )
            .expect("scenario mapping");
        assert_eq!(space.virt_to_phys(VirtAddr::new(0x40_0000)).as_u64(), 0x10_0000);

        space.destroy(&mut frames);
        assert_eq!(kernel.pml4_phys(), kernel_root);
        assert_eq!(
            kernel.pml4_entry(PAGE_TABLE_ENTRIES - 1),
            ((PAGE_TABLE_ENTRIES as u64 - 1) << 16) | PageFlags::PRESENT.bits()
        );
    }
}
