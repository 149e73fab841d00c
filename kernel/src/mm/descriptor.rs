//! Per-task memory descriptor
//!
//! The region list, heap break, and growth policy sitting above the VMM.
//! Kernel tasks have no descriptor; they live in the shared kernel half.

use alloc::vec::Vec;

use log::error;

use super::vmm::AddressSpace;
use super::{FrameSource, PageFlags, VirtAddr, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Fixed stack size: 8 MiB.
pub const STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Top of the user stack (exclusive end of the stack region).
pub const STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Reserved heap span: 1 GiB, unbacked until faulted in.
pub const HEAP_SIZE: u64 = 1024 * 1024 * 1024;

/// Heap growth per fault: 2^4 pages = 64 KiB.
pub const HEAP_GROW_ORDER: u8 = 4;

/// Bytes added to the heap per fault.
pub const HEAP_GROW_SIZE: u64 = (1 << HEAP_GROW_ORDER) * PAGE_SIZE as u64;

/// Guard region size.
pub const GUARD_SIZE: u64 = PAGE_SIZE as u64;

bitflags::bitflags! {
    /// Region permission and semantic flags. A region with no flags at all
    /// is a guard: any touch is a fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u64 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        const HEAP   = 1 << 3;
        const STACK  = 1 << 4;
        const SHARED = 1 << 5;
    }
}

/// A half-open virtual range `[start, end)` with its permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub start: u64,
    pub end: u64,
    pub flags: RegionFlags,
}

impl MemRegion {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Per-task memory state: the owned address space, the region list, and
/// the heap break.
pub struct MemoryDescriptor {
    space: AddressSpace,
    regions: Vec<MemRegion>,
    brk: u64,
    mmap_base: u64,
    total_vm: u64,
    rss: u64,
}

impl MemoryDescriptor {
    pub fn new(space: AddressSpace) -> Self {
        Self {
            space,
            regions: Vec::new(),
            brk: 0,
            mmap_base: 0,
            total_vm: 0,
            rss: 0,
        }
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn brk(&self) -> u64 {
        self.brk
    }

    /// Pages currently resident.
    pub fn rss(&self) -> u64 {
        self.rss
    }

    /// Total pages reserved across all regions.
    pub fn total_vm(&self) -> u64 {
        self.total_vm
    }

    /// Add a region covering `[start, end)`.
    pub fn add_region(&mut self, start: u64, end: u64, flags: RegionFlags) -> KernelResult<()> {
        if start >= end {
            error!("region start {:#x} is not below end {:#x}", start, end);
            return Err(KernelError::InvalidArgument { name: "region" });
        }
        self.regions.push(MemRegion { start, end, flags });
        self.total_vm += (end - start) / PAGE_SIZE as u64;
        Ok(())
    }

    /// Remove the region exactly matching `[start, end)`.
    pub fn remove_region(&mut self, start: u64, end: u64) -> KernelResult<()> {
        if start >= end {
            return Err(KernelError::InvalidArgument { name: "region" });
        }
        match self
            .regions
            .iter()
            .position(|r| r.start == start && r.end == end)
        {
            Some(idx) => {
                self.regions.remove(idx);
                self.total_vm -= (end - start) / PAGE_SIZE as u64;
                Ok(())
            }
            None => {
                error!("no region [{:#x}, {:#x}) to remove", start, end);
                Err(KernelError::InvalidArgument { name: "region" })
            }
        }
    }

    /// Find the region containing `addr`.
    pub fn find_region(&self, addr: u64) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Lay out the standard executable image:
    /// code (RX), data (RW), reserved heap with a guard above, and the
    /// stack with a guard below. Only the regions are recorded here; pages
    /// appear on demand through the fault path.
    pub fn setup_executable(
        &mut self,
        code_start: u64,
        code_end: u64,
        data_end: u64,
    ) -> KernelResult<()> {
        self.add_region(code_start, code_end, RegionFlags::READ | RegionFlags::EXEC)?;

        let data_start = super::align_up(code_end, PAGE_SIZE as u64);
        self.add_region(data_start, data_end, RegionFlags::READ | RegionFlags::WRITE)?;

        let heap_start = super::align_up(data_end, PAGE_SIZE as u64);
        let heap_end = heap_start + HEAP_SIZE;
        self.brk = heap_start;
        self.add_region(
            heap_start,
            heap_end,
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::HEAP,
        )?;
        self.add_region(heap_end, heap_end + GUARD_SIZE, RegionFlags::empty())?;

        let stack_bottom = STACK_TOP - STACK_SIZE;
        self.add_region(stack_bottom - GUARD_SIZE, stack_bottom, RegionFlags::empty())?;
        self.add_region(
            stack_bottom,
            STACK_TOP,
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::STACK,
        )?;

        Ok(())
    }

    /// Move the heap break inside the heap region. Returns the new break
    /// (unchanged if the request leaves the region).
    pub fn set_brk(&mut self, new_brk: u64) -> u64 {
        let Some(region) = self
            .regions
            .iter()
            .find(|r| r.flags.contains(RegionFlags::HEAP))
        else {
            return self.brk;
        };
        if new_brk >= region.start && new_brk < region.end {
            self.brk = new_brk;
        }
        self.brk
    }

    /// Permission check for a faulting access. Guard regions and holes
    /// deny everything.
    pub fn check_access(&self, addr: u64, requested: RegionFlags) -> bool {
        let Some(region) = self.find_region(addr) else {
            return false;
        };
        if region.flags.is_empty() {
            // Guard hit: something overflowed.
            return false;
        }
        region.flags.contains(requested)
    }

    /// Grow the heap by one chunk above the break.
    ///
    /// The new pages are mapped writable and non-executable at `brk`
    /// regardless of where inside the heap the fault landed; the break
    /// advances by the chunk size.
    pub fn expand_heap(
        &mut self,
        fault_addr: u64,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        if fault_addr < self.brk {
            error!(
                "heap fault at {:#x} below the break {:#x}",
                fault_addr, self.brk
            );
            return Ok(());
        }

        let grow_start = self.brk;
        let phys = frames.alloc_frames(HEAP_GROW_ORDER)?;
        let flags = PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE;

        if let Err(e) = self.space.map_range(
            VirtAddr::new(grow_start),
            phys,
            HEAP_GROW_SIZE as usize,
            flags,
            frames,
        ) {
            frames.free_frames(phys, HEAP_GROW_ORDER);
            return Err(e);
        }

        self.brk = grow_start + HEAP_GROW_SIZE;
        self.rss += HEAP_GROW_SIZE / PAGE_SIZE as u64;
        Ok(())
    }

    /// Back one stack page at the faulting address.
    pub fn expand_stack(
        &mut self,
        fault_addr: u64,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let phys = frames.alloc_frame()?;
        let flags = PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE;

        if let Err(e) = self.space.map_page(
            VirtAddr::new(fault_addr).align_down(),
            phys,
            flags,
            frames,
        ) {
            frames.free_frame(phys);
            return Err(e);
        }
        self.rss += 1;
        Ok(())
    }

    /// Release everything: mapped heap/stack frames stay with their
    /// owners' accounting (this revision does not track per-page frames),
    /// the page tables and the address space go back to the frame source.
    pub fn release(self, frames: &mut impl FrameSource) {
        self.space.destroy(frames);
    }
}
