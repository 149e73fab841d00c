//! Page-fault decode and dispatch
//!
//! The architecture trap handler collects the faulting address and the
//! hardware error code; this module turns them into a region access check
//! and, for heap and stack regions, demand growth. An unresolved fault
//! propagates as an error for the caller's kill policy (not wired yet).

use log::warn;

use super::descriptor::{MemoryDescriptor, RegionFlags};
use super::FrameSource;
use crate::error::{KernelError, KernelResult};

bitflags::bitflags! {
    /// x86_64 page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// Set if the page was present (protection violation).
        const PRESENT  = 1 << 0;
        /// Set for writes, clear for reads.
        const WRITE    = 1 << 1;
        /// Set if the access came from user mode.
        const USER     = 1 << 2;
        /// Reserved bit violation in a paging structure.
        const RESERVED = 1 << 3;
        /// Set for instruction fetches.
        const INSTR    = 1 << 4;
    }
}

/// Access rights implied by a fault's error code: an instruction fetch
/// needs EXEC, a write needs WRITE, anything else is a read.
pub fn access_from_error(code: PageFaultErrorCode) -> RegionFlags {
    if code.contains(PageFaultErrorCode::INSTR) {
        RegionFlags::EXEC
    } else if code.contains(PageFaultErrorCode::WRITE) {
        RegionFlags::WRITE
    } else {
        RegionFlags::READ
    }
}

/// Resolve a fault against a task's memory descriptor.
///
/// Denied accesses (hole, guard region, permission mismatch) come back as
/// [`KernelError::AccessDenied`]; legitimate faults in heap or stack
/// regions grow the mapping. A fault in any other valid region has nothing
/// to demand-page in this revision and is also an error.
pub fn handle_page_fault(
    md: &mut MemoryDescriptor,
    fault_addr: u64,
    code: PageFaultErrorCode,
    frames: &mut impl FrameSource,
) -> KernelResult<()> {
    let requested = access_from_error(code);

    if !md.check_access(fault_addr, requested) {
        warn!(
            "denied {:?} access at {:#x} (error code {:#x})",
            requested,
            fault_addr,
            code.bits()
        );
        return Err(KernelError::AccessDenied { addr: fault_addr });
    }

    let flags = md
        .find_region(fault_addr)
        .map(|r| r.flags)
        .unwrap_or(RegionFlags::empty());

    if flags.contains(RegionFlags::HEAP) {
        md.expand_heap(fault_addr, frames)
    } else if flags.contains(RegionFlags::STACK) {
        md.expand_stack(fault_addr, frames)
    } else {
        // Valid region, but nothing to grow: no backing store to page
        // from in this revision.
        Err(KernelError::NotMapped { addr: fault_addr })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::buddy::BuddyAllocator;
    use crate::mm::descriptor::{HEAP_GROW_SIZE, STACK_TOP};
    use crate::mm::testing::TestArena;
    use crate::mm::vmm::AddressSpace;
    use crate::mm::VirtAddr;

    const MIB: usize = 1024 * 1024;

    fn faulting_setup() -> (TestArena, MemoryDescriptor, BuddyAllocator) {
        let arena = TestArena::new(0x60_0000, 4 * MIB);
        let mut buddy = BuddyAllocator::new(arena.dm);
        buddy
            .add_arena(arena.base, arena.len as u64)
            .expect("arena accepted");
        let space = AddressSpace::new(arena.dm, &mut buddy, None).expect("address space");
        let mut md = MemoryDescriptor::new(space);
        md.setup_executable(0x40_0000, 0x40_3000, 0x40_8000)
            .expect("layout");
        (arena, md, buddy)
    }

    #[test]
    fn error_code_maps_to_access_kind() {
        assert_eq!(
            access_from_error(PageFaultErrorCode::INSTR),
            RegionFlags::EXEC
        );
        assert_eq!(
            access_from_error(PageFaultErrorCode::WRITE),
            RegionFlags::WRITE
        );
        assert_eq!(
            access_from_error(PageFaultErrorCode::USER),
            RegionFlags::READ
        );
        // Instruction fetch wins over write.
        assert_eq!(
            access_from_error(PageFaultErrorCode::INSTR | PageFaultErrorCode::WRITE),
            RegionFlags::EXEC
        );
    }

    #[test]
    fn heap_write_fault_grows_the_heap() {
        let (_arena, mut md, mut buddy) = faulting_setup();
        let brk0 = md.brk();

        handle_page_fault(
            &mut md,
            brk0,
            PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
            &mut buddy,
        )
        .expect("heap fault resolves");

        assert_eq!(md.brk(), brk0 + HEAP_GROW_SIZE);
        assert!(md.space().is_mapped(VirtAddr::new(brk0)));
    }

    #[test]
    fn stack_write_fault_maps_one_page() {
        let (_arena, mut md, mut buddy) = faulting_setup();
        let fault = STACK_TOP - 0x40;

        handle_page_fault(
            &mut md,
            fault,
            PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
            &mut buddy,
        )
        .expect("stack fault resolves");
        assert!(md.space().is_mapped(VirtAddr::new(fault).align_down()));
    }

    #[test]
    fn guard_page_fault_is_denied() {
        let (_arena, mut md, mut buddy) = faulting_setup();
        let heap_end = md.find_region(md.brk()).expect("heap region").end;

        assert_eq!(
            handle_page_fault(
                &mut md,
                heap_end,
                PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
                &mut buddy,
            ),
            Err(KernelError::AccessDenied { addr: heap_end })
        );
    }

    #[test]
    fn write_to_code_is_denied() {
        let (_arena, mut md, mut buddy) = faulting_setup();

        assert_eq!(
            handle_page_fault(
                &mut md,
                0x40_1000,
                PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
                &mut buddy,
            ),
            Err(KernelError::AccessDenied { addr: 0x40_1000 })
        );
        // An instruction fetch from the same address is fine as far as
        // permissions go, but code has no demand paging here.
        assert_eq!(
            handle_page_fault(
                &mut md,
                0x40_1000,
                PageFaultErrorCode::INSTR | PageFaultErrorCode::USER,
                &mut buddy,
            ),
            Err(KernelError::NotMapped { addr: 0x40_1000 })
        );
    }

    #[test]
    fn hole_fault_is_denied() {
        let (_arena, mut md, mut buddy) = faulting_setup();
        assert_eq!(
            handle_page_fault(&mut md, 0x1000, PageFaultErrorCode::USER, &mut buddy),
            Err(KernelError::AccessDenied { addr: 0x1000 })
        );
    }
}
