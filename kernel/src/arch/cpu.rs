//! CPU intrinsics consumed by the core.
//!
//! Bare metal uses the real instructions; host builds get stand-ins (no
//! interrupt state, no TLB) so allocator and scheduler logic runs under the
//! standard test harness.

/// Save RFLAGS and mask local interrupts. Returns the saved flags word.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn save_and_disable_interrupts() -> u64 {
    let flags = x86_64::registers::rflags::read_raw();
    x86_64::instructions::interrupts::disable();
    flags
}

/// Restore a previously saved RFLAGS word.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn restore_interrupts(flags: u64) {
    // SAFETY: `flags` came from `save_and_disable_interrupts` on this core,
    // so we are restoring a flags word this kernel was already running with.
    unsafe { x86_64::registers::rflags::write_raw(flags) };
}

/// Invalidate the TLB entry for one page on this core.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn flush_tlb_page(vaddr: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(vaddr));
}

/// Flush the whole TLB on this core (CR3 reload).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

/// Physical address of the active top-level page table.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn read_cr3() -> u64 {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    frame.start_address().as_u64()
}

/// Switch the active top-level page table.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn write_cr3(pml4_phys: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(pml4_phys));
    // SAFETY: The caller hands us the physical root of a page-table
    // hierarchy whose upper half carries the kernel mappings, so execution
    // continues normally after the switch.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Cycle counter, used for timer calibration.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn read_tsc() -> u64 {
    // SAFETY: RDTSC has no memory operands and no side effects beyond
    // reading the counter.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Halt until the next interrupt.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn halt() {
    x86_64::instructions::hlt();
}

/// Halt this core forever. The fatal-error policy.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

// ---------------------------------------------------------------------------
// Host stand-ins
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "none"))]
pub fn save_and_disable_interrupts() -> u64 {
    0
}

#[cfg(not(target_os = "none"))]
pub fn restore_interrupts(_flags: u64) {}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb_page(_vaddr: u64) {}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb_all() {}

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> u64 {
    0
}

#[cfg(not(target_os = "none"))]
pub fn write_cr3(_pml4_phys: u64) {}

#[cfg(not(target_os = "none"))]
pub fn read_tsc() -> u64 {
    0
}

#[cfg(not(target_os = "none"))]
pub fn halt() {
    core::hint::spin_loop();
}

#[cfg(not(target_os = "none"))]
pub fn halt_forever() -> ! {
    panic!("halt_forever reached on host");
}

/// Identifier of the core this code is running on.
///
/// On bare metal this reads the per-CPU slot the bootstrap installed behind
/// the GS base; before that runs, GS is null and the answer is core 0, which
/// is correct for the BSP doing early boot.
pub fn current_cpu_id() -> usize {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::arch::x86_64::smp::current_cpu_id()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}
