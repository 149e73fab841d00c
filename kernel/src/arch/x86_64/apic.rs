//! Local APIC driver, timer-focused.
//!
//! The BSP maps the APIC MMIO page into the kernel upper half (before any
//! task address space exists, so the shared-upper-half invariant holds)
//! and calibrates the APIC timer against PIT channel 2. Every core then
//! programs its own periodic timer from the shared calibration.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{error, info};

use crate::error::{KernelError, KernelResult};
use crate::mm::heap::GlobalFrames;
use crate::mm::{vmm, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};

/// Fixed physical base of the local APIC.
pub const APIC_BASE_PHYS: u64 = 0xFEE0_0000;

/// Where the APIC page lives in the kernel upper half.
pub const APIC_VIRT_BASE: u64 = 0xFFFF_FF80_0000_0000;

/// IDT vector driven by the APIC timer.
pub const TIMER_VECTOR: u8 = 0x20;

/// Spurious-interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

// Register offsets.
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ERROR_STATUS: u64 = 0x280;
const REG_LVT_TIMER: u64 = 0x320;
const REG_LVT_LINT0: u64 = 0x350;
const REG_LVT_LINT1: u64 = 0x360;
const REG_LVT_ERROR: u64 = 0x370;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

const LVT_MASKED: u32 = 1 << 16;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const SPURIOUS_ENABLE: u32 = 1 << 8;

/// Divide configuration: divide by 16.
const TIMER_DIVIDE_BY_16: u32 = 0b0011;

static APIC_MAPPED: AtomicBool = AtomicBool::new(false);

/// APIC timer ticks per 10 ms at divide-by-16, measured once on the BSP.
static TIMER_TICKS_PER_10MS: AtomicU32 = AtomicU32::new(0);

fn reg(offset: u64) -> *mut u32 {
    (APIC_VIRT_BASE + offset) as *mut u32
}

fn read(offset: u64) -> u32 {
    // SAFETY: `global_init` mapped the APIC page before any reader runs;
    // APIC registers are 32-bit volatile MMIO.
    unsafe { reg(offset).read_volatile() }
}

fn write(offset: u64, value: u32) {
    // SAFETY: As in `read`.
    unsafe { reg(offset).write_volatile(value) }
}

/// Map the APIC page and calibrate the timer. BSP only, once.
pub fn global_init() -> KernelResult<()> {
    if APIC_MAPPED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let flags = PageFlags::WRITABLE | PageFlags::NO_CACHE | PageFlags::WRITE_THROUGH;
    vmm::with_kernel_space(|space| {
        space.map_range(
            VirtAddr::new(APIC_VIRT_BASE),
            PhysAddr::new(APIC_BASE_PHYS),
            PAGE_SIZE,
            flags,
            &mut GlobalFrames,
        )
    })??;
    info!("APIC mapped at {:#x}", APIC_VIRT_BASE);

    calibrate_with_pit();
    Ok(())
}

/// Enable this core's APIC and quiesce its local vectors.
pub fn timer_init_cpu() -> KernelResult<()> {
    if !APIC_MAPPED.load(Ordering::Acquire) {
        error!("APIC used before global init");
        return Err(KernelError::NotInitialized { subsystem: "apic" });
    }

    let mut spurious = read(REG_SPURIOUS);
    spurious |= SPURIOUS_ENABLE;
    spurious = (spurious & !0xFF) | SPURIOUS_VECTOR as u32;
    write(REG_SPURIOUS, spurious);

    if read(REG_SPURIOUS) & SPURIOUS_ENABLE == 0 {
        error!("APIC refused to enable");
        return Err(KernelError::NotInitialized { subsystem: "apic" });
    }

    // Mask everything local until it is explicitly configured.
    write(REG_LVT_TIMER, LVT_MASKED);
    write(REG_LVT_LINT0, LVT_MASKED);
    write(REG_LVT_LINT1, LVT_MASKED);
    write(REG_LVT_ERROR, LVT_MASKED);

    // The ESR wants a write before it is read.
    write(REG_ERROR_STATUS, 0);
    let esr = read(REG_ERROR_STATUS);
    if esr != 0 {
        log::warn!("APIC error status {:#x} at init", esr);
    }

    write(REG_EOI, 0);
    Ok(())
}

/// Start the periodic timer on this core at `hz`.
pub fn timer_set_frequency(hz: u32) {
    let per_10ms = TIMER_TICKS_PER_10MS.load(Ordering::Acquire);
    let initial = (per_10ms as u64 * 100 / hz as u64).max(1) as u32;

    write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write(REG_LVT_TIMER, TIMER_VECTOR as u32 | LVT_TIMER_PERIODIC);
    write(REG_TIMER_INITIAL, initial);
}

/// Mask the timer on this core.
pub fn timer_disable() {
    write(REG_LVT_TIMER, LVT_MASKED);
}

/// Signal end of interrupt.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Measure APIC timer ticks per 10 ms against PIT channel 2.
fn calibrate_with_pit() {
    use x86_64::instructions::port::Port;

    const PIT_HZ: u32 = 1_193_182;
    let reload: u16 = (PIT_HZ / 100) as u16; // 10 ms

    let mut gate: Port<u8> = Port::new(0x61);
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel2: Port<u8> = Port::new(0x42);

    // SAFETY: Standard PIT/keyboard-controller ports, programmed with
    // channel 2 one-shot mode; the speaker output stays disabled (bit 1).
    unsafe {
        // Gate channel 2 off, speaker off.
        let g = gate.read();
        gate.write((g & !0x03) | 0x01);

        // Channel 2, lo/hi byte, mode 0.
        command.write(0xB0);
        channel2.write((reload & 0xFF) as u8);
        channel2.write((reload >> 8) as u8);
    }

    // Free-run the APIC timer and let the PIT count the 10 ms window.
    write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write(REG_LVT_TIMER, LVT_MASKED);
    write(REG_TIMER_INITIAL, u32::MAX);

    // SAFETY: Reading the gate status port has no side effects.
    unsafe {
        // Wait until the PIT output goes high (count finished).
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }

    let elapsed = u32::MAX - read(REG_TIMER_CURRENT);
    write(REG_TIMER_INITIAL, 0);

    TIMER_TICKS_PER_10MS.store(elapsed.max(1), Ordering::Release);
    info!("APIC timer: {} ticks/10ms (divide 16)", elapsed);
}
