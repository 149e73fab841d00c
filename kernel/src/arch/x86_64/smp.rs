//! SMP bring-up and per-CPU identification.
//!
//! Each core's sequential id is stored in a fixed slot whose address is
//! programmed into the GS base MSR at bring-up; `current_cpu_id()` is then
//! a single GS-relative load. APs are started through the boot protocol's
//! goto-address hook and enter the scheduler once their timer runs.

use core::sync::atomic::{AtomicU32, Ordering};

use log::{info, warn};

use super::apic;
use crate::sched::{self, MAX_CPUS};
use crate::timer::TICK_HZ;

const IA32_GS_BASE: u32 = 0xC000_0101;

/// Per-CPU id slots; GS base points at the owning core's entry.
static PERCPU_IDS: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Next sequential core id to hand out (0 = BSP).
static CPU_ID_NEXT: AtomicU32 = AtomicU32::new(0);

/// Cores that reached the scheduler.
static CPUS_ONLINE: AtomicU32 = AtomicU32::new(0);

/// Claim the next core id and wire GS to its per-CPU slot.
fn install_next_cpu_id() -> u32 {
    let id = CPU_ID_NEXT.fetch_add(1, Ordering::AcqRel);
    let slot = id as usize % MAX_CPUS;
    PERCPU_IDS[slot].store(id, Ordering::Release);

    let addr = PERCPU_IDS[slot].as_ptr() as u64;
    let mut msr = x86_64::registers::model_specific::Msr::new(IA32_GS_BASE);
    // SAFETY: GS base is unused by this kernel except as the per-CPU
    // pointer; the slot is a static that lives forever.
    unsafe { msr.write(addr) };
    id
}

/// Core id of the calling CPU. Answers 0 before the per-CPU register is
/// wired up, which is correct for the BSP during early boot.
pub fn current_cpu_id() -> usize {
    let msr = x86_64::registers::model_specific::Msr::new(IA32_GS_BASE);
    // SAFETY: Reading GS base has no side effects.
    if unsafe { msr.read() } == 0 {
        return 0;
    }
    let id: u32;
    // SAFETY: GS base points at this core's id slot, installed by
    // `install_next_cpu_id` and never moved afterwards.
    unsafe {
        core::arch::asm!("mov {0:e}, gs:[0]", out(reg) id, options(nostack, readonly));
    }
    id as usize
}

/// Number of cores that reached the scheduler.
pub fn cpus_online() -> u32 {
    CPUS_ONLINE.load(Ordering::Acquire)
}

/// BSP half of SMP init: claim core 0, start the local timer.
pub fn init_bsp() -> crate::error::KernelResult<()> {
    let id = install_next_cpu_id();
    debug_assert_eq!(id, 0);

    super::interrupts::init();
    apic::timer_init_cpu()?;
    apic::timer_set_frequency(TICK_HZ);
    CPUS_ONLINE.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

/// Start every application processor listed by the boot protocol.
pub fn start_aps(mp: &limine::response::MpResponse) {
    let bsp_lapic = mp.bsp_lapic_id();
    let mut started = 0usize;

    for cpu in mp.cpus() {
        if cpu.lapic_id == bsp_lapic {
            continue;
        }
        if started + 1 >= MAX_CPUS {
            warn!("more CPUs than per-CPU slots, leaving the rest parked");
            break;
        }
        cpu.goto_address.write(ap_entry);
        started += 1;
    }
    info!("started {} application processors", started);
}

/// First code an AP runs. Installs its per-CPU id, brings up its timer,
/// and enters the scheduler.
extern "C" fn ap_entry(cpu: &limine::mp::Cpu) -> ! {
    let id = install_next_cpu_id();
    info!("core {} online (LAPIC {})", id, cpu.lapic_id);

    super::interrupts::init();
    if apic::timer_init_cpu().is_err() {
        crate::arch::cpu::halt_forever();
    }
    apic::timer_set_frequency(TICK_HZ);
    CPUS_ONLINE.fetch_add(1, Ordering::AcqRel);

    x86_64::instructions::interrupts::enable();
    sched::schedule();
    // Nothing runnable yet: idle until the timer delivers work.
    loop {
        crate::arch::cpu::halt();
    }
}
