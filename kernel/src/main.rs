//! Ferrite kernel binary: Limine handoff and bring-up.
//!
//! Boot order matters: direct map first (everything touches physical
//! memory through it), then buddy → heap, the kernel address space, the
//! IDT and APIC, and finally SMP and the first tasks.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod kernel_entry {
    use ferrite_kernel::arch::x86_64::{apic, smp};
    use ferrite_kernel::boot::{BootMemoryKind, BootMemoryRegion};
    use ferrite_kernel::mm::buddy::{BuddyAllocator, MAX_ARENAS};
    use ferrite_kernel::mm::{self, heap, vmm};
    use ferrite_kernel::{arch, logger, sched, task, timer};

    use limine::memory_map::EntryType;
    use limine::request::{HhdmRequest, MemoryMapRequest, MpRequest};
    use limine::BaseRevision;
    use log::{error, info, LevelFilter};

    #[used]
    #[link_section = ".limine_requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".limine_requests"]
    static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".limine_requests"]
    static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".limine_requests"]
    static MP_REQUEST: MpRequest = MpRequest::new();

    fn classify(entry_type: EntryType) -> BootMemoryKind {
        if entry_type == EntryType::USABLE {
            BootMemoryKind::Usable
        } else if entry_type == EntryType::RESERVED {
            BootMemoryKind::Reserved
        } else if entry_type == EntryType::ACPI_RECLAIMABLE {
            BootMemoryKind::AcpiReclaimable
        } else if entry_type == EntryType::ACPI_NVS {
            BootMemoryKind::AcpiNvs
        } else if entry_type == EntryType::BAD_MEMORY {
            BootMemoryKind::BadMemory
        } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            BootMemoryKind::BootloaderReclaimable
        } else if entry_type == EntryType::EXECUTABLE_AND_MODULES {
            BootMemoryKind::KernelAndModules
        } else if entry_type == EntryType::FRAMEBUFFER {
            BootMemoryKind::Framebuffer
        } else {
            BootMemoryKind::Unknown(0)
        }
    }

    /// A task to park each core on until there is real work.
    fn idle_task() {
        loop {
            arch::cpu::halt();
        }
    }

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        logger::init(LevelFilter::Info);
        info!("ferrite kernel booting");

        let hhdm = HHDM_REQUEST
            .get_response()
            .expect("boot protocol must provide the HHDM offset")
            .offset();
        mm::init_direct_map(hhdm);

        let memmap = MEMORY_MAP_REQUEST
            .get_response()
            .expect("boot protocol must provide a memory map");

        // Flatten the protocol entries into neutral records; the buddy
        // does not know what a bootloader is.
        let mut regions = [BootMemoryRegion::new(0, 0, BootMemoryKind::Reserved); 4 * MAX_ARENAS];
        let mut count = 0;
        for entry in memmap.entries() {
            if count == regions.len() {
                break;
            }
            regions[count] =
                BootMemoryRegion::new(entry.base, entry.length, classify(entry.entry_type));
            count += 1;
        }

        let buddy = BuddyAllocator::from_memory_map(mm::direct_map(), &regions[..count]);
        heap::init(buddy);
        info!("heap online");

        vmm::init().expect("adopting the boot page tables cannot fail twice");
        apic::global_init().expect("APIC bring-up failed");
        smp::init_bsp().expect("BSP timer bring-up failed");

        // One idle task per possible core so every AP has something to
        // rotate onto, then the APs.
        if let Some(mp) = MP_REQUEST.get_response() {
            ferrite_kernel::boot::record_smp_topology(ferrite_kernel::boot::SmpTopology {
                cpu_count: mp.cpus().len(),
                bsp_lapic_id: mp.bsp_lapic_id(),
            });
            for _ in 0..mp.cpus().len() {
                sched::spawn_kernel_task(idle_task).expect("idle task creation failed");
            }
            smp::start_aps(mp);
        } else {
            info!("no SMP response, running single-core");
            sched::spawn_kernel_task(idle_task).expect("idle task creation failed");
        }

        // Give the APs a moment to reach their schedulers before the
        // summary line.
        timer::busy_sleep_ms(50);
        info!(
            "scheduler online, {} cores, {} tasks, uptime {} ms",
            smp::cpus_online(),
            task::table::count(),
            timer::uptime_ms()
        );

        x86_64::instructions::interrupts::enable();
        sched::schedule();
        loop {
            arch::cpu::halt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        error!("kernel panic: {}", info);
        arch::cpu::halt_forever();
    }
}

// The binary target also builds on the host (tests live in the library);
// give it a trivial entry point there.
#[cfg(not(target_os = "none"))]
fn main() {}
