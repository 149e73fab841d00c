//! Boot protocol handoff, reduced to the queries the core consumes.
//!
//! The bootloader-specific request plumbing lives in the binary; what the
//! core sees is a sequence of typed memory-map records, the HHDM offset
//! (already recorded into [`crate::mm::init_direct_map`]), and the SMP
//! topology.

/// Classification of a memory-map record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMemoryKind {
    /// Usable RAM.
    Usable,
    /// Reserved by firmware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM.
    BadMemory,
    /// Bootloader structures, reclaimable once boot data is consumed.
    BootloaderReclaimable,
    /// The kernel image and boot modules.
    KernelAndModules,
    /// The framebuffer aperture.
    Framebuffer,
    /// Anything the protocol reports that we do not classify.
    Unknown(u64),
}

/// One record of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct BootMemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: BootMemoryKind,
}

impl BootMemoryRegion {
    pub const fn new(base: u64, length: u64, kind: BootMemoryKind) -> Self {
        Self { base, length, kind }
    }

    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, BootMemoryKind::Usable)
    }
}

/// SMP topology from the boot protocol.
#[derive(Debug, Clone, Copy)]
pub struct SmpTopology {
    pub cpu_count: usize,
    pub bsp_lapic_id: u32,
}

/// Topology recorded once during early boot.
static SMP_TOPOLOGY: crate::sync::OnceLock<SmpTopology> = crate::sync::OnceLock::new();

/// Record the SMP topology the boot protocol reported. A second call is
/// ignored.
pub fn record_smp_topology(topology: SmpTopology) {
    let _ = SMP_TOPOLOGY.set(topology);
}

/// The recorded SMP topology, if boot provided one.
pub fn smp_topology() -> Option<&'static SmpTopology> {
    SMP_TOPOLOGY.get()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn usable_classification() {
        let r = BootMemoryRegion::new(0x10_0000, 0x40_0000, BootMemoryKind::Usable);
        assert!(r.is_usable());
        let r = BootMemoryRegion::new(0, 0x1000, BootMemoryKind::Reserved);
        assert!(!r.is_usable());
    }

    #[test]
    fn topology_records_once() {
        record_smp_topology(SmpTopology {
            cpu_count: 4,
            bsp_lapic_id: 0,
        });
        record_smp_topology(SmpTopology {
            cpu_count: 8,
            bsp_lapic_id: 1,
        });
        let t = smp_topology().expect("topology recorded");
        assert_eq!(t.cpu_count, 4);
    }
}
