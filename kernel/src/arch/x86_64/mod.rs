//! x86_64 support: context frame, APIC timer, SMP bring-up, IDT glue.

pub mod context;

#[cfg(target_os = "none")]
pub mod apic;
#[cfg(target_os = "none")]
pub mod interrupts;
#[cfg(target_os = "none")]
pub mod smp;
