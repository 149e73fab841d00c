//! Architecture support
//!
//! The core consumes a narrow surface from the architecture layer: local
//! interrupt masking, TLB maintenance, CR3 access, the per-CPU core id, the
//! context-switch trampoline, and timer/interrupt installation. Everything
//! here that touches hardware is gated to bare metal; host builds get inert
//! stand-ins so the core logic stays testable.

pub mod cpu;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::context::TaskContext;
