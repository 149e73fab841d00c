//! Ferrite kernel library
//!
//! Core of a small preemptive x86_64 kernel: physical memory management
//! (buddy + slab + guarded heap), a 4-level page-table VMM with per-task
//! address spaces, and a per-CPU round-robin scheduler with task lifecycle.
//!
//! The crate builds for bare metal (`target_os = "none"`) and for the host,
//! where the allocator, VMM and scheduler logic run under the standard test
//! harness against direct-map-backed buffers.

#![no_std]

extern crate alloc;

// Host target: link std and use the system allocator so unit tests can
// allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: all Rust allocations go through the kernel heap (early boot
// heap until the buddy/slab heap is initialized).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator::new();

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod logger;
pub mod mm;
pub mod sched;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod serial;
pub mod sync;
pub mod task;
pub mod timer;


// Re-export the pieces collaborators touch most.
pub use error::{KernelError, KernelResult};
pub use mm::{DirectMap, PhysAddr, VirtAddr, PAGE_SIZE};
pub use task::{Task, TaskState};
