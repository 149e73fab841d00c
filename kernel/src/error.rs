//! Kernel error types
//!
//! One error enum for the whole core, with enough context attached to each
//! variant to make a log line useful on its own.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Allocation failed (buddy, slab, heap or frame supply).
    OutOfMemory {
        requested: usize,
    },
    /// The page-table entry for this address is already present.
    AlreadyMapped {
        addr: u64,
    },
    /// No mapping exists for this address.
    NotMapped {
        addr: u64,
    },
    /// A magic word did not survive; the memory around `addr` was run over.
    Corruption {
        addr: u64,
    },
    /// The freed-pattern sentinel was found where a live allocation was
    /// expected.
    DoubleFree {
        addr: u64,
    },
    /// An access was denied by the region permissions (guard page hit or
    /// permission mismatch).
    AccessDenied {
        addr: u64,
    },
    /// Null pointer, misaligned range, zero size, out-of-range order.
    InvalidArgument {
        name: &'static str,
    },
    /// No task with this PID exists in the task table.
    TaskNotFound {
        pid: u32,
    },
    /// A fixed-capacity structure ran out of slots.
    ResourceExhausted {
        resource: &'static str,
    },
    /// Subsystem used before its init ran.
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Result type alias used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::AlreadyMapped { addr } => {
                write!(f, "address {:#x} is already mapped", addr)
            }
            KernelError::NotMapped { addr } => write!(f, "address {:#x} is not mapped", addr),
            KernelError::Corruption { addr } => {
                write!(f, "memory corruption detected at {:#x}", addr)
            }
            KernelError::DoubleFree { addr } => write!(f, "double free detected at {:#x}", addr),
            KernelError::AccessDenied { addr } => write!(f, "access denied at {:#x}", addr),
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::TaskNotFound { pid } => write!(f, "no task with pid {}", pid),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn display_carries_context() {
        let e = KernelError::AlreadyMapped { addr: 0x400000 };
        assert_eq!(format!("{}", e), "address 0x400000 is already mapped");

        let e = KernelError::OutOfMemory { requested: 5000 };
        assert!(format!("{}", e).contains("5000"));
    }
}
