//! Task model and lifecycle
//!
//! Tasks are reference-counted and live in a global table keyed by PID;
//! the scheduler's run queues and the parent/child relations all speak in
//! PIDs. The context save area sits at offset 0 of every task, which is
//! how the interrupt stubs find it through the per-CPU current pointer.

pub mod lifecycle;
pub mod table;
#[allow(clippy::module_inception)]
pub mod task;

pub use lifecycle::{reap_zombie, task_exit, wake_up_task};
pub use table::{current_task, TASK_TABLE};
pub use task::{Pid, Task, TaskState, KERNEL_STACK_SIZE};

use crate::sync::SpinLock;

/// PIDs wrap back to 2 here; PID 1 is reserved for init.
pub const PID_MAX: Pid = 1_111_111_111;

/// Next PID to hand out. Serialized; allocation is rare.
static PID_NEXT: SpinLock<Pid> = SpinLock::new(1);

/// Allocate a PID. Monotonic until [`PID_MAX`], then wraps to 2.
pub fn alloc_pid() -> Pid {
    let mut next = PID_NEXT.lock();
    let pid = *next;
    *next += 1;
    if *next > PID_MAX {
        *next = 2;
    }
    pid
}
