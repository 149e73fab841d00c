//! Global task table
//!
//! Every live task is held here by PID. Run queues and relation lists
//! store bare PIDs and resolve them through this table, so a task object
//! lives exactly as long as the table (or a transient caller) holds its
//! `Arc`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::task::{Pid, Task};
use crate::sync::SpinLock;

/// The task table. IRQ-save lock: exit paths run with interrupts masked
/// and the timer path resolves the current task from interrupt context.
pub static TASK_TABLE: SpinLock<BTreeMap<Pid, Arc<Task>>> = SpinLock::new(BTreeMap::new());

/// Insert a task.
pub fn insert(task: Arc<Task>) {
    TASK_TABLE.lock_irqsave().insert(task.pid, task);
}

/// Look a task up by PID.
pub fn get(pid: Pid) -> Option<Arc<Task>> {
    TASK_TABLE.lock_irqsave().get(&pid).cloned()
}

/// Remove a task from the table, returning its `Arc` so the caller decides
/// when the object actually dies.
pub fn remove(pid: Pid) -> Option<Arc<Task>> {
    TASK_TABLE.lock_irqsave().remove(&pid)
}

/// Number of tasks currently registered.
pub fn count() -> usize {
    TASK_TABLE.lock_irqsave().len()
}

/// Snapshot of all registered PIDs.
pub fn pids() -> Vec<Pid> {
    TASK_TABLE.lock_irqsave().keys().copied().collect()
}

/// The task running on this core, if any.
pub fn current_task() -> Option<Arc<Task>> {
    let cpu = crate::arch::cpu::current_cpu_id();
    let pid = crate::sched::percpu::cpu(cpu).current_pid()?;
    get(pid)
}
