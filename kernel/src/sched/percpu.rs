//! Per-CPU scheduler state.
//!
//! Fixed arrays indexed by the core id the bootstrap wires into a per-CPU
//! register. Each slot owns the core's run queue (IRQ-save lock: the
//! timer handler rotates it), the current-task PID, the placement counter
//! and the tick counter.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::sync::SpinLock;
use crate::task::Pid;

/// Cores supported by the fixed per-CPU arrays.
pub const MAX_CPUS: usize = 16;

/// PID sentinel for "no current task".
const NO_TASK: Pid = 0;

/// One core's scheduler state.
pub struct CpuSlot {
    /// PID of the task this core is running (0 = none).
    current: AtomicU32,
    /// Runnable tasks, FIFO. The running task is not in the queue.
    pub run_queue: SpinLock<VecDeque<Pid>>,
    /// Tasks placed on this core; the load-balancing metric.
    task_count: AtomicU32,
    /// Timer ticks observed by this core.
    ticks: AtomicU64,
}

impl CpuSlot {
    const fn new() -> Self {
        Self {
            current: AtomicU32::new(NO_TASK),
            run_queue: SpinLock::new(VecDeque::new()),
            task_count: AtomicU32::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn current_pid(&self) -> Option<Pid> {
        match self.current.load(Ordering::Acquire) {
            NO_TASK => None,
            pid => Some(pid),
        }
    }

    pub fn set_current(&self, pid: Option<Pid>) {
        self.current.store(pid.unwrap_or(NO_TASK), Ordering::Release);
    }

    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn inc_task_count(&self) {
        self.task_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_task_count(&self) {
        self.task_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record one timer tick; returns the new count.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Queue length (takes the lock; diagnostics and placement tests).
    pub fn queue_len(&self) -> usize {
        self.run_queue.lock_irqsave().len()
    }
}

/// The per-CPU slots.
static CPUS: [CpuSlot; MAX_CPUS] = [const { CpuSlot::new() }; MAX_CPUS];

/// The slot for core `id`.
pub fn cpu(id: usize) -> &'static CpuSlot {
    &CPUS[id]
}

/// The slot for the calling core.
pub fn current_slot() -> &'static CpuSlot {
    cpu(crate::arch::cpu::current_cpu_id())
}

/// Placement counters of all cores, in index order.
pub fn task_counts() -> [u32; MAX_CPUS] {
    let mut counts = [0u32; MAX_CPUS];
    for (i, slot) in CPUS.iter().enumerate() {
        counts[i] = slot.task_count();
    }
    counts
}

/// Serializes the tests that touch the shared per-CPU slots and counters;
/// the standard harness runs tests in parallel threads.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) static SCHED_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
