//! Task exit, wake-up, orphaning, and reaping.
//!
//! Exit turns a task into a zombie and hands the CPU away; the parent
//! reaps the zombie to recover the exit code and let the task object die.

use alloc::sync::Arc;

use log::warn;

use super::table;
use super::task::{Pid, Task, TaskState};
use crate::arch::cpu;
use crate::error::{KernelError, KernelResult};
use crate::mm::heap::GlobalFrames;
use crate::sched;

/// Exit bookkeeping, shared by [`task_exit`] and tests.
///
/// Marks the task a zombie, pulls it out of its run queue, releases the
/// memory descriptor, notifies a waiting parent, and orphans live
/// children. Interrupts are expected to be masked by the caller.
pub fn exit_task(task: &Arc<Task>, code: i32) {
    task.set_exit_code(code);
    task.set_state(TaskState::Zombie);

    sched::sched_remove(task);
    if let Some(cpu_id) = task.cpu_id() {
        sched::percpu::cpu(cpu_id).dec_task_count();
    }

    // User tasks give their address space back immediately; only the
    // zombie shell survives until the parent reaps it.
    if let Some(md) = task.take_memory_descriptor() {
        md.release(&mut GlobalFrames);
    }

    // A parent sleeping in wait gets the zombie moved over and woken.
    if let Some(parent) = task.parent().and_then(table::get) {
        if parent.state() == TaskState::SleepingInterruptible {
            parent.remove_child(task.pid);
            parent.add_zombie(task.pid);
            wake_up_task(&parent);
        }
    }

    orphan_children(task);
}

/// Terminate the calling task. Never returns: the scheduler picks the next
/// task, and if the queue is empty the core parks until the timer finds it
/// work.
pub fn task_exit(code: i32) -> ! {
    cpu::save_and_disable_interrupts();

    if let Some(current) = table::current_task() {
        exit_task(&current, code);
    } else {
        warn!("task_exit with no current task on this core");
    }

    sched::schedule();
    // No runnable successor: idle with interrupts on so the timer can
    // hand this core its next task.
    cpu::restore_interrupts(0x202);
    loop {
        cpu::halt();
    }
}

/// Make `task` runnable again and place it on the least-busy core.
pub fn wake_up_task(task: &Arc<Task>) {
    task.set_state(TaskState::Running);
    let cpu_id = sched::select_cpu();
    sched::sched_task(task, cpu_id);
}

/// Detach all live children of a dying task.
///
/// TODO: re-parent orphans to init once init exists; until then they keep
/// running with no parent and can never be reaped.
pub fn orphan_children(task: &Arc<Task>) {
    for child_pid in task.children() {
        if let Some(child) = table::get(child_pid) {
            child.set_parent(None);
        }
        task.remove_child(child_pid);
    }
}

/// Reap one zombie child: recover its exit code, drop it from the table,
/// and let the task object die.
pub fn reap_zombie(parent: &Arc<Task>, pid: Pid) -> KernelResult<i32> {
    if !parent.remove_zombie(pid) {
        return Err(KernelError::TaskNotFound { pid });
    }
    let Some(zombie) = table::remove(pid) else {
        return Err(KernelError::TaskNotFound { pid });
    };
    let code = zombie.exit_code();
    zombie.set_state(TaskState::Dead);
    Ok(code)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::task::task::{add_child, create_kernel_task};

    fn idle() {}

    #[test]
    fn exit_makes_a_zombie_and_reap_recovers_the_code() {
        // The wake-up path touches the shared per-CPU counters.
        let _guard = sched::percpu::SCHED_TEST_LOCK.lock().expect("test lock");
        let parent = create_kernel_task(idle).expect("parent");
        let child = create_kernel_task(idle).expect("child");
        add_child(&parent, &child);

        // Parent is waiting; the child's exit must move it to the zombie
        // list and wake the parent.
        parent.set_state(TaskState::SleepingInterruptible);
        exit_task(&child, 42);

        assert_eq!(child.state(), TaskState::Zombie);
        assert_eq!(parent.state(), TaskState::Running);
        assert!(parent.children().is_empty());
        assert_eq!(parent.zombie_children(), [child.pid]);

        let code = reap_zombie(&parent, child.pid).expect("zombie reaped");
        assert_eq!(code, 42);
        assert_eq!(child.state(), TaskState::Dead);
        assert!(table::get(child.pid).is_none());
        assert!(parent.zombie_children().is_empty());

        // Cleanup: undo the wake-up placement so other tests see the
        // per-CPU counters they expect.
        sched::sched_remove(&parent);
        if let Some(cpu_id) = parent.cpu_id() {
            sched::percpu::cpu(cpu_id).dec_task_count();
        }
        table::remove(parent.pid);
    }

    #[test]
    fn exit_without_waiting_parent_keeps_child_listed() {
        let parent = create_kernel_task(idle).expect("parent");
        let child = create_kernel_task(idle).expect("child");
        add_child(&parent, &child);

        // Parent is running, not waiting: the zombie stays among the
        // children until the parent looks for it.
        exit_task(&child, 7);
        assert_eq!(child.state(), TaskState::Zombie);
        assert_eq!(parent.children(), [child.pid]);
        assert!(parent.zombie_children().is_empty());

        table::remove(child.pid);
        table::remove(parent.pid);
    }

    #[test]
    fn orphans_are_detached() {
        let parent = create_kernel_task(idle).expect("parent");
        let a = create_kernel_task(idle).expect("child a");
        let b = create_kernel_task(idle).expect("child b");
        add_child(&parent, &a);
        add_child(&parent, &b);

        exit_task(&parent, 0);
        assert!(parent.children().is_empty());
        assert_eq!(a.parent(), None);
        assert_eq!(b.parent(), None);

        for pid in [parent.pid, a.pid, b.pid] {
            table::remove(pid);
        }
    }

    #[test]
    fn reaping_a_non_zombie_fails() {
        let parent = create_kernel_task(idle).expect("parent");
        assert_eq!(
            reap_zombie(&parent, 999_999),
            Err(KernelError::TaskNotFound { pid: 999_999 })
        );
        table::remove(parent.pid);
    }
}
