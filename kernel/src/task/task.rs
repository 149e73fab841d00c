//! The task control block.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::x86_64::context::{self, TaskContext};
use crate::error::{KernelError, KernelResult};
use crate::mm::descriptor::MemoryDescriptor;
use crate::mm::PAGE_SIZE;

/// Process identifier. Zero is never allocated and doubles as the per-CPU
/// "no current task" sentinel.
pub type Pid = u32;

/// Kernel stack size: four pages.
pub const KERNEL_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// Sentinel for a task not yet placed on any CPU.
pub const NO_CPU: u32 = u32::MAX;

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running = 0,
    SleepingInterruptible = 1,
    SleepingUninterruptible = 2,
    Stopped = 4,
    Traced = 5,
    Zombie = 6,
    Dead = 7,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Running,
            1 => TaskState::SleepingInterruptible,
            2 => TaskState::SleepingUninterruptible,
            4 => TaskState::Stopped,
            5 => TaskState::Traced,
            6 => TaskState::Zombie,
            _ => TaskState::Dead,
        }
    }
}

/// A task's kernel stack: an owned, 16-byte-aligned allocation that dies
/// with the task.
struct KernelStack {
    base: NonNull<u8>,
    layout: core::alloc::Layout,
}

impl KernelStack {
    fn new() -> KernelResult<Self> {
        let layout = core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, 16)
            .map_err(|_| KernelError::InvalidArgument { name: "stack" })?;
        // SAFETY: The layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(KernelError::oom(KERNEL_STACK_SIZE))?;
        Ok(Self { base, layout })
    }

    /// Initial stack pointer: the top of the allocation, 16-aligned.
    fn top(&self) -> u64 {
        ((self.base.as_ptr() as u64) + KERNEL_STACK_SIZE as u64) & !0xF
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: `base` came from alloc_zeroed with exactly this layout.
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

// SAFETY: The stack memory is exclusively owned by the task holding it.
unsafe impl Send for KernelStack {}
// SAFETY: Only raw addresses are read through shared references.
unsafe impl Sync for KernelStack {}

/// Task control block.
///
/// `#[repr(C)]` with the context first: the interrupt stubs reach the save
/// area at offset 0 through the per-CPU current-task pointer.
#[repr(C)]
pub struct Task {
    /// Register save area. MUST stay the first field.
    context: UnsafeCell<TaskContext>,

    /// Process id, unique while the task is alive.
    pub pid: Pid,
    /// Thread group id; equals `pid` until threads exist.
    pub tgid: Pid,

    /// Owning CPU ([`NO_CPU`] until placed). The single source of truth
    /// for which run queue may hold this task.
    cpu: AtomicU32,
    /// Reserved for a priority scheduler; carried but not consulted.
    pub priority: u8,
    state: AtomicU8,

    /// User tasks own a memory descriptor; kernel tasks run in the shared
    /// kernel half and have none.
    md: Mutex<Option<MemoryDescriptor>>,

    kernel_stack: Option<KernelStack>,

    parent: Mutex<Option<Pid>>,
    children: Mutex<Vec<Pid>>,
    zombie_children: Mutex<Vec<Pid>>,

    exit_code: AtomicI32,
    exit_signal: AtomicI32,
}

// SAFETY: All mutable state is behind atomics or locks except the context,
// which is only written by the core that owns the task (the interrupt stub
// saving into it, or creation before the task is visible to anyone).
unsafe impl Send for Task {}
// SAFETY: As above; shared references never hand out &mut to the context.
unsafe impl Sync for Task {}

impl Task {
    /// Bare task: zeroed context, empty relations, runnable, background
    /// priority. The building block for the kernel/user factories.
    fn create(pid: Pid) -> Self {
        Self {
            context: UnsafeCell::new(TaskContext::zeroed()),
            pid,
            tgid: pid,
            cpu: AtomicU32::new(NO_CPU),
            priority: 99,
            state: AtomicU8::new(TaskState::Running as u8),
            md: Mutex::new(None),
            kernel_stack: None,
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            zombie_children: Mutex::new(Vec::new()),
            exit_code: AtomicI32::new(0),
            exit_signal: AtomicI32::new(0),
        }
    }

    /// Raw pointer to the context save area (offset 0 of the task).
    pub fn context_ptr(&self) -> *mut TaskContext {
        self.context.get()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// CPU this task is pinned to, if placed.
    pub fn cpu_id(&self) -> Option<usize> {
        match self.cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            id => Some(id as usize),
        }
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu as u32, Ordering::Release);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn exit_signal(&self) -> i32 {
        self.exit_signal.load(Ordering::Acquire)
    }

    pub fn parent(&self) -> Option<Pid> {
        *self.parent.lock()
    }

    pub fn set_parent(&self, parent: Option<Pid>) {
        *self.parent.lock() = parent;
    }

    pub fn children(&self) -> Vec<Pid> {
        self.children.lock().clone()
    }

    pub fn zombie_children(&self) -> Vec<Pid> {
        self.zombie_children.lock().clone()
    }

    pub(crate) fn add_child(&self, pid: Pid) {
        self.children.lock().push(pid);
    }

    pub(crate) fn remove_child(&self, pid: Pid) {
        self.children.lock().retain(|&c| c != pid);
    }

    pub(crate) fn add_zombie(&self, pid: Pid) {
        self.zombie_children.lock().push(pid);
    }

    pub(crate) fn remove_zombie(&self, pid: Pid) -> bool {
        let mut zombies = self.zombie_children.lock();
        let had = zombies.contains(&pid);
        zombies.retain(|&c| c != pid);
        had
    }

    pub fn has_memory_descriptor(&self) -> bool {
        self.md.lock().is_some()
    }

    pub fn set_memory_descriptor(&self, md: MemoryDescriptor) {
        *self.md.lock() = Some(md);
    }

    pub fn take_memory_descriptor(&self) -> Option<MemoryDescriptor> {
        self.md.lock().take()
    }

    /// Run `f` against this task's memory descriptor, if it has one.
    pub fn with_memory_descriptor<R>(
        &self,
        f: impl FnOnce(&mut MemoryDescriptor) -> R,
    ) -> Option<R> {
        self.md.lock().as_mut().map(f)
    }
}

/// Create a kernel task that starts at `entry` on a fresh 4-page stack,
/// interrupts enabled, kernel selectors. The task is registered in the
/// global table but not yet scheduled anywhere.
pub fn create_kernel_task(entry: fn()) -> KernelResult<Arc<Task>> {
    let mut task = Task::create(super::alloc_pid());

    let stack = KernelStack::new()?;
    // SAFETY: The task is not shared yet; writing the context is exclusive.
    unsafe {
        *task.context.get() = TaskContext::kernel_entry(entry as usize as u64, stack.top());
    }
    task.kernel_stack = Some(stack);

    let task = Arc::new(task);
    super::table::insert(Arc::clone(&task));
    Ok(task)
}

/// Create a user task: fresh PID, its own address space behind a memory
/// descriptor. Register layout and entry point are the loader's business
/// and stay zeroed here.
pub fn create_user_task() -> KernelResult<Arc<Task>> {
    let mut frames = crate::mm::heap::GlobalFrames;
    let space = crate::mm::vmm::create_address_space(&mut frames)?;

    let task = Task::create(super::alloc_pid());
    task.set_memory_descriptor(MemoryDescriptor::new(space));

    let task = Arc::new(task);
    super::table::insert(Arc::clone(&task));
    Ok(task)
}

/// Register `child` under `parent`.
pub fn add_child(parent: &Arc<Task>, child: &Arc<Task>) {
    child.set_parent(Some(parent.pid));
    parent.add_child(child.pid);
}

const _: () = {
    // The interrupt stubs address the context through the task pointer;
    // the context must therefore be the first field.
    assert!(core::mem::offset_of!(Task, context) == 0);
    assert!(context::KERNEL_CS == 0x08);
};
