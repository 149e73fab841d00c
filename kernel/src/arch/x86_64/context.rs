//! Task context frame and the context-load trampoline.
//!
//! The layout of [`TaskContext`] is ABI: the interrupt stubs push the
//! general-purpose registers directly on top of the hardware interrupt
//! frame so that the stack image matches this struct field for field, and
//! [`load_next`] consumes the same layout. The struct must also sit at
//! offset 0 of `Task`, which is how the stubs reach the running task's
//! save area through the per-CPU current pointer.

/// Saved register state of a task.
///
/// Field order mirrors the interrupt stub: fifteen general-purpose
/// registers (r15 lowest), then the hardware `iretq` frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Hardware interrupt frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data/stack segment selector.
pub const KERNEL_SS: u64 = 0x10;
/// RFLAGS for a fresh task: IF set plus the always-one reserved bit.
pub const RFLAGS_KERNEL_TASK: u64 = 0x202;

impl TaskContext {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Context for a fresh kernel task: resume at `entry` on an empty
    /// stack whose top is `stack_top`, interrupts enabled.
    pub fn kernel_entry(entry: u64, stack_top: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.rip = entry;
        ctx.rsp = stack_top;
        ctx.rflags = RFLAGS_KERNEL_TASK;
        ctx.cs = KERNEL_CS;
        ctx.ss = KERNEL_SS;
        ctx
    }
}

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
    .global load_next_task
load_next_task:
    // rdi = &TaskContext. Build the iretq frame on the current stack,
    // restore the GPRs, and return into the target context; iretq swaps
    // rsp last, so the scratch pushes below never touch the new stack.
    push qword ptr [rdi + 152]   // ss
    push qword ptr [rdi + 144]   // rsp
    push qword ptr [rdi + 136]   // rflags
    push qword ptr [rdi + 128]   // cs
    push qword ptr [rdi + 120]   // rip
    mov r15, [rdi + 0]
    mov r14, [rdi + 8]
    mov r13, [rdi + 16]
    mov r12, [rdi + 24]
    mov r11, [rdi + 32]
    mov r10, [rdi + 40]
    mov r9,  [rdi + 48]
    mov r8,  [rdi + 56]
    mov rbp, [rdi + 64]
    mov rsi, [rdi + 80]
    mov rdx, [rdi + 88]
    mov rcx, [rdi + 96]
    mov rbx, [rdi + 104]
    mov rax, [rdi + 112]
    mov rdi, [rdi + 72]
    iretq
"#
);

#[cfg(target_os = "none")]
extern "C" {
    /// Restore `ctx` and resume execution inside it. Never returns to the
    /// caller; the previous context must already have been saved (the
    /// interrupt stub did that) or be dead (task exit).
    pub fn load_next_task(ctx: *const TaskContext) -> !;
}

/// Hand the CPU to `ctx`.
///
/// # Safety
///
/// `ctx` must point at a valid, fully initialized context whose stack and
/// instruction pointer are safe to resume. The caller abandons its own
/// execution path.
#[cfg(target_os = "none")]
pub unsafe fn load_next(ctx: *const TaskContext) -> ! {
    // SAFETY: Contract forwarded to the caller.
    unsafe { load_next_task(ctx) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn context_layout_matches_stub() {
        // The interrupt stubs and load_next_task address fields by offset;
        // these constants are the contract.
        assert_eq!(offset_of!(TaskContext, r15), 0);
        assert_eq!(offset_of!(TaskContext, rdi), 72);
        assert_eq!(offset_of!(TaskContext, rax), 112);
        assert_eq!(offset_of!(TaskContext, rip), 120);
        assert_eq!(offset_of!(TaskContext, cs), 128);
        assert_eq!(offset_of!(TaskContext, rflags), 136);
        assert_eq!(offset_of!(TaskContext, rsp), 144);
        assert_eq!(offset_of!(TaskContext, ss), 152);
        assert_eq!(size_of::<TaskContext>(), 160);
    }

    #[test]
    fn kernel_entry_context() {
        let ctx = TaskContext::kernel_entry(0xFFFF_8000_1234_0000, 0xFFFF_8000_00FF_0000);
        assert_eq!(ctx.rip, 0xFFFF_8000_1234_0000);
        assert_eq!(ctx.rsp, 0xFFFF_8000_00FF_0000);
        assert_eq!(ctx.rflags, RFLAGS_KERNEL_TASK);
        assert_eq!(ctx.cs, KERNEL_CS);
        assert_eq!(ctx.ss, KERNEL_SS);
        assert_eq!(ctx.rax, 0);
    }
}
