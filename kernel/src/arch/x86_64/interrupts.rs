//! IDT glue for the vectors the core consumes: the periodic timer, the
//! page fault, and the APIC spurious vector.
//!
//! The stubs push the general-purpose registers on top of the hardware
//! frame so the stack image matches [`TaskContext`] exactly; the Rust
//! handlers copy that image into the current task's save area before
//! scheduling can switch away.

use lazy_static::lazy_static;
use log::error;
use x86_64::structures::idt::InterruptDescriptorTable;

use super::apic;
use super::context::TaskContext;
use crate::mm::heap::GlobalFrames;
use crate::mm::page_fault::{handle_page_fault, PageFaultErrorCode};
use crate::{sched, task, timer};

core::arch::global_asm!(
    r#"
    .global timer_isr_stub
timer_isr_stub:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call timer_interrupt_handler
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    iretq

    .global page_fault_isr_stub
page_fault_isr_stub:
    // Error code is on the stack below the hardware frame.
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, [rsp + 120]     // error code, below the 15 pushes
    call page_fault_interrupt_handler
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 8               // discard the error code
    iretq

    .global spurious_isr_stub
spurious_isr_stub:
    iretq
"#
);

extern "C" {
    fn timer_isr_stub();
    fn page_fault_isr_stub();
    fn spurious_isr_stub();
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: The stub symbols are the global_asm entry points above,
        // each of which preserves the interrupted context and iretqs.
        unsafe {
            idt[apic::TIMER_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(timer_isr_stub as usize as u64));
            idt.page_fault
                .set_handler_addr(x86_64::VirtAddr::new(page_fault_isr_stub as usize as u64));
            idt[apic::SPURIOUS_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(spurious_isr_stub as usize as u64));
        }
        idt
    };
}

/// Load the IDT on the calling core. Every core calls this during its
/// bring-up; the table itself is shared.
pub fn init() {
    IDT.load();
}

/// Timer interrupt: save the interrupted context into the current task,
/// account the tick, acknowledge, and rotate the run queue.
///
/// `frame` points at the register image the stub pushed; its layout is
/// exactly [`TaskContext`].
#[no_mangle]
extern "C" fn timer_interrupt_handler(frame: *const TaskContext) {
    if let Some(current) = task::current_task() {
        // SAFETY: `frame` is the stub's complete register image for the
        // interrupted task, which is exactly the task in the current slot;
        // nothing else writes this save area while its own core is here.
        unsafe {
            core::ptr::copy_nonoverlapping(frame, current.context_ptr(), 1);
        }
    }

    timer::on_tick();
    apic::eoi();
    sched::schedule();
}

/// Page fault: resolve demand growth through the current task's memory
/// descriptor, or treat the fault as fatal for this core.
#[no_mangle]
extern "C" fn page_fault_interrupt_handler(error_code: u64) {
    let fault_addr = x86_64::registers::control::Cr2::read_raw();
    let code = PageFaultErrorCode::from_bits_truncate(error_code);

    if let Some(current) = task::current_task() {
        let resolved = current
            .with_memory_descriptor(|md| handle_page_fault(md, fault_addr, code, &mut GlobalFrames));
        if let Some(Ok(())) = resolved {
            return;
        }
    }

    // Kernel-space fault or unresolvable user fault: halt this core.
    error!(
        "unhandled page fault at {:#x} (error code {:#x})",
        fault_addr, error_code
    );
    crate::arch::cpu::halt_forever();
}
