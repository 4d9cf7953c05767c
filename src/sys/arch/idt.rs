//! IDT — exceptions, hardware IRQs, and the syscall gate
//!
//! Drivers register their IRQ handlers with set_irq_handler; the
//! common stub acknowledges the PIC before the handler runs, because
//! the timer handler may switch continuations and not come back.
//!
//! A fault raised from ring 3 kills the offending process with the
//! out-of-band 256 status; the same fault in ring 0 is a kernel bug
//! and panics.

#[cfg(target_os = "none")]
pub use kernel::{init, set_irq_handler};

#[cfg(not(target_os = "none"))]
pub fn init() {}

#[cfg(target_os = "none")]
mod kernel {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use x86_64::registers::control::Cr2;
    use x86_64::structures::idt::{
        InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
    };
    use x86_64::{PrivilegeLevel, VirtAddr};

    use crate::sys::{gdt, pic, process, syscall};

    pub type IrqHandler = fn();

    fn default_irq_handler() {}

    static IRQ_HANDLERS: Mutex<[IrqHandler; 16]> = Mutex::new([default_irq_handler; 16]);

    pub fn set_irq_handler(irq: u8, handler: IrqHandler) {
        IRQ_HANDLERS.lock()[irq as usize] = handler;
    }

    // -----------------------------------------------------------------------
    // IRQ stubs
    // -----------------------------------------------------------------------

    macro_rules! irq_fn {
        ($name:ident, $irq:expr) => {
            extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
                // EOI first: the handler may never return here
                pic::end_of_interrupt($irq);
                let handler = { IRQ_HANDLERS.lock()[$irq as usize] };
                handler();
            }
        };
    }

    irq_fn!(irq0, 0);
    irq_fn!(irq1, 1);
    irq_fn!(irq2, 2);
    irq_fn!(irq3, 3);
    irq_fn!(irq4, 4);
    irq_fn!(irq5, 5);
    irq_fn!(irq6, 6);
    irq_fn!(irq7, 7);
    irq_fn!(irq8, 8);
    irq_fn!(irq9, 9);
    irq_fn!(irq10, 10);
    irq_fn!(irq11, 11);
    irq_fn!(irq12, 12);
    irq_fn!(irq13, 13);
    irq_fn!(irq14, 14);
    irq_fn!(irq15, 15);

    // -----------------------------------------------------------------------
    // Exceptions
    // -----------------------------------------------------------------------

    fn fault(label: &str, frame: &InterruptStackFrame, code: u64) -> ! {
        let rip = frame.instruction_pointer.as_u64();
        if frame.code_segment & 0b11 == 0b11 {
            crate::kwarn!("{} in user program (rip={:#x}, code={:#x})", label, rip, code);
            // The faulting process may not own the displayed terminal.
            crate::sys::vga::print_fmt_to(
                process::current_terminal(),
                format_args!("exception: {}\n", label),
            );
            process::exception_halt();
        }
        panic!("{} in kernel (rip={:#x}, code={:#x})", label, rip, code);
    }

    macro_rules! exception_fn {
        ($name:ident, $label:expr) => {
            extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
                fault($label, &frame, 0);
            }
        };
    }

    exception_fn!(divide_error, "divide error");
    exception_fn!(overflow, "overflow");
    exception_fn!(bound_range, "bound range exceeded");
    exception_fn!(invalid_opcode, "invalid opcode");
    exception_fn!(device_not_available, "device not available");

    extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
        crate::kwarn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
    }

    extern "x86-interrupt" fn segment_not_present(frame: InterruptStackFrame, code: u64) {
        fault("segment not present", &frame, code);
    }

    extern "x86-interrupt" fn stack_segment_fault(frame: InterruptStackFrame, code: u64) {
        fault("stack segment fault", &frame, code);
    }

    extern "x86-interrupt" fn general_protection_fault(frame: InterruptStackFrame, code: u64) {
        fault("general protection fault", &frame, code);
    }

    extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, code: PageFaultErrorCode) {
        let addr = Cr2::read().as_u64();
        crate::kwarn!("page fault at {:#x}", addr);
        fault("page fault", &frame, code.bits());
    }

    extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, code: u64) -> ! {
        panic!(
            "double fault (rip={:#x}, code={:#x})",
            frame.instruction_pointer.as_u64(),
            code
        );
    }

    // -----------------------------------------------------------------------
    // Table
    // -----------------------------------------------------------------------

    lazy_static! {
        static ref IDT: InterruptDescriptorTable = {
            let mut idt = InterruptDescriptorTable::new();

            idt.divide_error.set_handler_fn(divide_error);
            idt.breakpoint.set_handler_fn(breakpoint);
            idt.overflow.set_handler_fn(overflow);
            idt.bound_range_exceeded.set_handler_fn(bound_range);
            idt.invalid_opcode.set_handler_fn(invalid_opcode);
            idt.device_not_available.set_handler_fn(device_not_available);
            idt.segment_not_present.set_handler_fn(segment_not_present);
            idt.stack_segment_fault.set_handler_fn(stack_segment_fault);
            idt.general_protection_fault.set_handler_fn(general_protection_fault);
            idt.page_fault.set_handler_fn(page_fault);
            unsafe {
                idt.double_fault
                    .set_handler_fn(double_fault)
                    .set_stack_index(gdt::DOUBLE_FAULT_IST);
            }

            let irqs: [extern "x86-interrupt" fn(InterruptStackFrame); 16] = [
                irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11,
                irq12, irq13, irq14, irq15,
            ];
            for (i, &handler) in irqs.iter().enumerate() {
                idt[pic::irq_vector(i as u8) as usize].set_handler_fn(handler);
            }

            unsafe {
                idt[0x80]
                    .set_handler_addr(VirtAddr::new(syscall::entry as u64))
                    .set_privilege_level(PrivilegeLevel::Ring3);
            }

            idt
        };
    }

    pub fn init() {
        IDT.load();
        crate::klog!("idt: vectors loaded");
    }
}
