//! GDT — Global Descriptor Table
//!
//! Kernel and user segments plus the Task State Segment. The TSS ring-0
//! stack slot is repointed to the destination slot's kernel stack on
//! every process-context transfer (execute, halt, scheduler switch).

use core::ptr::{addr_of, addr_of_mut};
use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{CS, DS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// Stack size for each IST entry (32 KB)
const IST_STACK_SIZE: usize = 32 * 1024;

/// IST index for double faults, which must not reuse a possibly-broken stack
pub const DOUBLE_FAULT_IST: u16 = 0;

/// Mutable so the privilege stack can follow the current process slot.
/// Written only with interrupts disabled.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Segment selectors used by the kernel and userspace
pub struct SegmentSelectors {
    pub tss: SegmentSelector,
    pub k_code: SegmentSelector,
    pub k_data: SegmentSelector,
    pub u_code: SegmentSelector,
    pub u_data: SegmentSelector,
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, SegmentSelectors) = {
        let mut gdt = GlobalDescriptorTable::new();

        let tss = gdt.add_entry(Descriptor::tss_segment(unsafe { &*addr_of!(TSS) }));
        let k_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let k_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let u_code = gdt.add_entry(Descriptor::user_code_segment());
        let u_data = gdt.add_entry(Descriptor::user_data_segment());

        (gdt, SegmentSelectors { tss, k_code, k_data, u_code, u_data })
    };
}

/// Install the destination slot's kernel stack as the ring-3 → ring-0
/// transition stack. Must happen before any transfer that can trap back
/// into the kernel on the new slot's behalf.
pub fn set_kernel_stack(top: VirtAddr) {
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = top;
    }
}

pub fn init() {
    unsafe {
        let tss = &mut *addr_of_mut!(TSS);
        tss.interrupt_stack_table[DOUBLE_FAULT_IST as usize] = {
            static mut STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
            VirtAddr::from_ptr(addr_of!(STACK)) + IST_STACK_SIZE as u64
        };
    }

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.k_code);
        DS::set_reg(GDT.1.k_data);
        load_tss(GDT.1.tss);
    }
}
