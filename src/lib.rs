//! Triton — a teaching x86_64 kernel with three virtual terminals.
//!
//! Each terminal runs its own tree of user programs rooted at a shell.
//! The kernel core is the process/memory subsystem: the PCB directory,
//! the per-slot user address window, the buddy block allocator, the
//! execute/halt lifecycle, the round-robin terminal scheduler, and the
//! virtualized RTC.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

use bootloader::BootInfo;

pub mod sys;

/// Filesystem catalog image packed by build.rs (boot block + stub programs).
pub static CATALOG_IMAGE: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/triton.img"));

// ---------------------------------------------------------------------------
// Kernel heap — backs alloc for kernel strings/formatting only.
// User malloc() goes through the buddy allocator instead.
// ---------------------------------------------------------------------------

pub const KERNEL_HEAP_SIZE: usize = 512 * 1024;

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap =
    linked_list_allocator::LockedHeap::empty();

#[cfg(target_os = "none")]
fn heap_init() {
    static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];
    unsafe {
        KERNEL_HEAP
            .lock()
            .init(core::ptr::addr_of_mut!(HEAP_SPACE) as *mut u8, KERNEL_HEAP_SIZE);
    }
}

#[cfg(not(target_os = "none"))]
fn heap_init() {}

// ---------------------------------------------------------------------------
// Boot initialization — order matters: segments and vectors first, then
// memory, then devices; PIC last since it enables interrupts and the first
// timer tick hands the CPU to the scheduler.
// ---------------------------------------------------------------------------

pub fn init(boot_info: &'static BootInfo) {
    sys::gdt::init();
    sys::idt::init();
    sys::mem::init(boot_info);
    heap_init();
    sys::vga::init();
    sys::fs::init(CATALOG_IMAGE);
    sys::clk::init();
    sys::clk::rtc::hardware_init();
    sys::keyboard::init();
    sys::pic::init();
}

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

// ---------------------------------------------------------------------------
// Log macros — print! goes to the displayed terminal, k*! to the serial port
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::sys::vga::print_fmt(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::sys::debug::serial::log_fmt("  log", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::sys::debug::serial::log_fmt(" warn", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::sys::debug::serial::log_fmt("error", format_args!($($arg)*));
        $crate::print!("[error] {}\n", format_args!($($arg)*));
    }};
}
