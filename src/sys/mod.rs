//! sys — Triton kernel subsystems
//!
//! Layout:
//!   arch/  — x86_64: gdt, idt, pic
//!   proc/  — process management: pid directory, execute/halt, scheduler
//!   mem/   — address space manager and buddy allocator
//!   clk/   — PIT tick source and the virtualized RTC
//!   fs/    — read-only file catalog
//!   debug/ — serial logging

pub mod arch;
pub mod proc;
pub mod debug;

// Re-exports so call sites read sys::gdt::, sys::pid::, etc.
pub use arch::gdt;
pub use arch::idt;
pub use arch::pic;
pub use proc::pid;
pub use proc::process;
pub use proc::sched;

pub mod clk;
pub mod fs;
pub mod keyboard;
pub mod mem;
pub mod syscall;
pub mod terminal;
pub mod vga;
