//! arch — x86_64 plumbing: segments, vector table, interrupt controller

pub mod gdt;
pub mod idt;
pub mod pic;
