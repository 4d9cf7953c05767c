//! proc — process management: PCB directory, execute/halt, scheduler

pub mod pid;
pub mod process;
pub mod sched;
