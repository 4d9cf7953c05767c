//! clk — time sources
//!
//! The PIT drives preemption: every tick bumps the uptime counter and
//! every SCHED_INTERVAL ticks the scheduler rotates to the next
//! terminal's process. The virtualized RTC lives in the rtc submodule.

pub mod rtc;

use core::sync::atomic::{AtomicU64, Ordering};

/// PIT channel 0 rate
pub const TICKS_PER_SEC: u64 = 1000;
/// Timer ticks per scheduling quantum
pub const SCHED_INTERVAL: u64 = 10;

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        // Channel 0, lobyte/hibyte, mode 3 (square wave)
        let divisor = 1193182u32 / TICKS_PER_SEC as u32;
        unsafe {
            let mut cmd: Port<u8> = Port::new(0x43);
            let mut ch0: Port<u8> = Port::new(0x40);
            cmd.write(0x36);
            ch0.write((divisor & 0xFF) as u8);
            ch0.write((divisor >> 8) as u8);
        }
        crate::sys::idt::set_irq_handler(crate::sys::pic::PIT_IRQ, on_tick);
    }
    crate::klog!("clk: pit programmed at {} Hz", TICKS_PER_SEC);
}

/// IRQ0. The PIC has already been acknowledged by the time this runs,
/// so the scheduler is free to switch stacks and not come back here.
#[cfg(target_os = "none")]
fn on_tick() {
    let ticks = TICK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks % SCHED_INTERVAL == 0 {
        crate::sys::sched::preempt();
    }
}

pub fn ticks() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Uptime in seconds, for log stamps
pub fn uptime_secs() -> f64 {
    ticks() as f64 / TICKS_PER_SEC as f64
}
