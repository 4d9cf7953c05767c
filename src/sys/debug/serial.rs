//! Serial — COM1 logging sink for the k*! macros
//!
//! Everything the kernel logs ends up here; the VGA terminals belong to
//! user programs.

use core::fmt::Write;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

const COM1: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

/// Write one tagged log line. Interrupts are held off so a timer tick
/// cannot deadlock against the port lock.
pub fn log_fmt(level: &str, args: core::fmt::Arguments) {
    interrupts::without_interrupts(|| {
        let uptime = crate::sys::clk::uptime_secs();
        let mut port = SERIAL1.lock();
        let _ = write!(port, "[{:10.3}] [{}] ", uptime, level);
        let _ = port.write_fmt(args);
        let _ = port.write_str("\n");
    });
}
