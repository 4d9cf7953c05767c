//! rtc — virtualized real-time clock
//!
//! The hardware RTC runs at a fixed 512 Hz master rate. Each terminal
//! sees its own virtual clock: a divisor derived from the requested
//! frequency, counted down on every master interrupt. Readers block on
//! their terminal's virtual tick rather than the hardware one, so one
//! terminal asking for 2 Hz never slows another asking for 512.

use spin::Mutex;

use crate::sys::vga::TERMINAL_COUNT;

/// Hardware interrupt rate (register A rate 7: 32768 >> 6)
pub const MASTER_HZ: u32 = 512;
/// Highest frequency a process may request
pub const MAX_USER_HZ: u32 = 1024;
/// Frequency installed by open()
const DEFAULT_HZ: u32 = 2;

#[derive(Clone, Copy)]
struct VirtualClock {
    divisor: u32,
    counter: u32,
    pending: u32,
    open: bool,
}

impl VirtualClock {
    const fn new() -> Self {
        Self { divisor: MASTER_HZ / DEFAULT_HZ, counter: 0, pending: 0, open: true }
    }

    const fn closed() -> Self {
        Self { divisor: MASTER_HZ / DEFAULT_HZ, counter: 0, pending: 0, open: false }
    }
}

static CLOCKS: Mutex<[VirtualClock; TERMINAL_COUNT]> =
    Mutex::new([VirtualClock::closed(); TERMINAL_COUNT]);

// The IRQ8 handler takes this lock; process-side accessors must not
// hold it with interrupts enabled.
fn with_clocks<T>(f: impl FnOnce(&mut [VirtualClock; TERMINAL_COUNT]) -> T) -> T {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| f(&mut CLOCKS.lock()))
    }
    #[cfg(not(target_os = "none"))]
    {
        f(&mut CLOCKS.lock())
    }
}

/// Divisor for a requested frequency. Requests above the master rate
/// saturate at one master period instead of wrapping to zero.
pub fn divisor_for(freq: u32) -> Option<u32> {
    if freq < 2 || freq > MAX_USER_HZ || !freq.is_power_of_two() {
        return None;
    }
    Some((MASTER_HZ / freq).max(1))
}

// ---------------------------------------------------------------------------
// Hardware side
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
pub fn hardware_init() {
    use x86_64::instructions::interrupts;
    use x86_64::instructions::port::Port;

    interrupts::without_interrupts(|| unsafe {
        let mut addr: Port<u8> = Port::new(0x70);
        let mut data: Port<u8> = Port::new(0x71);

        // Register A: master rate 7 -> 32768 >> 6 = 512 Hz
        addr.write(0x8A);
        let prev_a = data.read();
        addr.write(0x8A);
        data.write((prev_a & 0xF0) | 0x07);

        // Register B: periodic interrupt enable
        addr.write(0x8B);
        let prev_b = data.read();
        addr.write(0x8B);
        data.write(prev_b | 0x40);
    });

    crate::sys::idt::set_irq_handler(crate::sys::pic::RTC_IRQ, interrupt);
    crate::klog!("rtc: master rate {} Hz", MASTER_HZ);
}

#[cfg(not(target_os = "none"))]
pub fn hardware_init() {}

/// IRQ8: advance every terminal's virtual clock, then read register C
/// to re-arm the periodic interrupt.
#[cfg(target_os = "none")]
fn interrupt() {
    tick_all();
    use x86_64::instructions::port::Port;
    unsafe {
        let mut addr: Port<u8> = Port::new(0x70);
        let mut data: Port<u8> = Port::new(0x71);
        addr.write(0x8C);
        let _ = data.read();
    }
}

fn tick_all() {
    let mut clocks = CLOCKS.lock();
    for clock in clocks.iter_mut().filter(|c| c.open) {
        clock.counter += 1;
        if clock.counter >= clock.divisor {
            clock.counter = 0;
            clock.pending = clock.pending.saturating_add(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Device interface (per terminal)
// ---------------------------------------------------------------------------

/// open(): reset to the default 2 Hz rate
pub fn open(terminal: usize) {
    with_clocks(|clocks| clocks[terminal] = VirtualClock::new());
}

/// close(): stop the terminal's virtual clock entirely
pub fn close(terminal: usize) {
    with_clocks(|clocks| clocks[terminal] = VirtualClock::closed());
}

/// write(): install a new frequency. Zero, non-power-of-two and
/// out-of-range requests are rejected.
pub fn set_rate(terminal: usize, freq: u32) -> Result<(), ()> {
    let divisor = divisor_for(freq).ok_or(())?;
    with_clocks(|clocks| {
        clocks[terminal].divisor = divisor;
        clocks[terminal].counter = 0;
    });
    Ok(())
}

/// Consume one pending virtual tick if any have fired
pub fn try_wait(terminal: usize) -> bool {
    with_clocks(|clocks| {
        let clock = &mut clocks[terminal];
        if clock.pending > 0 {
            clock.pending -= 1;
            true
        } else {
            false
        }
    })
}

/// read(): block until the terminal's next virtual tick
#[cfg(target_os = "none")]
pub fn wait_tick(terminal: usize) {
    while !try_wait(terminal) {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // tick_all touches every terminal's clock; keep the tests serial.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn divisor_scales_inverse_to_frequency() {
        assert_eq!(divisor_for(2), Some(256));
        assert_eq!(divisor_for(512), Some(1));
        // Above the master rate the divisor saturates instead of
        // wrapping to zero.
        assert_eq!(divisor_for(1024), Some(1));
    }

    #[test]
    fn bad_rates_are_rejected() {
        assert_eq!(divisor_for(0), None);
        assert_eq!(divisor_for(1), None);
        assert_eq!(divisor_for(3), None);
        assert_eq!(divisor_for(600), None);
        assert_eq!(divisor_for(2048), None);
    }

    #[test]
    fn virtual_ticks_fire_at_the_configured_cadence() {
        let _guard = TEST_LOCK.lock();
        open(0);
        open(1);
        set_rate(0, 256).unwrap(); // divisor 2
        set_rate(1, 2).unwrap(); // divisor 256

        let mut fast = 0;
        let mut slow = 0;
        for _ in 0..512 {
            tick_all();
            if try_wait(0) {
                fast += 1;
            }
            if try_wait(1) {
                slow += 1;
            }
        }
        assert_eq!(fast, 256);
        assert_eq!(slow, 2);
    }

    #[test]
    fn closed_clocks_never_fire() {
        let _guard = TEST_LOCK.lock();
        open(0);
        set_rate(0, 512).unwrap();
        close(0);
        for _ in 0..16 {
            tick_all();
        }
        assert!(!try_wait(0));
    }

    #[test]
    fn unconsumed_ticks_accumulate() {
        let _guard = TEST_LOCK.lock();
        open(2);
        set_rate(2, 512).unwrap(); // divisor 1
        tick_all();
        tick_all();
        tick_all();
        // A slow reader gets every fire, one per read.
        assert!(try_wait(2));
        assert!(try_wait(2));
        assert!(try_wait(2));
        assert!(!try_wait(2));
    }

    #[test]
    fn reopening_discards_pending_ticks() {
        let _guard = TEST_LOCK.lock();
        open(2);
        set_rate(2, 512).unwrap();
        tick_all();
        open(2);
        assert!(!try_wait(2));
    }
}
