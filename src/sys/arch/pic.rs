//! PIC — Programmable Interrupt Controller (Intel 8259)
//!
//! Two chained PICs (master + slave) deliver the 16 hardware IRQs.
//! Triton uses IRQ 0 (PIT, scheduler tick), IRQ 1 (keyboard) and
//! IRQ 8 (RTC, virtualized timer).

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// IRQ offsets in the IDT (IRQ 0-7 → vectors 32-39, IRQ 8-15 → 40-47)
pub const PIC_MASTER_OFFSET: u8 = 32;
pub const PIC_SLAVE_OFFSET: u8 = PIC_MASTER_OFFSET + 8;

pub const PIT_IRQ: u8 = 0;
pub const KEYBOARD_IRQ: u8 = 1;
pub const RTC_IRQ: u8 = 8;

pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe {
    ChainedPics::new(PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET)
});

/// Initialize both PICs, unmask the lines Triton serves, and enable
/// interrupts. The first PIT tick after this hands the CPU to the
/// scheduler, so this must run last during boot.
pub fn init() {
    unsafe {
        PICS.lock().initialize();
    }
    enable_irq(PIT_IRQ);
    enable_irq(KEYBOARD_IRQ);
    enable_irq(RTC_IRQ);
    x86_64::instructions::interrupts::enable();
}

/// Clear the mask bit for one IRQ line. The slave cascade (IRQ 2) is
/// unmasked implicitly when a slave line is enabled.
pub fn enable_irq(irq: u8) {
    let (port_num, bit) = if irq < 8 {
        (0x21u16, irq)
    } else {
        (0xA1u16, irq - 8)
    };
    unsafe {
        let mut port: Port<u8> = Port::new(port_num);
        let mask = port.read() & !(1 << bit);
        port.write(mask);
        if irq >= 8 {
            let mut master: Port<u8> = Port::new(0x21);
            let mask = master.read() & !(1 << 2);
            master.write(mask);
        }
    }
}

pub fn irq_vector(irq: u8) -> u8 {
    PIC_MASTER_OFFSET + irq
}

/// Signal end-of-interrupt for the given IRQ line.
pub fn end_of_interrupt(irq: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(irq_vector(irq));
    }
}
