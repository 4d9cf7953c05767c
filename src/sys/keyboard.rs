//! keyboard — PS/2 scancode decoding and terminal hotkeys
//!
//! Typed characters feed the displayed terminal's line buffer.
//! Alt+F1..F3 switches the displayed terminal, Ctrl+L clears it.

use core::sync::atomic::{AtomicBool, Ordering};
use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};
use spin::Mutex;

use super::{sched, terminal};

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(
        Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore)
    );
}

static ALT_DOWN: AtomicBool = AtomicBool::new(false);
static CTRL_DOWN: AtomicBool = AtomicBool::new(false);

pub fn init() {
    ALT_DOWN.store(false, Ordering::SeqCst);
    CTRL_DOWN.store(false, Ordering::SeqCst);
    #[cfg(target_os = "none")]
    crate::sys::idt::set_irq_handler(crate::sys::pic::KEYBOARD_IRQ, irq_entry);
    crate::klog!("keyboard: ps/2 decoder ready");
}

/// IRQ1 stub: pull the scancode from the controller
#[cfg(target_os = "none")]
fn irq_entry() {
    use x86_64::instructions::port::Port;
    let scancode = unsafe { Port::<u8>::new(0x60).read() };
    interrupt(scancode);
}

/// IRQ1 entry, one raw byte from port 0x60
pub fn interrupt(scancode: u8) {
    let mut keyboard = KEYBOARD.lock();
    let event = match keyboard.add_byte(scancode) {
        Ok(Some(event)) => event,
        _ => return,
    };

    let pressed = event.state == KeyState::Down;
    match event.code {
        KeyCode::LAlt | KeyCode::RAltGr => {
            ALT_DOWN.store(pressed, Ordering::SeqCst);
            return;
        }
        KeyCode::LControl | KeyCode::RControl => {
            CTRL_DOWN.store(pressed, Ordering::SeqCst);
            return;
        }
        _ => {}
    }

    if let Some(key) = keyboard.process_keyevent(event) {
        drop(keyboard);
        handle_key(key);
    }
}

fn handle_key(key: DecodedKey) {
    let displayed = sched::displayed_terminal();
    let alt = ALT_DOWN.load(Ordering::SeqCst);
    let ctrl = CTRL_DOWN.load(Ordering::SeqCst);

    match key {
        DecodedKey::RawKey(KeyCode::F1) if alt => sched::switch_displayed(0),
        DecodedKey::RawKey(KeyCode::F2) if alt => sched::switch_displayed(1),
        DecodedKey::RawKey(KeyCode::F3) if alt => sched::switch_displayed(2),
        DecodedKey::Unicode(c) if ctrl && (c == 'l' || c == 'L') => {
            terminal::key_clear(displayed);
        }
        DecodedKey::Unicode('\n') => terminal::key_commit(displayed),
        DecodedKey::Unicode('\u{8}') => terminal::key_backspace(displayed),
        DecodedKey::Unicode(c) if c == '\t' || (' '..='~').contains(&c) => {
            terminal::key_input(displayed, c as u8);
        }
        _ => {}
    }
}
