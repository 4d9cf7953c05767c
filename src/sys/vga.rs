//! vga — text-mode output for the three terminals
//!
//! Each terminal owns a page-aligned backing buffer. Output from the
//! displayed terminal goes straight to the live frame buffer at
//! 0xB8000; the other terminals write into their backing pages, which
//! get swapped onto the screen on Alt+F1..F3.

use core::fmt;
use spin::Mutex;
use volatile::Volatile;

#[cfg(target_os = "none")]
use super::mem::paging;

pub const TERMINAL_COUNT: usize = 3;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

const ATTRIB: u8 = 0x07; // light gray on black

#[derive(Clone, Copy)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: u8,
}

const BLANK: ScreenChar = ScreenChar { ascii_character: b' ', color_code: ATTRIB };

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

// One 4KB page per terminal so the vidmap page can alias it directly.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct BackingPage {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

static mut BACKING: [BackingPage; TERMINAL_COUNT] =
    [BackingPage { chars: [[BLANK; BUFFER_WIDTH]; BUFFER_HEIGHT] }; TERMINAL_COUNT];

#[derive(Clone, Copy, Default)]
struct Cursor {
    row: usize,
    col: usize,
}

static CURSORS: Mutex<[Cursor; TERMINAL_COUNT]> = Mutex::new(
    [Cursor { row: 0, col: 0 }; TERMINAL_COUNT],
);

fn with_cursors<T>(f: impl FnOnce(&mut [Cursor; TERMINAL_COUNT]) -> T) -> T {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| f(&mut CURSORS.lock()))
    }
    #[cfg(not(target_os = "none"))]
    {
        f(&mut CURSORS.lock())
    }
}

pub fn init() {
    for terminal in 0..TERMINAL_COUNT {
        clear(terminal);
    }
}

// ---------------------------------------------------------------------------
// Buffer selection
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
fn buffer_for(terminal: usize) -> &'static mut Buffer {
    if terminal == super::sched::displayed_terminal() {
        unsafe { &mut *(live_buffer_ptr() as *mut Buffer) }
    } else {
        unsafe { &mut *backing_ptr(terminal).cast::<Buffer>() }
    }
}

#[cfg(not(target_os = "none"))]
fn buffer_for(terminal: usize) -> &'static mut Buffer {
    unsafe { &mut *backing_ptr(terminal).cast::<Buffer>() }
}

/// Live frame buffer, through the physical-memory window
#[cfg(target_os = "none")]
pub fn live_buffer_ptr() -> *mut u8 {
    use x86_64::PhysAddr;
    super::mem::phys_to_virt(PhysAddr::new(paging::VGA_TEXT_PHYS)).as_mut_ptr()
}

pub fn backing_ptr(terminal: usize) -> *mut u8 {
    unsafe { core::ptr::addr_of_mut!(BACKING[terminal]).cast() }
}

/// Physical address of a terminal's backing page, for the vidmap alias
#[cfg(target_os = "none")]
pub fn backing_phys(terminal: usize) -> x86_64::PhysAddr {
    use x86_64::structures::paging::Translate;
    use x86_64::VirtAddr;
    let virt = VirtAddr::from_ptr(backing_ptr(terminal));
    let mapper = unsafe { super::mem::mapper() };
    mapper.translate_addr(virt).expect("backing page is unmapped")
}

// ---------------------------------------------------------------------------
// Character output
// ---------------------------------------------------------------------------

fn put_byte(buffer: &mut Buffer, cursor: &mut Cursor, byte: u8) {
    match byte {
        b'\n' => new_line(buffer, cursor),
        0x08 => erase_last(buffer, cursor),
        b'\r' => cursor.col = 0,
        byte => {
            if cursor.col >= BUFFER_WIDTH {
                new_line(buffer, cursor);
            }
            buffer.chars[cursor.row][cursor.col].write(ScreenChar {
                ascii_character: byte,
                color_code: ATTRIB,
            });
            cursor.col += 1;
        }
    }
}

fn new_line(buffer: &mut Buffer, cursor: &mut Cursor) {
    cursor.col = 0;
    if cursor.row + 1 < BUFFER_HEIGHT {
        cursor.row += 1;
        return;
    }
    for row in 1..BUFFER_HEIGHT {
        for col in 0..BUFFER_WIDTH {
            let ch = buffer.chars[row][col].read();
            buffer.chars[row - 1][col].write(ch);
        }
    }
    for col in 0..BUFFER_WIDTH {
        buffer.chars[BUFFER_HEIGHT - 1][col].write(BLANK);
    }
}

fn erase_last(buffer: &mut Buffer, cursor: &mut Cursor) {
    if cursor.col == 0 {
        if cursor.row == 0 {
            return;
        }
        cursor.row -= 1;
        cursor.col = BUFFER_WIDTH - 1;
    } else {
        cursor.col -= 1;
    }
    buffer.chars[cursor.row][cursor.col].write(BLANK);
}

/// Write a string to `terminal`'s screen (live or backing)
pub fn write_to(terminal: usize, s: &str) {
    if terminal >= TERMINAL_COUNT {
        return;
    }
    with_cursors(|cursors| {
        let buffer = buffer_for(terminal);
        for byte in s.bytes() {
            put_byte(buffer, &mut cursors[terminal], byte);
        }
        update_hw_cursor(terminal, cursors[terminal]);
    });
}

/// Raw bytes to `terminal`; user writes are not required to be UTF-8
pub fn write_bytes_to(terminal: usize, bytes: &[u8]) {
    if terminal >= TERMINAL_COUNT {
        return;
    }
    with_cursors(|cursors| {
        let buffer = buffer_for(terminal);
        for &byte in bytes {
            put_byte(buffer, &mut cursors[terminal], byte);
        }
        update_hw_cursor(terminal, cursors[terminal]);
    });
}

/// Single byte to `terminal` (keyboard echo, backspace)
pub fn put_to(terminal: usize, byte: u8) {
    if terminal >= TERMINAL_COUNT {
        return;
    }
    with_cursors(|cursors| {
        let buffer = buffer_for(terminal);
        put_byte(buffer, &mut cursors[terminal], byte);
        update_hw_cursor(terminal, cursors[terminal]);
    });
}

pub fn clear(terminal: usize) {
    if terminal >= TERMINAL_COUNT {
        return;
    }
    with_cursors(|cursors| {
        let buffer = buffer_for(terminal);
        for row in 0..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                buffer.chars[row][col].write(BLANK);
            }
        }
        cursors[terminal] = Cursor { row: 0, col: 0 };
        update_hw_cursor(terminal, cursors[terminal]);
    });
}

/// Re-sync the hardware cursor after the displayed terminal changed
pub fn refresh_cursor(terminal: usize) {
    with_cursors(|cursors| update_hw_cursor(terminal, cursors[terminal]));
}

#[cfg(target_os = "none")]
fn update_hw_cursor(terminal: usize, cursor: Cursor) {
    use x86_64::instructions::port::Port;
    if terminal != super::sched::displayed_terminal() {
        return;
    }
    let pos = (cursor.row * BUFFER_WIDTH + cursor.col) as u16;
    let mut index: Port<u8> = Port::new(0x3D4);
    let mut data: Port<u8> = Port::new(0x3D5);
    unsafe {
        index.write(0x0F);
        data.write((pos & 0xFF) as u8);
        index.write(0x0E);
        data.write((pos >> 8) as u8);
    }
}

#[cfg(not(target_os = "none"))]
fn update_hw_cursor(_terminal: usize, _cursor: Cursor) {}

// ---------------------------------------------------------------------------
// fmt plumbing for print!/println!
// ---------------------------------------------------------------------------

struct TerminalWriter(usize);

impl fmt::Write for TerminalWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_to(self.0, s);
        Ok(())
    }
}

/// Kernel messages land on the displayed terminal
#[cfg(target_os = "none")]
pub fn print_fmt(args: fmt::Arguments) {
    print_fmt_to(super::sched::displayed_terminal(), args);
}

#[cfg(not(target_os = "none"))]
pub fn print_fmt(args: fmt::Arguments) {
    print_fmt_to(0, args);
}

pub fn print_fmt_to(terminal: usize, args: fmt::Arguments) {
    use fmt::Write;
    let _ = TerminalWriter(terminal).write_fmt(args);
}

// ---------------------------------------------------------------------------

// Screen state is global; tests here and in terminal share it.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    fn char_at(terminal: usize, row: usize, col: usize) -> u8 {
        unsafe { BACKING[terminal].chars[row][col].ascii_character }
    }

    #[test]
    fn writes_land_in_the_right_terminal() {
        let _guard = TEST_LOCK.lock();
        clear(1);
        clear(2);
        write_to(1, "abc");
        write_to(2, "xyz");
        assert_eq!(char_at(1, 0, 0), b'a');
        assert_eq!(char_at(1, 0, 2), b'c');
        assert_eq!(char_at(2, 0, 0), b'x');
        assert_eq!(char_at(1, 0, 3), b' ');
    }

    #[test]
    fn newline_and_wrap_advance_rows() {
        let _guard = TEST_LOCK.lock();
        clear(0);
        write_to(0, "one\ntwo");
        assert_eq!(char_at(0, 0, 0), b'o');
        assert_eq!(char_at(0, 1, 0), b't');

        clear(0);
        let long: alloc::string::String =
            core::iter::repeat('q').take(BUFFER_WIDTH + 1).collect();
        write_to(0, &long);
        assert_eq!(char_at(0, 0, BUFFER_WIDTH - 1), b'q');
        assert_eq!(char_at(0, 1, 0), b'q');
    }

    #[test]
    fn scrolling_keeps_the_last_rows() {
        let _guard = TEST_LOCK.lock();
        clear(2);
        for i in 0..BUFFER_HEIGHT + 2 {
            write_to(2, &alloc::format!("line{}\n", i));
        }
        // Three lines scrolled off the top; the last one written sits
        // one row above the cursor.
        assert_eq!(char_at(2, BUFFER_HEIGHT - 2, 4), b'2');
        assert_eq!(char_at(2, 0, 4), b'3');
    }

    #[test]
    fn formatted_output_targets_the_named_terminal() {
        let _guard = TEST_LOCK.lock();
        clear(0);
        clear(2);
        // Fault notices go to the owning terminal, not the displayed one.
        print_fmt_to(2, format_args!("exception: {}\n", "divide error"));
        assert_eq!(char_at(2, 0, 0), b'e');
        assert_eq!(char_at(2, 0, 11), b'd');
        assert_eq!(char_at(0, 0, 0), b' ');
    }

    #[test]
    fn backspace_erases_and_stops_at_origin() {
        let _guard = TEST_LOCK.lock();
        clear(1);
        write_to(1, "hi");
        put_to(1, 0x08);
        assert_eq!(char_at(1, 0, 1), b' ');
        assert_eq!(char_at(1, 0, 0), b'h');
        put_to(1, 0x08);
        put_to(1, 0x08); // at origin, must not underflow
        assert_eq!(char_at(1, 0, 0), b' ');
    }
}
