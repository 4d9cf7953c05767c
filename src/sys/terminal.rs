//! terminal — per-terminal line discipline
//!
//! The keyboard handler fills one line buffer per terminal (always the
//! displayed one); a process reading from stdin blocks until its own
//! terminal's buffer holds a committed line. Writes go straight to the
//! owning terminal's screen.

use spin::Mutex;

use super::vga;

pub const LINE_CAPACITY: usize = 128;

#[derive(Clone, Copy)]
struct LineBuffer {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
    committed: bool,
}

impl LineBuffer {
    const fn new() -> Self {
        Self { bytes: [0; LINE_CAPACITY], len: 0, committed: false }
    }
}

static LINES: Mutex<[LineBuffer; vga::TERMINAL_COUNT]> =
    Mutex::new([LineBuffer::new(); vga::TERMINAL_COUNT]);

// The keyboard handler takes this lock from interrupt context, so the
// process side must not hold it with interrupts enabled.
fn with_lines<T>(f: impl FnOnce(&mut [LineBuffer; vga::TERMINAL_COUNT]) -> T) -> T {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| f(&mut LINES.lock()))
    }
    #[cfg(not(target_os = "none"))]
    {
        f(&mut LINES.lock())
    }
}

// ---------------------------------------------------------------------------
// Keyboard side (interrupt context, always the displayed terminal)
// ---------------------------------------------------------------------------

/// Append a typed character and echo it. The last buffer byte is
/// reserved for the newline, so input past 127 characters is dropped.
pub fn key_input(terminal: usize, byte: u8) {
    let mut lines = LINES.lock();
    let line = &mut lines[terminal];
    if line.committed || line.len >= LINE_CAPACITY - 1 {
        return;
    }
    line.bytes[line.len] = byte;
    line.len += 1;
    drop(lines);
    vga::put_to(terminal, byte);
}

pub fn key_backspace(terminal: usize) {
    let mut lines = LINES.lock();
    let line = &mut lines[terminal];
    if line.committed || line.len == 0 {
        return;
    }
    line.len -= 1;
    drop(lines);
    vga::put_to(terminal, 0x08);
}

/// Enter: terminate the line and wake any reader
pub fn key_commit(terminal: usize) {
    let mut lines = LINES.lock();
    let line = &mut lines[terminal];
    if line.committed {
        return;
    }
    line.bytes[line.len] = b'\n';
    line.len += 1;
    line.committed = true;
    drop(lines);
    vga::put_to(terminal, b'\n');
}

/// Ctrl+L: wipe the screen, keep any half-typed line
pub fn key_clear(terminal: usize) {
    vga::clear(terminal);
    let lines = LINES.lock();
    let line = &lines[terminal];
    let (len, committed) = (line.len, line.committed);
    let pending: [u8; LINE_CAPACITY] = line.bytes;
    drop(lines);
    if !committed && len > 0 {
        vga::write_bytes_to(terminal, &pending[..len]);
    }
}

// ---------------------------------------------------------------------------
// Process side
// ---------------------------------------------------------------------------

/// Take a committed line if one is waiting. Copies at most
/// `buf.len()` bytes (newline included when it fits) and resets the
/// buffer for the next line.
pub fn try_take_line(terminal: usize, buf: &mut [u8]) -> Option<usize> {
    with_lines(|lines| {
        let line = &mut lines[terminal];
        if !line.committed {
            return None;
        }
        let n = line.len.min(buf.len());
        buf[..n].copy_from_slice(&line.bytes[..n]);
        line.len = 0;
        line.committed = false;
        Some(n)
    })
}

/// Blocking read: spin with interrupts enabled until the keyboard
/// commits a line for this terminal.
#[cfg(target_os = "none")]
pub fn read(terminal: usize, buf: &mut [u8]) -> usize {
    loop {
        if let Some(n) = try_take_line(terminal, buf) {
            return n;
        }
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

pub fn write(terminal: usize, bytes: &[u8]) -> isize {
    vga::write_bytes_to(terminal, bytes);
    bytes.len() as isize
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reset(terminal: usize) {
        LINES.lock()[terminal] = LineBuffer::new();
    }

    #[test]
    fn line_is_delivered_once_committed() {
        let _guard = vga::TEST_LOCK.lock();
        reset(0);
        for b in b"cat frame0.txt" {
            key_input(0, *b);
        }
        let mut buf = [0u8; 64];
        assert_eq!(try_take_line(0, &mut buf), None);

        key_commit(0);
        let n = try_take_line(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"cat frame0.txt\n");

        // Buffer resets for the next line
        assert_eq!(try_take_line(0, &mut buf), None);
    }

    #[test]
    fn backspace_edits_the_pending_line() {
        let _guard = vga::TEST_LOCK.lock();
        reset(1);
        for b in b"lsx" {
            key_input(1, *b);
        }
        key_backspace(1);
        key_commit(1);
        let mut buf = [0u8; 8];
        let n = try_take_line(1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls\n");
    }

    #[test]
    fn input_past_capacity_is_dropped() {
        let _guard = vga::TEST_LOCK.lock();
        reset(2);
        for _ in 0..LINE_CAPACITY + 40 {
            key_input(2, b'a');
        }
        key_commit(2);
        let mut buf = [0u8; LINE_CAPACITY + 40];
        let n = try_take_line(2, &mut buf).unwrap();
        assert_eq!(n, LINE_CAPACITY);
        assert_eq!(buf[LINE_CAPACITY - 1], b'\n');
        assert_eq!(buf[LINE_CAPACITY - 2], b'a');
    }

    #[test]
    fn short_reader_buffer_truncates() {
        let _guard = vga::TEST_LOCK.lock();
        reset(0);
        for b in b"hello" {
            key_input(0, *b);
        }
        key_commit(0);
        let mut buf = [0u8; 3];
        assert_eq!(try_take_line(0, &mut buf), Some(3));
        assert_eq!(&buf, b"hel");
    }
}
