//! syscall — the int 0x80 interface
//!
//! Register convention (all values 64-bit):
//!   rax = call number, rbx/rcx/rdx = arguments, rax = result
//!
//! Every pointer argument is range-checked against the user window
//! before the kernel touches it; a bad pointer costs the caller a -1,
//! never the kernel a fault.

pub mod number {
    pub const HALT: u64 = 1;
    pub const EXECUTE: u64 = 2;
    pub const READ: u64 = 3;
    pub const WRITE: u64 = 4;
    pub const OPEN: u64 = 5;
    pub const CLOSE: u64 = 6;
    pub const GETARGS: u64 = 7;
    pub const VIDMAP: u64 = 8;
    pub const SET_HANDLER: u64 = 9;
    pub const SIGRETURN: u64 = 10;
    pub const MALLOC: u64 = 11;
    pub const FREE: u64 = 12;
}

/// getargs: copy the stored argument string plus terminator. Empty
/// arguments and a too-small buffer both fail, so a program can trust
/// a 0 return to mean "buf holds the whole string".
pub fn getargs_copy(args: &str, buf: &mut [u8]) -> i64 {
    if args.is_empty() || args.len() + 1 > buf.len() {
        return -1;
    }
    buf[..args.len()].copy_from_slice(args.as_bytes());
    buf[args.len()] = 0;
    0
}

#[cfg(target_os = "none")]
pub use kernel::entry;

#[cfg(target_os = "none")]
mod kernel {
    use super::number;
    use crate::sys::fs::{self, FileType, FILE_NAME_LEN};
    use crate::sys::mem::buddy::BLOCK_ALLOCATOR;
    use crate::sys::mem::paging;
    use crate::sys::pid::{self, FdKind, FD_COUNT};
    use crate::sys::process::{self, with_directory};
    use crate::sys::{clk, terminal};
    use alloc::string::String;

    // -----------------------------------------------------------------------
    // Entry stub
    // -----------------------------------------------------------------------

    /// int 0x80 gate target. Saves the caller-visible registers, moves
    /// the call into the sysv64 dispatcher, and irets with the result
    /// in rax.
    #[unsafe(naked)]
    pub unsafe extern "sysv64" fn entry() {
        core::arch::naked_asm!(
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            // rax=num rbx=a1 rcx=a2 rdx=a3 -> rdi rsi rdx rcx
            "mov rdi, rax",
            "mov rsi, rbx",
            "mov r8, rdx",
            "mov rdx, rcx",
            "mov rcx, r8",
            "sub rsp, 8", // 16-byte call alignment
            "call {dispatch}",
            "add rsp, 8",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "iretq",
            dispatch = sym dispatch,
        );
    }

    extern "sysv64" fn dispatch(num: u64, a1: u64, a2: u64, a3: u64) -> i64 {
        // Gate entry cleared IF; syscalls run preemptible.
        x86_64::instructions::interrupts::enable();
        match num {
            number::HALT => process::halt(a1),
            number::EXECUTE => sys_execute(a1),
            number::READ => sys_read(a1, a2, a3),
            number::WRITE => sys_write(a1, a2, a3),
            number::OPEN => sys_open(a1),
            number::CLOSE => sys_close(a1),
            number::GETARGS => sys_getargs(a1, a2),
            number::VIDMAP => sys_vidmap(a1),
            number::MALLOC => sys_malloc(a1),
            number::FREE => sys_free(a1),
            // Signals are not implemented
            number::SET_HANDLER | number::SIGRETURN => -1,
            _ => -1,
        }
    }

    // -----------------------------------------------------------------------
    // User memory access
    // -----------------------------------------------------------------------

    fn user_slice<'a>(addr: u64, len: u64) -> Option<&'a [u8]> {
        if !process::user_range_ok(addr, len) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(addr as *const u8, len as usize) })
    }

    fn user_slice_mut<'a>(addr: u64, len: u64) -> Option<&'a mut [u8]> {
        if !process::user_range_ok(addr, len) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len as usize) })
    }

    /// NUL-terminated string from user memory; the terminator must
    /// land inside the user window.
    fn user_cstr(addr: u64) -> Option<String> {
        use paging::{BIG_PAGE_SIZE, USER_PAGE};
        if !process::user_range_ok(addr, 1) {
            return None;
        }
        let max = USER_PAGE + BIG_PAGE_SIZE - addr;
        let window = unsafe { core::slice::from_raw_parts(addr as *const u8, max as usize) };
        let len = window.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&window[..len]).ok().map(String::from)
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn sys_execute(cmd_ptr: u64) -> i64 {
        match user_cstr(cmd_ptr) {
            Some(cmd) => process::execute(&cmd) as i64,
            None => -1,
        }
    }

    fn sys_read(fd: u64, buf: u64, n: u64) -> i64 {
        let fd = fd as usize;
        let slot = pid::current_slot();
        if slot < 0 || fd >= FD_COUNT {
            return -1;
        }
        let slot = slot as usize;
        let (kind, terminal_no) = with_directory(|dir| {
            let pcb = dir.pcb(slot);
            (pcb.fds[fd].kind, pcb.terminal)
        });

        match kind {
            FdKind::TerminalIn => {
                let dest = match user_slice_mut(buf, n) {
                    Some(dest) => dest,
                    None => return -1,
                };
                terminal::read(terminal_no, dest) as i64
            }
            FdKind::RtcTimer => {
                clk::rtc::wait_tick(terminal_no);
                0
            }
            FdKind::File { inode } => {
                let dest = match user_slice_mut(buf, n) {
                    Some(dest) => dest,
                    None => return -1,
                };
                let pos = with_directory(|dir| dir.pcb(slot).fds[fd].pos);
                match fs::with_catalog(|c| c.read_data(inode, pos, dest)).flatten() {
                    Some(count) => {
                        with_directory(|dir| dir.pcb_mut(slot).fds[fd].pos += count);
                        count as i64
                    }
                    None => -1,
                }
            }
            FdKind::Directory => {
                let dest = match user_slice_mut(buf, n) {
                    Some(dest) => dest,
                    None => return -1,
                };
                let index = with_directory(|dir| dir.pcb(slot).fds[fd].pos);
                match fs::with_catalog(|c| c.dentry_by_index(index)).flatten() {
                    Some(dentry) => {
                        let name = dentry.name_str().as_bytes();
                        let count = name.len().min(dest.len()).min(FILE_NAME_LEN);
                        dest[..count].copy_from_slice(&name[..count]);
                        with_directory(|dir| dir.pcb_mut(slot).fds[fd].pos += 1);
                        count as i64
                    }
                    None => 0, // end of listing
                }
            }
            FdKind::TerminalOut | FdKind::Closed => -1,
        }
    }

    fn sys_write(fd: u64, buf: u64, n: u64) -> i64 {
        let fd = fd as usize;
        let slot = pid::current_slot();
        if slot < 0 || fd >= FD_COUNT {
            return -1;
        }
        let slot = slot as usize;
        let (kind, terminal_no) = with_directory(|dir| {
            let pcb = dir.pcb(slot);
            (pcb.fds[fd].kind, pcb.terminal)
        });

        match kind {
            FdKind::TerminalOut => {
                let src = match user_slice(buf, n) {
                    Some(src) => src,
                    None => return -1,
                };
                terminal::write(terminal_no, src) as i64
            }
            FdKind::RtcTimer => {
                // A frequency is a 4-byte write
                let src = match user_slice(buf, n) {
                    Some(src) if n == 4 => src,
                    _ => return -1,
                };
                let freq = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
                match clk::rtc::set_rate(terminal_no, freq) {
                    Ok(()) => 0,
                    Err(()) => -1,
                }
            }
            // The catalog is read-only
            _ => -1,
        }
    }

    fn sys_open(name_ptr: u64) -> i64 {
        let slot = pid::current_slot();
        if slot < 0 {
            return -1;
        }
        let slot = slot as usize;
        let name = match user_cstr(name_ptr) {
            Some(name) => name,
            None => return -1,
        };
        let dentry = match fs::with_catalog(|c| c.dentry_by_name(&name)).flatten() {
            Some(dentry) => dentry,
            None => return -1,
        };

        let kind = match dentry.file_type {
            FileType::RtcDevice => FdKind::RtcTimer,
            FileType::Directory => FdKind::Directory,
            FileType::Regular => FdKind::File { inode: dentry.inode },
        };
        let fd = match with_directory(|dir| dir.alloc_fd(slot, kind)) {
            Some(fd) => fd,
            None => return -1,
        };
        if kind == FdKind::RtcTimer {
            let terminal_no = with_directory(|dir| dir.pcb(slot).terminal);
            clk::rtc::open(terminal_no);
        }
        fd as i64
    }

    fn sys_close(fd: u64) -> i64 {
        let fd = fd as usize;
        let slot = pid::current_slot();
        // fds 0/1 belong to the terminal and cannot be closed
        if slot < 0 || fd < 2 || fd >= FD_COUNT {
            return -1;
        }
        let closed = with_directory(|dir| {
            let pcb = dir.pcb_mut(slot as usize);
            let entry = &mut pcb.fds[fd];
            if entry.in_use() {
                let kind = entry.kind;
                *entry = Default::default();
                Some((kind, pcb.terminal))
            } else {
                None
            }
        });
        match closed {
            Some((FdKind::RtcTimer, terminal_no)) => {
                clk::rtc::close(terminal_no);
                0
            }
            Some(_) => 0,
            None => -1,
        }
    }

    fn sys_getargs(buf: u64, n: u64) -> i64 {
        let slot = pid::current_slot();
        if slot < 0 {
            return -1;
        }
        let dest = match user_slice_mut(buf, n) {
            Some(dest) => dest,
            None => return -1,
        };
        with_directory(|dir| super::getargs_copy(&dir.pcb(slot as usize).args, dest))
    }

    fn sys_vidmap(target_ptr: u64) -> i64 {
        let slot = pid::current_slot();
        if slot < 0 || !process::user_range_ok(target_ptr, 8) {
            return -1;
        }
        let slot = slot as usize;
        let terminal_no = with_directory(|dir| {
            let pcb = dir.pcb_mut(slot);
            pcb.vidmap = true;
            pcb.terminal
        });
        paging::enable_vidmap(terminal_no);
        unsafe { (target_ptr as *mut u64).write(paging::VIDMAP_ADDR) };
        0
    }

    /// Failure is a null address, not -1: the result is an address.
    fn sys_malloc(size: u64) -> i64 {
        if size == 0 {
            return 0;
        }
        // Tree mutation and mapping must not interleave with a tick
        x86_64::instructions::interrupts::without_interrupts(|| {
            match BLOCK_ALLOCATOR.lock().allocate(size as usize) {
                Some(block) => {
                    paging::map_block(block.addr, block.size);
                    block.addr as i64
                }
                None => 0,
            }
        })
    }

    fn sys_free(addr: u64) -> i64 {
        x86_64::instructions::interrupts::without_interrupts(|| {
            match BLOCK_ALLOCATOR.lock().free(addr) {
                Some(size) => {
                    paging::unmap_block(addr, size);
                    0
                }
                None => -1,
            }
        })
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getargs_fills_buffer_with_terminator() {
        let mut buf = [0xAAu8; 16];
        assert_eq!(getargs_copy("frame0.txt", &mut buf), 0);
        assert_eq!(&buf[..10], b"frame0.txt");
        assert_eq!(buf[10], 0);
    }

    #[test]
    fn getargs_rejects_rather_than_truncates() {
        // Buffer one byte short of args + NUL
        let mut buf = [0u8; 10];
        assert_eq!(getargs_copy("frame0.txt", &mut buf), -1);
        // Exactly fits
        let mut buf = [0u8; 11];
        assert_eq!(getargs_copy("frame0.txt", &mut buf), 0);
    }

    #[test]
    fn getargs_with_no_args_fails() {
        let mut buf = [0u8; 8];
        assert_eq!(getargs_copy("", &mut buf), -1);
    }
}
