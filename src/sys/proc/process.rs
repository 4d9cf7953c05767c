//! process — the execute/halt lifecycle engine
//!
//! execute() runs a program from the catalog in the caller's terminal:
//! claim a slot, repoint the user window at its region, load the image,
//! then drop to ring 3. The caller's kernel continuation is saved in
//! its PCB; halt() resumes it with the child's exit status, after
//! restoring the caller's address space and privilege stack.
//!
//! The same continuation slot serves the scheduler: a process parked in
//! execute() is out of the run rotation until its child halts, so the
//! two users never overlap.

use super::pid::{self, ARG_CAPACITY, DIRECTORY};

#[cfg(target_os = "none")]
use super::pid::{Continuation, FdKind};
#[cfg(target_os = "none")]
use crate::sys::fs::{self, FileType};
#[cfg(target_os = "none")]
use alloc::string::String;
#[cfg(target_os = "none")]
use crate::sys::mem::paging;
#[cfg(target_os = "none")]
use crate::sys::{gdt, sched};
#[cfg(target_os = "none")]
use x86_64::instructions::interrupts;

/// Exit status reported for a process killed by an exception; user
/// programs can only produce 0..=255.
pub const EXCEPTION_STATUS: i32 = 256;

/// Command names invalid, absent or not executable
pub const EXEC_INVALID: i32 = -1;
/// No free slot, no free descriptor, or the image would not load
pub const EXEC_EXHAUSTED: i32 = 1;

/// Program every terminal is rooted at
pub const SHELL: &str = "shell";

// Exit statuses travel through the resume value biased by one, so a
// zero return from save_context always means "context just saved".

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

/// Split a command line into program name and argument string. Leading
/// blanks and the trailing newline are discarded; the argument string
/// keeps its internal spacing.
pub fn parse_command(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches('\n');
    let line = line.trim_start_matches([' ', '\t']);
    if line.is_empty() {
        return None;
    }
    let name_end = line.find([' ', '\t']).unwrap_or(line.len());
    let (name, rest) = line.split_at(name_end);
    Some((name, rest.trim_start_matches([' ', '\t'])))
}

/// Argument string clamped to PCB capacity, on a char boundary
fn clamp_args(args: &str) -> &str {
    let limit = ARG_CAPACITY.min(args.len());
    let cut = (0..=limit).rev().find(|&i| args.is_char_boundary(i)).unwrap_or(0);
    &args[..cut]
}

/// Status a parent observes: exceptions map to the out-of-band 256
pub fn exit_value(status: u64, exception: bool) -> i32 {
    if exception {
        EXCEPTION_STATUS
    } else {
        (status & 0xFF) as i32
    }
}

/// True iff `[addr, addr + len)` lies inside the user window
pub fn user_range_ok(addr: u64, len: u64) -> bool {
    use crate::sys::mem::paging::{BIG_PAGE_SIZE, USER_PAGE};
    let end = match addr.checked_add(len) {
        Some(end) => end,
        None => return false,
    };
    addr >= USER_PAGE && end <= USER_PAGE + BIG_PAGE_SIZE
}

/// Terminal owning the current process, or the displayed one before
/// the first process exists
pub fn current_terminal() -> usize {
    let slot = pid::current_slot();
    if slot < 0 {
        crate::sys::sched::displayed_terminal()
    } else {
        with_directory(|dir| dir.pcb(slot as usize).terminal)
    }
}

/// Directory access that cannot interleave with the scheduler, which
/// takes the same lock from interrupt context.
pub fn with_directory<T>(f: impl FnOnce(&mut super::pid::ProcessDirectory) -> T) -> T {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| f(&mut DIRECTORY.write()))
    }
    #[cfg(not(target_os = "none"))]
    {
        f(&mut DIRECTORY.write())
    }
}

// ---------------------------------------------------------------------------
// Context-switch primitives
// ---------------------------------------------------------------------------
//
// Continuation layout (repr C, see sys::pid):
//   rsp=0x00 rbp=0x08 rbx=0x10 r12=0x18 r13=0x20 r14=0x28 r15=0x30 rip=0x38

/// Capture the caller's continuation. Returns 0 on the capturing pass;
/// a later resume_context() makes it "return" again with that resume
/// value, on the original stack.
#[cfg(target_os = "none")]
#[unsafe(naked)]
unsafe extern "sysv64" fn save_context(ctx: *mut Continuation) -> u64 {
    core::arch::naked_asm!(
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rax, [rsp]", // return address
        "mov [rdi + 0x38], rax",
        "lea rax, [rsp + 8]", // caller's rsp once this call returns
        "mov [rdi + 0x00], rax",
        "xor eax, eax",
        "ret",
    );
}

/// Resume a saved continuation with `value` as the apparent return of
/// its save_context() call. Switches kernel stacks; never returns.
#[cfg(target_os = "none")]
#[unsafe(naked)]
unsafe extern "sysv64" fn resume_context(ctx: *const Continuation, value: u64) -> ! {
    core::arch::naked_asm!(
        "mov rax, rsi",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "mov rsp, [rdi + 0x00]",
        "jmp qword ptr [rdi + 0x38]",
    );
}

/// First drop to ring 3: build an iretq frame for the user segments
/// and clear every register the program could observe.
///
///   rdi = entry, rsi = user stack top, rdx = user CS, rcx = user SS
#[cfg(target_os = "none")]
#[unsafe(naked)]
unsafe extern "sysv64" fn enter_user(entry: u64, stack_top: u64, u_code: u64, u_data: u64) -> ! {
    core::arch::naked_asm!(
        "mov ax, cx",
        "mov ds, ax",
        "mov es, ax",
        // iretq frame
        "push rcx",   // SS
        "push rsi",   // RSP
        "push 0x202", // RFLAGS, IF set
        "push rdx",   // CS
        "push rdi",   // RIP
        "xor rax, rax",
        "xor rbx, rbx",
        "xor rcx, rcx",
        "xor rdx, rdx",
        "xor rsi, rsi",
        "xor rdi, rdi",
        "xor rbp, rbp",
        "xor r8,  r8",
        "xor r9,  r9",
        "xor r10, r10",
        "xor r11, r11",
        "xor r12, r12",
        "xor r13, r13",
        "xor r14, r14",
        "xor r15, r15",
        "iretq",
    );
}

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
const USER_STACK_TOP: u64 = paging::USER_PAGE + paging::BIG_PAGE_SIZE - 16;

/// Run `command` as a child of the current process. Returns the
/// child's exit status once it halts, EXEC_INVALID for a bad command,
/// EXEC_EXHAUSTED when the directory or descriptor table is full or
/// the image fails to load.
#[cfg(target_os = "none")]
pub fn execute(command: &str) -> i32 {
    let parent = pid::current_slot();
    let terminal = current_terminal();
    spawn(command, parent, terminal)
}

/// Start a terminal's root shell. Used for the first process of each
/// terminal and for respawning a shell that exits. Diverges into the
/// new shell on success; returns the spawn failure code otherwise so
/// the caller can retry when the rotation next lands on the terminal.
#[cfg(target_os = "none")]
pub fn spawn_root(terminal: usize) -> i32 {
    let code = spawn(SHELL, -1, terminal);
    crate::kwarn!("cannot start root shell on terminal {} ({})", terminal, code);
    code
}

#[cfg(target_os = "none")]
fn spawn(command: &str, parent: i32, terminal: usize) -> i32 {
    let (name, args) = match parse_command(command) {
        Some(parts) => parts,
        None => return EXEC_INVALID,
    };

    let dentry = match fs::with_catalog(|c| c.dentry_by_name(name)).flatten() {
        Some(d) if d.file_type == FileType::Regular => d,
        _ => return EXEC_INVALID,
    };
    let inode = dentry.inode;
    if !fs::with_catalog(|c| c.check_image(inode)).unwrap_or(false) {
        return EXEC_INVALID;
    }
    let entry = match fs::with_catalog(|c| c.entry_point(inode)).flatten() {
        Some(e) if e & 0xFFFF_F000 == paging::USER_IMAGE_START => e,
        _ => return EXEC_INVALID,
    };

    // Slot claim through the transfer runs with interrupts off so a
    // timer tick cannot interleave another claim or switch.
    interrupts::disable();

    let slot = match DIRECTORY.write().claim_slot() {
        Some(slot) => slot,
        None => {
            interrupts::enable();
            return EXEC_EXHAUSTED;
        }
    };

    // The running image stays open on a parent descriptor until halt
    let exec_fd = if parent >= 0 {
        match DIRECTORY.write().alloc_fd(parent as usize, FdKind::File { inode }) {
            Some(fd) => fd as i32,
            None => {
                DIRECTORY.write().release(slot);
                interrupts::enable();
                return EXEC_EXHAUSTED;
            }
        }
    } else {
        -1
    };

    paging::activate_user_region(slot);
    if !load_image(inode) {
        let mut dir = DIRECTORY.write();
        dir.release(slot);
        if parent >= 0 {
            dir.pcb_mut(parent as usize).fds[exec_fd as usize] = Default::default();
        }
        drop(dir);
        if parent >= 0 {
            paging::activate_user_region(parent as usize);
        }
        interrupts::enable();
        return EXEC_EXHAUSTED;
    }

    {
        let mut dir = DIRECTORY.write();
        dir.init(slot, parent, terminal);
        let pcb = dir.pcb_mut(slot);
        pcb.shell = name == SHELL && parent < 0;
        pcb.args = String::from(clamp_args(args));
        if parent >= 0 {
            dir.pcb_mut(parent as usize).executable_fd = exec_fd;
        }
    }

    if parent >= 0 {
        let ctx = {
            let mut dir = DIRECTORY.write();
            &mut dir.pcb_mut(parent as usize).ctx as *mut Continuation
        };
        // Zero on the capturing pass; the child's halt resumes here
        // with the biased exit status.
        let resumed = unsafe { save_context(ctx) };
        if resumed != 0 {
            return resumed as i32 - 1;
        }
    }

    sched::process_started(terminal, slot as i32, parent < 0);
    pid::set_current_slot(slot as i32);
    gdt::set_kernel_stack(pid::kernel_stack_top(slot));

    let (u_code, u_data) = {
        let sel = &gdt::GDT.1;
        (u64::from(sel.u_code.0), u64::from(sel.u_data.0))
    };
    unsafe { enter_user(entry, USER_STACK_TOP, u_code, u_data) }
}

/// Copy the whole program file to the conventional image address
/// inside the (already activated) user window.
#[cfg(target_os = "none")]
fn load_image(inode: usize) -> bool {
    let length = fs::with_catalog(|c| c.file_length(inode)).unwrap_or(0);
    let window = (paging::USER_PAGE + paging::BIG_PAGE_SIZE - paging::USER_IMAGE_START) as usize;
    if length == 0 || length > window {
        return false;
    }
    let dest =
        unsafe { core::slice::from_raw_parts_mut(paging::USER_IMAGE_START as *mut u8, length) };
    fs::with_catalog(|c| c.read_data(inode, 0, dest)) == Some(Some(length))
}

// ---------------------------------------------------------------------------
// halt
// ---------------------------------------------------------------------------

/// End the current process and hand `status` to its parent's parked
/// execute(). A terminal's root shell has no parent; it is respawned
/// instead so every terminal always runs something.
#[cfg(target_os = "none")]
pub fn halt(status: u64) -> ! {
    interrupts::disable();

    let slot = pid::current_slot();
    assert!(slot >= 0, "halt with no current process");
    let slot = slot as usize;

    let (parent, terminal, vidmap, exception) = {
        let dir = DIRECTORY.read();
        let pcb = dir.pcb(slot);
        (pcb.parent, pcb.terminal, pcb.vidmap, pcb.exception)
    };
    let exit = exit_value(status, exception);

    DIRECTORY.write().release(slot);

    // Tear the vidmap page down once its last holder is gone
    if vidmap && DIRECTORY.read().vidmap_holders() == 0 {
        paging::disable_vidmap();
    }

    if parent < 0 {
        crate::klog!("halt: root shell of terminal {} exited, respawning", terminal);
        pid::set_current_slot(-1);
        sched::process_ended(terminal, -1);
        spawn_root(terminal);
        // Respawn failed; idle until the scheduler retries the terminal.
        loop {
            interrupts::enable_and_hlt();
        }
    }

    let parent = parent as usize;
    let ctx = {
        let mut dir = DIRECTORY.write();
        let ppcb = dir.pcb_mut(parent);
        if ppcb.executable_fd >= 0 {
            ppcb.fds[ppcb.executable_fd as usize] = Default::default();
            ppcb.executable_fd = -1;
        }
        ppcb.ctx
    };

    sched::process_ended(terminal, parent as i32);
    pid::set_current_slot(parent as i32);
    paging::activate_user_region(parent);
    gdt::set_kernel_stack(pid::kernel_stack_top(parent));

    unsafe { resume_context(&ctx, exit as u64 + 1) }
}

/// Forced halt for a process killed by an exception
#[cfg(target_os = "none")]
pub fn exception_halt() -> ! {
    let slot = pid::current_slot();
    assert!(slot >= 0, "user exception with no current process");
    DIRECTORY.write().pcb_mut(slot as usize).exception = true;
    halt(0)
}

// ---------------------------------------------------------------------------
// Scheduler support
// ---------------------------------------------------------------------------

/// Park the current slot's continuation and run `next` instead. Comes
/// back (with a meaningless resume value) when the scheduler rotates
/// to this slot again.
#[cfg(target_os = "none")]
pub fn switch_to(current: usize, next: usize) {
    let (cur_ctx, next_ctx) = {
        let mut dir = DIRECTORY.write();
        let cur = &mut dir.pcb_mut(current).ctx as *mut Continuation;
        let next = &dir.pcb(next).ctx as *const Continuation;
        (cur, next)
    };

    pid::set_current_slot(next as i32);
    paging::activate_user_region(next);
    gdt::set_kernel_stack(pid::kernel_stack_top(next));

    unsafe {
        if save_context(cur_ctx) == 0 {
            resume_context(next_ctx, 1);
        }
    }
}

/// Park the current slot and start a terminal's first shell in its
/// place. On success the bootstrap never returns to this call; on
/// failure the interrupted process resumes and the empty terminal is
/// offered again on a later quantum.
#[cfg(target_os = "none")]
pub fn switch_to_new_root(current: i32, terminal: usize) {
    if current < 0 {
        spawn_root(terminal);
        // Failure path: the spawn may have re-enabled interrupts
        interrupts::disable();
        return;
    }
    let cur_ctx = {
        let mut dir = DIRECTORY.write();
        &mut dir.pcb_mut(current as usize).ctx as *mut Continuation
    };
    unsafe {
        if save_context(cur_ctx) == 0 {
            spawn_root(terminal);
            // Failure path: restore the interrupted slot's region and
            // let the timer frame resume it.
            interrupts::disable();
            paging::activate_user_region(current as usize);
        }
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::mem::paging::{BIG_PAGE_SIZE, USER_PAGE};

    #[test]
    fn command_parsing_splits_name_and_args() {
        assert_eq!(parse_command("cat frame0.txt\n"), Some(("cat", "frame0.txt")));
        assert_eq!(parse_command("   ls\n"), Some(("ls", "")));
        assert_eq!(parse_command("grep  a  b"), Some(("grep", "a  b")));
        assert_eq!(parse_command("\tcounter\t12\n"), Some(("counter", "12")));
        assert_eq!(parse_command("\n"), None);
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn argument_storage_is_bounded() {
        let long = "x".repeat(ARG_CAPACITY + 50);
        assert_eq!(clamp_args(&long).len(), ARG_CAPACITY);
        assert_eq!(clamp_args("short"), "short");
    }

    #[test]
    fn exception_status_is_out_of_band() {
        assert_eq!(exit_value(0, false), 0);
        assert_eq!(exit_value(42, false), 42);
        // user status is one byte
        assert_eq!(exit_value(0x1FF, false), 0xFF);
        assert_eq!(exit_value(0, true), EXCEPTION_STATUS);
        assert!(exit_value(0xFF, false) < EXCEPTION_STATUS);
    }

    #[test]
    fn user_range_check_matches_the_window() {
        assert!(user_range_ok(USER_PAGE, 16));
        assert!(user_range_ok(USER_PAGE + BIG_PAGE_SIZE - 8, 8));
        assert!(!user_range_ok(USER_PAGE - 1, 4));
        assert!(!user_range_ok(USER_PAGE + BIG_PAGE_SIZE - 4, 8));
        assert!(!user_range_ok(0, 4));
        assert!(!user_range_ok(u64::MAX - 2, 8));
    }
}
