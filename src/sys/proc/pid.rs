//! PID directory — the fixed arena of process control blocks
//!
//! One slot per process, addressed by index only. Each slot owns a
//! fixed 4MB physical user region (see sys::mem::paging) and a fixed
//! kernel stack; neither ever moves. The lifecycle engine is the only
//! writer that claims or releases slots; claim+init runs entirely
//! inside an interrupts-disabled section so a timer tick cannot slip a
//! conflicting claim in between.

use alloc::string::String;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicIsize, Ordering};
use lazy_static::lazy_static;
use spin::RwLock;
use x86_64::VirtAddr;

/// Process slots (pids)
pub const SLOT_COUNT: usize = 6;
/// File descriptors per process; 0/1 are the terminal
pub const FD_COUNT: usize = 8;
/// Kernel stack per slot
pub const KSTACK_SIZE: usize = 8192;
/// Longest stored command-line argument string
pub const ARG_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Saved continuation
// ---------------------------------------------------------------------------

/// Callee state captured at a suspension point: stack pointer, the
/// callee-saved registers, and the address execution resumes at. The
/// resume value (exit status for halt, ignored for scheduler switches)
/// travels in rax and is not stored here.
///
/// Field order is ABI: the context-switch primitives in sys::process
/// address these by byte offset.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Continuation {
    pub rsp: u64, // 0x00
    pub rbp: u64, // 0x08
    pub rbx: u64, // 0x10
    pub r12: u64, // 0x18
    pub r13: u64, // 0x20
    pub r14: u64, // 0x28
    pub r15: u64, // 0x30
    pub rip: u64, // 0x38
}

// ---------------------------------------------------------------------------
// File descriptors
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FdKind {
    #[default]
    Closed,
    TerminalIn,
    TerminalOut,
    RtcTimer,
    Directory,
    File {
        inode: usize,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Fd {
    pub kind: FdKind,
    /// Read position for files and the directory listing
    pub pos: usize,
}

impl Fd {
    pub fn in_use(&self) -> bool {
        self.kind != FdKind::Closed
    }
}

// ---------------------------------------------------------------------------
// PCB
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct Pcb {
    pub in_use: bool,
    /// Slot runs the shell program
    pub shell: bool,
    /// Slot holds the vidmap mapping
    pub vidmap: bool,
    /// An unhandled exception forced this slot's halt
    pub exception: bool,
    pub slot: usize,
    /// Parent slot, -1 for a terminal's root shell
    pub parent: i32,
    pub terminal: usize,
    pub ctx: Continuation,
    pub fds: [Fd; FD_COUNT],
    /// Fd (on this, the parent) holding the running child's image, -1 if none
    pub executable_fd: i32,
    pub args: String,
}

// ---------------------------------------------------------------------------
// The directory
// ---------------------------------------------------------------------------

pub struct ProcessDirectory {
    slots: [Pcb; SLOT_COUNT],
}

impl ProcessDirectory {
    pub fn new() -> Self {
        Self { slots: Default::default() }
    }

    /// Reserve the lowest-numbered free slot. The in-use bit is set
    /// right here so no second claim can observe the slot free before
    /// `init` runs; callers hold interrupts disabled across both.
    pub fn claim_slot(&mut self) -> Option<usize> {
        for (i, pcb) in self.slots.iter_mut().enumerate() {
            if !pcb.in_use {
                pcb.in_use = true;
                return Some(i);
            }
        }
        None
    }

    /// Reset a claimed slot and record its identity. Installs the
    /// reserved terminal descriptors at fd 0/1.
    pub fn init(&mut self, slot: usize, parent: i32, terminal: usize) {
        let pcb = &mut self.slots[slot];
        *pcb = Pcb {
            in_use: true,
            slot,
            parent,
            terminal,
            executable_fd: -1,
            ..Pcb::default()
        };
        pcb.fds[0].kind = FdKind::TerminalIn;
        pcb.fds[1].kind = FdKind::TerminalOut;
    }

    /// Release a slot on halt: zero it, clearing the fd occupancy with it.
    pub fn release(&mut self, slot: usize) {
        self.slots[slot] = Pcb::default();
    }

    pub fn pcb(&self, slot: usize) -> &Pcb {
        &self.slots[slot]
    }

    pub fn pcb_mut(&mut self, slot: usize) -> &mut Pcb {
        &mut self.slots[slot]
    }

    /// First free descriptor at or above 2, marked with `kind`.
    pub fn alloc_fd(&mut self, slot: usize, kind: FdKind) -> Option<usize> {
        let pcb = &mut self.slots[slot];
        for i in 2..FD_COUNT {
            if !pcb.fds[i].in_use() {
                pcb.fds[i] = Fd { kind, pos: 0 };
                return Some(i);
            }
        }
        None
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|p| !p.in_use).count()
    }

    /// Live processes still holding the vidmap page
    pub fn vidmap_holders(&self) -> usize {
        self.slots.iter().filter(|p| p.in_use && p.vidmap).count()
    }
}

lazy_static! {
    pub static ref DIRECTORY: RwLock<ProcessDirectory> =
        RwLock::new(ProcessDirectory::new());
}

// ---------------------------------------------------------------------------
// Current slot
// ---------------------------------------------------------------------------

/// -1 until the scheduler bootstraps the first shell
static CURRENT_SLOT: AtomicIsize = AtomicIsize::new(-1);

pub fn current_slot() -> i32 {
    CURRENT_SLOT.load(Ordering::SeqCst) as i32
}

pub fn set_current_slot(slot: i32) {
    CURRENT_SLOT.store(slot as isize, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Kernel stacks — fixed, disjoint, one per slot
// ---------------------------------------------------------------------------

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct KernelStack([u8; KSTACK_SIZE]);

// The CPU writes interrupt frames here on ring transitions, so the
// storage must land in a writable section, not .rodata.
static mut KERNEL_STACKS: [KernelStack; SLOT_COUNT] =
    [KernelStack([0; KSTACK_SIZE]); SLOT_COUNT];

/// Top of a slot's kernel stack, installed as the privilege-transition
/// stack whenever that slot becomes current.
pub fn kernel_stack_top(slot: usize) -> VirtAddr {
    let base = unsafe { addr_of_mut!(KERNEL_STACKS[slot]) } as u64;
    VirtAddr::new(base + KSTACK_SIZE as u64)
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::mem::paging;

    #[test]
    fn slot_user_regions_are_disjoint() {
        for s1 in 0..SLOT_COUNT {
            for s2 in 0..SLOT_COUNT {
                if s1 == s2 {
                    continue;
                }
                let (a, b) = (paging::region_base(s1), paging::region_base(s2));
                let disjoint =
                    a + paging::BIG_PAGE_SIZE <= b || b + paging::BIG_PAGE_SIZE <= a;
                assert!(disjoint, "regions for slots {} and {} overlap", s1, s2);
            }
        }
    }

    #[test]
    fn kernel_stacks_are_disjoint() {
        for s1 in 0..SLOT_COUNT {
            for s2 in 0..SLOT_COUNT {
                if s1 == s2 {
                    continue;
                }
                let a = kernel_stack_top(s1).as_u64();
                let b = kernel_stack_top(s2).as_u64();
                assert!(
                    a <= b - KSTACK_SIZE as u64 || b <= a - KSTACK_SIZE as u64,
                    "kernel stacks for slots {} and {} overlap",
                    s1,
                    s2
                );
            }
        }
    }

    #[test]
    fn kernel_stacks_are_writable() {
        // The CPU pushes interrupt frames onto these on ring transitions.
        let top = kernel_stack_top(0).as_u64() as *mut u64;
        unsafe {
            let frame_slot = top.sub(1);
            frame_slot.write_volatile(0xDEAD_BEEF_CAFE_F00D);
            assert_eq!(frame_slot.read_volatile(), 0xDEAD_BEEF_CAFE_F00D);
            frame_slot.write_volatile(0);
        }
    }

    #[test]
    fn claim_returns_lowest_free_slot() {
        let mut dir = ProcessDirectory::new();
        assert_eq!(dir.claim_slot(), Some(0));
        assert_eq!(dir.claim_slot(), Some(1));
        dir.release(0);
        assert_eq!(dir.claim_slot(), Some(0));
    }

    #[test]
    fn claim_fails_when_directory_is_full() {
        let mut dir = ProcessDirectory::new();
        for i in 0..SLOT_COUNT {
            assert_eq!(dir.claim_slot(), Some(i));
        }
        assert_eq!(dir.claim_slot(), None);
        dir.release(3);
        assert_eq!(dir.claim_slot(), Some(3));
    }

    #[test]
    fn init_installs_reserved_terminal_descriptors() {
        let mut dir = ProcessDirectory::new();
        let slot = dir.claim_slot().unwrap();
        dir.init(slot, -1, 2);
        let pcb = dir.pcb(slot);
        assert!(pcb.in_use);
        assert_eq!(pcb.parent, -1);
        assert_eq!(pcb.terminal, 2);
        assert_eq!(pcb.fds[0].kind, FdKind::TerminalIn);
        assert_eq!(pcb.fds[1].kind, FdKind::TerminalOut);
        assert!(!pcb.fds[2].in_use());
    }

    #[test]
    fn fd_allocation_skips_reserved_and_fills_up() {
        let mut dir = ProcessDirectory::new();
        let slot = dir.claim_slot().unwrap();
        dir.init(slot, -1, 0);
        for expect in 2..FD_COUNT {
            assert_eq!(dir.alloc_fd(slot, FdKind::Directory), Some(expect));
        }
        assert_eq!(dir.alloc_fd(slot, FdKind::Directory), None);
        dir.pcb_mut(slot).fds[4] = Fd::default();
        assert_eq!(dir.alloc_fd(slot, FdKind::RtcTimer), Some(4));
    }

    #[test]
    fn release_clears_fd_occupancy() {
        let mut dir = ProcessDirectory::new();
        let slot = dir.claim_slot().unwrap();
        dir.init(slot, 0, 1);
        dir.alloc_fd(slot, FdKind::File { inode: 7 }).unwrap();
        dir.release(slot);
        let pcb = dir.pcb(slot);
        assert!(!pcb.in_use);
        assert!(pcb.fds.iter().all(|fd| !fd.in_use()));
    }
}
