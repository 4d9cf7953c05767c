//! sched — round-robin over the three terminals
//!
//! Every scheduling quantum the CPU moves to the next terminal's
//! running process, whether or not that terminal is on screen. A
//! terminal with no process yet gets its root shell started the first
//! time the rotation lands on it, so the boot sequence is just
//! "enable the timer".

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::sys::vga::TERMINAL_COUNT;

#[cfg(target_os = "none")]
use crate::sys::mem::paging;
#[cfg(target_os = "none")]
use crate::sys::process;

// ---------------------------------------------------------------------------
// Displayed terminal
// ---------------------------------------------------------------------------

static DISPLAYED: AtomicUsize = AtomicUsize::new(0);

pub fn displayed_terminal() -> usize {
    DISPLAYED.load(Ordering::SeqCst)
}

/// Alt+F1..F3: swap the live frame buffer against backing buffers and
/// repoint the vidmap page, which may alias either.
pub fn switch_displayed(terminal: usize) {
    if terminal >= TERMINAL_COUNT || terminal == displayed_terminal() {
        return;
    }
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::without_interrupts(|| {
        use paging::CopyDirection;
        let old = displayed_terminal();
        paging::copy_backing_buffer(old, CopyDirection::FromScreen);
        DISPLAYED.store(terminal, Ordering::SeqCst);
        paging::copy_backing_buffer(terminal, CopyDirection::ToScreen);
        crate::sys::vga::refresh_cursor(terminal);
        paging::change_vidmap(RUN.lock().active_term);
    });
    #[cfg(not(target_os = "none"))]
    DISPLAYED.store(terminal, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Which slot runs on each terminal. `active` is the leaf of the
/// terminal's execute chain (the only schedulable process in it);
/// `base` is its root shell.
struct RunState {
    active_term: usize,
    active: [i32; TERMINAL_COUNT],
    base: [i32; TERMINAL_COUNT],
}

struct Rotation {
    cur_slot: i32,
    next_term: usize,
    next_slot: i32,
}

impl RunState {
    const fn new() -> Self {
        // Start one before terminal 0 so the first quantum lands there
        Self {
            active_term: TERMINAL_COUNT - 1,
            active: [-1; TERMINAL_COUNT],
            base: [-1; TERMINAL_COUNT],
        }
    }

    fn started(&mut self, terminal: usize, slot: i32, is_root: bool) {
        self.active[terminal] = slot;
        if is_root {
            self.base[terminal] = slot;
        }
    }

    fn ended(&mut self, terminal: usize, parent: i32) {
        self.active[terminal] = parent;
        if parent < 0 {
            self.base[terminal] = -1;
        }
    }

    fn rotate(&mut self) -> Rotation {
        let cur_slot = self.active[self.active_term];
        let next_term = (self.active_term + 1) % TERMINAL_COUNT;
        self.active_term = next_term;
        Rotation { cur_slot, next_term, next_slot: self.active[next_term] }
    }
}

static RUN: Mutex<RunState> = Mutex::new(RunState::new());

/// Bookkeeping from execute(): `slot` is now the terminal's leaf
pub fn process_started(terminal: usize, slot: i32, is_root: bool) {
    RUN.lock().started(terminal, slot, is_root);
}

/// Bookkeeping from halt(): the parent (or nobody) is the leaf again
pub fn process_ended(terminal: usize, parent: i32) {
    RUN.lock().ended(terminal, parent);
}

// ---------------------------------------------------------------------------
// Preemption
// ---------------------------------------------------------------------------

/// Timer-driven rotation. Must run after the PIC is acknowledged: when
/// the destination terminal has no process yet, the root-shell
/// bootstrap never returns here on success; a failed bootstrap leaves
/// the terminal empty so the next pass tries again.
#[cfg(target_os = "none")]
pub fn preempt() {
    let rotation = RUN.lock().rotate();

    // The vidmap page follows whichever terminal owns the quantum
    paging::change_vidmap(rotation.next_term);

    if rotation.next_slot < 0 {
        process::switch_to_new_root(rotation.cur_slot, rotation.next_term);
    } else if rotation.cur_slot != rotation.next_slot {
        process::switch_to(rotation.cur_slot as usize, rotation.next_slot as usize);
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_terminal_is_reoffered_until_a_shell_starts() {
        let mut run = RunState::new();
        run.started(0, 5, true);
        // Terminals 1 and 2 stay empty when their bootstrap fails;
        // every pass must offer them again.
        for _ in 0..3 {
            assert_eq!(run.rotate().next_slot, 5);
            let r = run.rotate();
            assert_eq!((r.next_term, r.next_slot), (1, -1));
            let r = run.rotate();
            assert_eq!((r.next_term, r.next_slot), (2, -1));
        }
        run.started(1, 7, true);
        run.rotate();
        assert_eq!(run.rotate().next_slot, 7);
    }

    #[test]
    fn rotation_visits_every_terminal_in_order() {
        let mut run = RunState::new();
        for (term, slot) in [(0, 10), (1, 11), (2, 12)] {
            run.started(term, slot, true);
        }
        let order: alloc::vec::Vec<usize> =
            (0..6).map(|_| run.rotate().next_term).collect();
        assert_eq!(order, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn first_quantum_lands_on_terminal_zero() {
        let mut run = RunState::new();
        let rotation = run.rotate();
        assert_eq!(rotation.next_term, 0);
        assert_eq!(rotation.next_slot, -1); // root shell not started yet
        assert_eq!(rotation.cur_slot, -1); // nothing to park either
    }

    #[test]
    fn execute_chain_swaps_the_schedulable_leaf() {
        let mut run = RunState::new();
        run.started(1, 3, true); // root shell
        run.started(1, 4, false); // shell ran a child
        run.rotate();
        let rotation = run.rotate(); // lands on terminal 1
        assert_eq!(rotation.next_term, 1);
        assert_eq!(rotation.next_slot, 4);
        assert_eq!(run.base[1], 3);

        run.ended(1, 3); // child halted
        assert_eq!(run.active[1], 3);

        run.ended(1, -1); // root shell halted (pre-respawn)
        assert_eq!(run.base[1], -1);
    }

    #[test]
    fn displayed_switch_ignores_bad_terminals() {
        let before = displayed_terminal();
        switch_displayed(TERMINAL_COUNT);
        assert_eq!(displayed_terminal(), before);
    }
}
