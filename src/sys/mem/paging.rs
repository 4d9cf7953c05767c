//! Paging — the address-space manager
//!
//! One fixed 4MB user window at virtual 128MB is repointed on every
//! process switch to the physical region owned by the destination slot
//! (`(2 + slot) * 4MB`). A single optional 4KB vidmap page gives a user
//! program direct access to the display, pointed either at the live
//! frame buffer or at a terminal's backing buffer. The kernel itself
//! lives in the bootloader-provided higher-half mappings and is never
//! touched here.

use crate::sys::{mem, pid};
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(target_os = "none")]
use crate::sys::vga;
use x86_64::structures::paging::{
    Mapper, Page, PageSize, PageTableFlags, PhysFrame, Size2MiB, Size4KiB,
};
use x86_64::{instructions::tlb, PhysAddr, VirtAddr};

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

pub const PAGE_SIZE: usize = 4096;
/// One process region / largest buddy block (4MB)
pub const BIG_PAGE_SIZE: u64 = 4 * 1024 * 1024;

/// Physical span of the fixed per-slot process regions (8MB — 32MB)
pub const PROCESS_START: u64 = 2 * BIG_PAGE_SIZE;
pub const PROCESS_END: u64 = (2 + pid::SLOT_COUNT as u64) * BIG_PAGE_SIZE;

/// User window: 4MB of virtual space at 128MB, image loaded at the
/// conventional offset inside it
pub const USER_PAGE: u64 = 0x0800_0000;
pub const USER_IMAGE_START: u64 = 0x0804_8000;

/// Virtual address handed to user programs by vidmap
pub const VIDMAP_ADDR: u64 = 0x0880_0000;

/// Physical span managed by the buddy allocator (160MB — 200MB)
pub const BLOCK_REGION_START: u64 = 40 * BIG_PAGE_SIZE;
pub const BLOCK_REGION_COUNT: usize = 10;
pub const BLOCK_REGION_END: u64 =
    BLOCK_REGION_START + BLOCK_REGION_COUNT as u64 * BIG_PAGE_SIZE;

/// VGA text frame buffer
pub const VGA_TEXT_PHYS: u64 = 0xB8000;

const USER_FLAGS: PageTableFlags = PageTableFlags::from_bits_truncate(
    PageTableFlags::PRESENT.bits()
        | PageTableFlags::WRITABLE.bits()
        | PageTableFlags::USER_ACCESSIBLE.bits(),
);

/// Physical base of the region reserved for a process slot
pub fn region_base(slot: usize) -> u64 {
    (2 + slot as u64) * BIG_PAGE_SIZE
}

// ---------------------------------------------------------------------------
// User window
// ---------------------------------------------------------------------------

/// Repoint the user window at `slot`'s physical region and flush the
/// TLB. Called exactly once per process-context transfer, with
/// interrupts disabled, before the destination context goes live.
pub fn activate_user_region(slot: usize) {
    let mut mapper = unsafe { mem::mapper() };
    let huge_pages = (BIG_PAGE_SIZE / Size2MiB::SIZE) as u64;

    for i in 0..huge_pages {
        let page: Page<Size2MiB> =
            Page::containing_address(VirtAddr::new(USER_PAGE + i * Size2MiB::SIZE));
        let frame: PhysFrame<Size2MiB> = PhysFrame::containing_address(PhysAddr::new(
            region_base(slot) + i * Size2MiB::SIZE,
        ));
        if let Ok((_, flush)) = mapper.unmap(page) {
            flush.ignore();
        }
        mem::with_frame_allocator(|fa| unsafe {
            mapper
                .map_to_with_table_flags(page, frame, USER_FLAGS, USER_FLAGS, fa)
                .expect("user window mapping failed")
                .ignore();
        });
    }
    tlb::flush_all();
}

// ---------------------------------------------------------------------------
// Vidmap
// ---------------------------------------------------------------------------

static VIDMAP_PRESENT: AtomicBool = AtomicBool::new(false);

pub fn vidmap_present() -> bool {
    VIDMAP_PRESENT.load(Ordering::SeqCst)
}

/// Map the vidmap page for `terminal`: the live frame buffer if that
/// terminal is displayed, else its private backing buffer.
#[cfg(target_os = "none")]
pub fn enable_vidmap(terminal: usize) {
    VIDMAP_PRESENT.store(true, Ordering::SeqCst);
    point_vidmap(terminal);
}

/// Repoint an already-present vidmap after the displayed or time-sliced
/// terminal changed. No-op while vidmap is absent.
#[cfg(target_os = "none")]
pub fn change_vidmap(terminal: usize) {
    if vidmap_present() {
        point_vidmap(terminal);
    }
}

/// Drop the vidmap page once no running process still needs it.
pub fn disable_vidmap() {
    VIDMAP_PRESENT.store(false, Ordering::SeqCst);
    let mut mapper = unsafe { mem::mapper() };
    let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(VIDMAP_ADDR));
    if let Ok((_, flush)) = mapper.unmap(page) {
        flush.ignore();
    }
    tlb::flush_all();
}

#[cfg(target_os = "none")]
fn point_vidmap(terminal: usize) {
    let target = if terminal == crate::sys::sched::displayed_terminal() {
        PhysAddr::new(VGA_TEXT_PHYS)
    } else {
        vga::backing_phys(terminal)
    };

    let mut mapper = unsafe { mem::mapper() };
    let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(VIDMAP_ADDR));
    if let Ok((_, flush)) = mapper.unmap(page) {
        flush.ignore();
    }
    mem::with_frame_allocator(|fa| unsafe {
        mapper
            .map_to_with_table_flags(
                page,
                PhysFrame::containing_address(target),
                USER_FLAGS,
                USER_FLAGS,
                fa,
            )
            .expect("vidmap mapping failed")
            .ignore();
    });
    tlb::flush_all();
}

// ---------------------------------------------------------------------------
// Backing-buffer copies (displayed terminal changes)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Terminal backing buffer → live frame buffer
    ToScreen,
    /// Live frame buffer → terminal backing buffer
    FromScreen,
}

/// Copy one 4KB text page between the live frame buffer and a
/// terminal's private backing buffer.
#[cfg(target_os = "none")]
pub fn copy_backing_buffer(terminal: usize, direction: CopyDirection) {
    let live = vga::live_buffer_ptr();
    let backing = vga::backing_ptr(terminal);
    unsafe {
        match direction {
            CopyDirection::ToScreen => {
                core::ptr::copy_nonoverlapping(backing as *const u8, live, PAGE_SIZE)
            }
            CopyDirection::FromScreen => {
                core::ptr::copy_nonoverlapping(live as *const u8, backing, PAGE_SIZE)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed mappings for buddy-allocated blocks (virtual == physical)
// ---------------------------------------------------------------------------

/// Map `size` bytes at `addr` (4KB granularity, virt == phys) with user
/// access. Used when a buddy block is handed to a process.
pub fn map_block(addr: u64, size: usize) {
    let mut mapper = unsafe { mem::mapper() };
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..pages as u64 {
        let at = addr + i * PAGE_SIZE as u64;
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(at));
        let frame = PhysFrame::containing_address(PhysAddr::new(at));
        mem::with_frame_allocator(|fa| unsafe {
            mapper
                .map_to_with_table_flags(page, frame, USER_FLAGS, USER_FLAGS, fa)
                .expect("block mapping failed")
                .ignore();
        });
    }
    tlb::flush_all();
}

/// Tear the mapping for a freed buddy block back down.
pub fn unmap_block(addr: u64, size: usize) {
    let mut mapper = unsafe { mem::mapper() };
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..pages as u64 {
        let page: Page<Size4KiB> =
            Page::containing_address(VirtAddr::new(addr + i * PAGE_SIZE as u64));
        if let Ok((_, flush)) = mapper.unmap(page) {
            flush.ignore();
        }
    }
    tlb::flush_all();
}
