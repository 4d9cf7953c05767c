//! mem — physical memory access and the frame allocator
//!
//! The bootloader maps all physical memory at a fixed offset; everything
//! here goes through that window. Frames that belong to the fixed
//! process regions or the buddy-managed block regions are never handed
//! out for page tables.

pub mod buddy;
pub mod paging;

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use bootloader::BootInfo;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{
    FrameAllocator, OffsetPageTable, PageTable, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);
static FRAME_ALLOCATOR: Mutex<Option<BootInfoFrameAllocator>> = Mutex::new(None);

pub fn init(boot_info: &'static BootInfo) {
    PHYS_MEM_OFFSET.store(boot_info.physical_memory_offset, Ordering::SeqCst);
    *FRAME_ALLOCATOR.lock() = Some(BootInfoFrameAllocator::new(&boot_info.memory_map));
}

pub fn phys_mem_offset() -> u64 {
    PHYS_MEM_OFFSET.load(Ordering::SeqCst)
}

pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + phys_mem_offset())
}

pub fn with_frame_allocator<T>(f: impl FnOnce(&mut BootInfoFrameAllocator) -> T) -> T {
    let mut guard = FRAME_ALLOCATOR.lock();
    f(guard.as_mut().expect("frame allocator not initialized"))
}

/// Pointer to the active page table from CR3
pub unsafe fn active_page_table() -> &'static mut PageTable {
    let (frame, _) = Cr3::read();
    let virt = phys_to_virt(frame.start_address());
    &mut *virt.as_mut_ptr()
}

/// Mapper over the active page table
pub unsafe fn mapper() -> OffsetPageTable<'static> {
    OffsetPageTable::new(active_page_table(), VirtAddr::new(phys_mem_offset()))
}

// ---------------------------------------------------------------------------
// Frame allocator over the boot memory map
// ---------------------------------------------------------------------------

pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    fn new(memory_map: &'static MemoryMap) -> Self {
        Self { memory_map, next: 0 }
    }

    /// Usable frames, minus the windows the kernel hands out wholesale:
    /// the per-slot process regions and the buddy-managed block regions.
    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
            .map(|r| r.range.start_addr()..r.range.end_addr())
            .flat_map(|r| r.step_by(4096))
            .filter(|&addr| frame_available(addr))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

fn frame_available(addr: u64) -> bool {
    let in_process_window =
        addr >= paging::PROCESS_START && addr < paging::PROCESS_END;
    let in_block_window =
        addr >= paging::BLOCK_REGION_START && addr < paging::BLOCK_REGION_END;
    addr >= 0x10_0000 && !in_process_window && !in_block_window
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}
