//! Buddy — power-of-two block allocator over fixed 4MB regions
//!
//! Each managed region carries an implicit binary tree (array-indexed,
//! two bits per node): `UNAVAIL` means the block or a descendant is
//! committed, `SPLIT` means the block was subdivided for a smaller
//! request. Allocation is a depth-first first-fit over the regions in
//! fixed scan order; no best-fit and no cross-region coalescing.
//! Freeing clears the leaf and re-merges ancestors whose children both
//! became free again.

use super::paging::{BIG_PAGE_SIZE, BLOCK_REGION_COUNT, BLOCK_REGION_START, PAGE_SIZE};
use lazy_static::lazy_static;
use spin::Mutex;

/// log2(4MB / 4KB): orders run 0 (one page) through 10 (a whole region)
pub const MAX_ORDER: usize = 10;
/// Nodes in one region's tree: 2^0 + 2^1 + ... + 2^MAX_ORDER
pub const TREE_SIZE: usize = (1 << (MAX_ORDER + 1)) - 1;

const UNAVAIL: u8 = 0b01;
const SPLIT: u8 = 0b10;

const fn left(idx: usize) -> usize {
    2 * idx + 1
}

const fn right(idx: usize) -> usize {
    2 * idx + 2
}

/// Block size in bytes for a node of the given order
pub const fn block_bytes(order: usize) -> usize {
    PAGE_SIZE << order
}

/// Smallest order whose block covers `size`, or none above one region
fn order_for(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    (0..=MAX_ORDER).find(|&o| block_bytes(o) >= size)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub addr: u64,
    pub size: usize,
}

// ---------------------------------------------------------------------------
// One region's tree
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct RegionTree {
    nodes: [u8; TREE_SIZE],
}

impl RegionTree {
    const fn new() -> Self {
        Self { nodes: [0; TREE_SIZE] }
    }

    fn allocate(&mut self, target_order: usize) -> Option<u64> {
        self.allocate_at(0, MAX_ORDER, target_order, 0)
    }

    /// Depth-first search. A node is a candidate only if it is not
    /// `UNAVAIL` and not (`SPLIT` with the target depth reached).
    fn allocate_at(
        &mut self,
        idx: usize,
        order: usize,
        target_order: usize,
        offset: u64,
    ) -> Option<u64> {
        let node = self.nodes[idx];
        if node & UNAVAIL != 0 {
            return None;
        }
        if order == target_order {
            if node & SPLIT != 0 {
                return None;
            }
            self.nodes[idx] |= UNAVAIL;
            return Some(offset);
        }

        let half = block_bytes(order - 1) as u64;
        let found = self
            .allocate_at(left(idx), order - 1, target_order, offset)
            .or_else(|| self.allocate_at(right(idx), order - 1, target_order, offset + half));
        if found.is_some() {
            self.nodes[idx] |= SPLIT;
        }
        found
    }

    /// Free the block starting at `offset`. Walks the split path down to
    /// the committed node, clears it, then merges ancestors whose
    /// children are both free. Returns the freed block size, or none if
    /// `offset` does not name a live allocation.
    fn free(&mut self, offset: u64) -> Option<usize> {
        let mut idx = 0;
        let mut order = MAX_ORDER;
        let mut base = 0u64;
        let mut path = [0usize; MAX_ORDER];
        let mut depth = 0;

        loop {
            let node = self.nodes[idx];
            if node & SPLIT != 0 {
                if order == 0 {
                    return None;
                }
                path[depth] = idx;
                depth += 1;
                let half = block_bytes(order - 1) as u64;
                if offset < base + half {
                    idx = left(idx);
                } else {
                    base += half;
                    idx = right(idx);
                }
                order -= 1;
                continue;
            }

            if node & UNAVAIL == 0 || base != offset {
                return None;
            }
            self.nodes[idx] = 0;

            while depth > 0 {
                depth -= 1;
                let parent = path[depth];
                if self.nodes[left(parent)] == 0 && self.nodes[right(parent)] == 0 {
                    self.nodes[parent] &= !SPLIT;
                } else {
                    break;
                }
            }
            return Some(block_bytes(order));
        }
    }
}

// ---------------------------------------------------------------------------
// The allocator: a fixed set of regions scanned in order
// ---------------------------------------------------------------------------

pub struct BuddyAllocator {
    base: u64,
    regions: [RegionTree; BLOCK_REGION_COUNT],
}

impl BuddyAllocator {
    pub const fn new(base: u64) -> Self {
        Self {
            base,
            regions: [RegionTree::new(); BLOCK_REGION_COUNT],
        }
    }

    /// First region (in fixed scan order) with a free block of the
    /// rounded-up order wins. None is a hard allocation failure.
    pub fn allocate(&mut self, size: usize) -> Option<Allocation> {
        let target_order = order_for(size)?;
        for (i, region) in self.regions.iter_mut().enumerate() {
            if let Some(offset) = region.allocate(target_order) {
                return Some(Allocation {
                    addr: self.base + i as u64 * BIG_PAGE_SIZE + offset,
                    size: block_bytes(target_order),
                });
            }
        }
        None
    }

    /// Reverse of `allocate`: locate the owning region and node from the
    /// address alone. Returns the freed size so the caller can tear down
    /// mappings, or none for addresses that are not live allocations.
    pub fn free(&mut self, addr: u64) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let rel = addr - self.base;
        let region = (rel / BIG_PAGE_SIZE) as usize;
        if region >= BLOCK_REGION_COUNT {
            return None;
        }
        self.regions[region].free(rel % BIG_PAGE_SIZE)
    }
}

lazy_static! {
    /// The kernel-wide block allocator, mutated only inside
    /// interrupts-disabled critical sections (syscall malloc/free).
    pub static ref BLOCK_ALLOCATOR: Mutex<BuddyAllocator> =
        Mutex::new(BuddyAllocator::new(BLOCK_REGION_START));
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BASE: u64 = BLOCK_REGION_START;

    #[test]
    fn rounds_to_next_power_of_two_order() {
        assert_eq!(order_for(1), Some(0));
        assert_eq!(order_for(4096), Some(0));
        assert_eq!(order_for(4097), Some(1));
        assert_eq!(order_for(5000), Some(1));
        assert_eq!(order_for(BIG_PAGE_SIZE as usize), Some(MAX_ORDER));
        assert_eq!(order_for(BIG_PAGE_SIZE as usize + 1), None);
        assert_eq!(order_for(0), None);
    }

    #[test]
    fn live_allocations_never_overlap() {
        let mut buddy = BuddyAllocator::new(TEST_BASE);
        let sizes = [4096usize, 12288, 4096, 65536, 5000, 8192, 4096, 300000];
        let mut live: Vec<Allocation> = Vec::new();
        for &size in &sizes {
            let a = buddy.allocate(size).expect("allocation failed");
            assert!(a.size >= size);
            assert_eq!(a.addr % a.size as u64, 0, "block not size-aligned");
            for b in &live {
                let disjoint =
                    a.addr + a.size as u64 <= b.addr || b.addr + b.size as u64 <= a.addr;
                assert!(disjoint, "{:#x} overlaps {:#x}", a.addr, b.addr);
            }
            live.push(a);
        }
    }

    #[test]
    fn exhausting_all_regions_fails_cleanly() {
        let mut buddy = BuddyAllocator::new(TEST_BASE);
        for i in 0..BLOCK_REGION_COUNT {
            let a = buddy.allocate(BIG_PAGE_SIZE as usize).expect("region free");
            assert_eq!(a.addr, TEST_BASE + i as u64 * BIG_PAGE_SIZE);
        }
        assert!(buddy.allocate(BIG_PAGE_SIZE as usize).is_none());
        assert!(buddy.allocate(1).is_none());
    }

    #[test]
    fn free_merges_buddies_back_to_a_whole_region() {
        let mut buddy = BuddyAllocator::new(TEST_BASE);
        let a = buddy.allocate(4096).unwrap();
        let b = buddy.allocate(4096).unwrap();

        // Region 0 is split, so a full-region request must spill over.
        let big = buddy.allocate(BIG_PAGE_SIZE as usize).unwrap();
        assert_eq!(big.addr, TEST_BASE + BIG_PAGE_SIZE);

        assert_eq!(buddy.free(a.addr), Some(4096));
        assert_eq!(buddy.free(b.addr), Some(4096));

        // Fully merged again: region 0 can hand out one 4MB block.
        let whole = buddy.allocate(BIG_PAGE_SIZE as usize).unwrap();
        assert_eq!(whole.addr, TEST_BASE);
    }

    #[test]
    fn free_rejects_bogus_and_double_frees() {
        let mut buddy = BuddyAllocator::new(TEST_BASE);
        let a = buddy.allocate(8192).unwrap();
        assert_eq!(buddy.free(a.addr + 4096), None, "mid-block address");
        assert_eq!(buddy.free(TEST_BASE + BIG_PAGE_SIZE), None, "untouched region");
        assert_eq!(buddy.free(0), None, "below managed span");
        assert_eq!(buddy.free(a.addr), Some(8192));
        assert_eq!(buddy.free(a.addr), None, "double free");
    }

    #[test]
    fn freed_space_is_reused_in_scan_order() {
        let mut buddy = BuddyAllocator::new(TEST_BASE);
        let first = buddy.allocate(4096).unwrap();
        buddy.free(first.addr).unwrap();
        let again = buddy.allocate(4096).unwrap();
        assert_eq!(first.addr, again.addr);
    }
}
