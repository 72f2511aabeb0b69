//! `BuddyAllocator`: segregated free lists with on-demand coalescing.
//!
//! Small allocations (< 16 KiB) are rounded up to the next power of
//! two and served from one of ten round-up lists (32 B .. 16 KiB).
//! Large allocations are rounded down into one of six lists (16 KiB ..
//! 1 MiB) and served first-fit. Both paths fall back to coalescing
//! adjacent free pages, then to carving a fresh page off the
//! unallocated tail of the heap.
//!
//! Grounded on `buddy_allocator.h`'s list layout and allocate/split
//! algorithms; that header's own `Coalesce`/`MergeContiguousPages` are
//! left as stubs (`TODO: Implement tree traversal and merging`), so
//! the merge pass here is a fresh implementation using [`crate::rb_tree`].

use ctxshm_backend::{Backend, ShmAllocatorInit};
use ctxshm_error::{Error, Result};
use ctxshm_ptr::{AllocatorId, ArenaView, OffsetPtr};

use crate::rb_tree::RbTree;
use crate::slist::Slist;

const MIN_SIZE: u64 = 32;
const SMALL_THRESHOLD: u64 = 16 * 1024;
const MAX_SIZE: u64 = 1024 * 1024;

const MIN_LOG2: u32 = 5;
const SMALL_LOG2: u32 = 14;
const MAX_LOG2: u32 = 20;

const NUM_ROUND_UP: usize = (SMALL_LOG2 - MIN_LOG2 + 1) as usize; // 10
const NUM_ROUND_DOWN: usize = (MAX_LOG2 - SMALL_LOG2) as usize; // 6
const NUM_FREE_LISTS: usize = NUM_ROUND_UP + NUM_ROUND_DOWN; // 16

/// Free pages smaller than this cannot host a coalescing tree node and
/// sit out the merge pass (they stay in their free list, untouched).
const COALESCE_MIN_SIZE: u64 = 64;

/// Header stored at the start of every page, free or allocated.
#[repr(C)]
struct PageHeader {
    size: u64,
}

const PAGE_HEADER_SIZE: u64 = std::mem::size_of::<PageHeader>() as u64;

fn read_page_size(view: &impl ArenaView, offset: OffsetPtr) -> u64 {
    // SAFETY: every offset handled by this module points at a page
    // written by `finalize_allocation` or restored from a free list.
    unsafe { (*(view.resolve(offset) as *const PageHeader)).size }
}

fn write_page_size(view: &impl ArenaView, offset: OffsetPtr, size: u64) {
    // SAFETY: see `read_page_size`.
    unsafe {
        (*(view.resolve(offset) as *mut PageHeader)).size = size;
    }
}

/// Buddy-style segregated-free-list allocator over a heap carved out
/// of an arena.
pub struct BuddyAllocator {
    heap_begin: u64,
    heap_current: u64,
    heap_end: u64,
    round_up: [Slist; NUM_ROUND_UP],
    round_down: [Slist; NUM_ROUND_DOWN],
}

impl BuddyAllocator {
    /// Reserve `[begin, begin + heap_size)` for buddy-managed pages.
    pub fn new(begin: u64, heap_size: u64) -> Result<Self> {
        if heap_size < MIN_SIZE {
            return Err(Error::creation_failed("buddy heap too small to hold a minimum-size page")
                .with_operation("BuddyAllocator::new"));
        }
        Ok(Self {
            heap_begin: begin,
            heap_current: begin,
            heap_end: begin + heap_size,
            round_up: [Slist::new(); NUM_ROUND_UP],
            round_down: [Slist::new(); NUM_ROUND_DOWN],
        })
    }

    pub fn remaining_heap(&self) -> u64 {
        self.heap_end - self.heap_current
    }

    /// Allocate `size` user-visible bytes, returning an offset just
    /// past the page header.
    ///
    /// # Safety
    /// `view` must resolve offsets within the heap range this
    /// allocator was constructed over, and no other allocator may be
    /// concurrently mutating the same free lists.
    pub unsafe fn allocate(&mut self, view: &impl ArenaView, size: u64) -> Result<OffsetPtr> {
        let size = size.max(MIN_SIZE);
        if size < SMALL_THRESHOLD {
            unsafe { self.allocate_small(view, size) }
        } else {
            unsafe { self.allocate_large(view, size) }
        }
    }

    /// Free a page previously returned by [`Self::allocate`].
    ///
    /// # Safety
    /// `offset` must be a currently-allocated page from this allocator.
    pub unsafe fn free(&mut self, view: &impl ArenaView, offset: OffsetPtr) {
        if offset.is_null() {
            return;
        }
        let page_offset = offset.sub(PAGE_HEADER_SIZE);
        let size = read_page_size(view, page_offset);
        self.push_free(view, page_offset, size);
    }

    fn push_free(&mut self, view: &impl ArenaView, page_offset: OffsetPtr, size: u64) {
        let list_idx = free_list_index(size);
        // SAFETY: page_offset names a page at least `size` bytes, large
        // enough to hold a SlistNode (size >= MIN_SIZE >= 16 bytes).
        unsafe { self.list_mut(list_idx).emplace(view, page_offset) };
    }

    fn list_mut(&mut self, idx: usize) -> &mut Slist {
        if idx < NUM_ROUND_UP {
            &mut self.round_up[idx]
        } else {
            &mut self.round_down[idx - NUM_ROUND_UP]
        }
    }

    unsafe fn allocate_small(&mut self, view: &impl ArenaView, size: u64) -> Result<OffsetPtr> {
        let total_size = size + PAGE_HEADER_SIZE;
        let list_idx = round_up_index(total_size);
        let alloc_size = 1u64 << (list_idx as u32 + MIN_LOG2);

        // SAFETY: caller upholds `allocate`'s view/exclusivity contract.
        if let Some(offset) = unsafe { self.round_up[list_idx].pop(view) } {
            return Ok(self.finalize(view, offset, alloc_size));
        }

        for i in (list_idx + 1)..NUM_ROUND_UP {
            if let Some(offset) = unsafe { self.round_up[i].pop(view) } {
                return Ok(unsafe { self.split_round_up(view, offset, i, list_idx) });
            }
        }

        for i in 0..NUM_ROUND_DOWN {
            if let Some(offset) = unsafe { self.round_down[i].pop(view) } {
                let page_size = read_page_size(view, offset);
                if page_size >= alloc_size {
                    return Ok(unsafe { self.subset(view, offset, page_size, alloc_size) });
                }
                unsafe { self.round_down[i].emplace(view, offset) };
            }
        }

        self.coalesce(view, 0, list_idx);

        if let Some(offset) = unsafe { self.round_up[list_idx].pop(view) } {
            return Ok(self.finalize(view, offset, alloc_size));
        }

        unsafe { self.allocate_from_heap(view, alloc_size) }
    }

    unsafe fn allocate_large(&mut self, view: &impl ArenaView, size: u64) -> Result<OffsetPtr> {
        let total_size = size + PAGE_HEADER_SIZE;
        let list_idx = round_down_index(total_size);

        if let Some(offset) = self.round_down[list_idx].peek() {
            let page_size = read_page_size(view, offset);
            if page_size >= total_size {
                unsafe { self.round_down[list_idx].pop(view) };
                return Ok(unsafe { self.subset(view, offset, page_size, total_size) });
            }
        }

        for i in (list_idx + 1)..NUM_ROUND_DOWN {
            if let Some(offset) = unsafe { self.round_down[i].pop(view) } {
                let page_size = read_page_size(view, offset);
                return Ok(unsafe { self.subset(view, offset, page_size, total_size) });
            }
        }

        self.coalesce(view, NUM_ROUND_UP, NUM_ROUND_UP + list_idx);

        if let Some(offset) = unsafe { self.round_down[list_idx].pop(view) } {
            let page_size = read_page_size(view, offset);
            if page_size >= total_size {
                return Ok(unsafe { self.subset(view, offset, page_size, total_size) });
            }
            unsafe { self.round_down[list_idx].emplace(view, offset) };
        }

        unsafe { self.allocate_from_heap(view, total_size) }
    }

    unsafe fn split_round_up(&mut self, view: &impl ArenaView, page_offset: OffsetPtr, src_list: usize, dst_list: usize) -> OffsetPtr {
        let src_size = 1u64 << (src_list as u32 + MIN_LOG2);
        let dst_size = 1u64 << (dst_list as u32 + MIN_LOG2);

        let mut current_offset = page_offset;
        let mut current_size = src_size;
        while current_size > dst_size {
            current_size /= 2;
            let buddy_offset = current_offset.add(current_size);
            write_page_size(view, buddy_offset, current_size);
            self.push_free(view, buddy_offset, current_size);
        }

        self.finalize(view, page_offset, dst_size)
    }

    unsafe fn subset(&mut self, view: &impl ArenaView, page_offset: OffsetPtr, page_size: u64, alloc_size: u64) -> OffsetPtr {
        if page_size == alloc_size {
            return self.finalize(view, page_offset, alloc_size);
        }
        let remainder_offset = page_offset.add(alloc_size);
        let remainder_size = page_size - alloc_size;
        write_page_size(view, remainder_offset, remainder_size);
        self.push_free(view, remainder_offset, remainder_size);
        self.finalize(view, page_offset, alloc_size)
    }

    unsafe fn allocate_from_heap(&mut self, view: &impl ArenaView, size: u64) -> Result<OffsetPtr> {
        if self.heap_current + size > self.heap_end {
            return Err(Error::out_of_memory(size as usize).with_operation("BuddyAllocator::allocate"));
        }
        let offset = OffsetPtr::new(self.heap_current);
        self.heap_current += size;
        Ok(self.finalize(view, offset, size))
    }

    fn finalize(&self, view: &impl ArenaView, page_offset: OffsetPtr, page_size: u64) -> OffsetPtr {
        write_page_size(view, page_offset, page_size);
        page_offset.add(PAGE_HEADER_SIZE)
    }

    /// Drain free lists `[list_min, list_max]`, fuse adjacent extents
    /// through a temporary red-black tree keyed by offset, and push
    /// the merged spans back onto the appropriate free lists.
    ///
    /// Pages smaller than [`COALESCE_MIN_SIZE`] cannot host a tree node
    /// and are left untouched in their original list.
    fn coalesce(&mut self, view: &impl ArenaView, list_min: usize, list_max: usize) {
        let mut tree = RbTree::new();
        let mut pending_small: Vec<(OffsetPtr, u64)> = Vec::new();

        for i in list_min..=list_max.min(NUM_FREE_LISTS - 1) {
            let list = self.list_mut(i);
            loop {
                // SAFETY: offsets in a buddy allocator's own lists are
                // always live free pages.
                let offset = unsafe { list.pop(view) };
                let Some(offset) = offset else { break };
                let size = read_page_size(view, offset);
                if size < COALESCE_MIN_SIZE {
                    pending_small.push((offset, size));
                    continue;
                }
                // SAFETY: page is at least COALESCE_MIN_SIZE bytes,
                // large enough for the tree node header.
                unsafe { tree.emplace(view, offset, offset.value()) };
            }
        }

        for (offset, size) in pending_small {
            self.push_free(view, offset, size);
        }

        let spans = self.merge_contiguous(view, &tree);
        for (offset, size) in spans {
            self.push_free(view, offset, size);
        }
    }

    /// Walk the coalescing tree in order and fuse any run of pages
    /// where `prev.offset + prev.size == curr.offset`, capping any
    /// fused extent at [`MAX_SIZE`] (the remainder becomes its own
    /// free page in the top round-down list).
    fn merge_contiguous(&self, view: &impl ArenaView, tree: &RbTree) -> Vec<(OffsetPtr, u64)> {
        let offsets = tree.iter_inorder(view);
        let mut spans = Vec::new();
        let mut iter = offsets.into_iter().peekable();

        while let Some(offset) = iter.next() {
            let mut size = read_page_size(view, offset);
            let mut run_end = offset.value() + size;

            while let Some(&next_offset) = iter.peek() {
                if next_offset.value() != run_end {
                    break;
                }
                let next_size = read_page_size(view, next_offset);
                if size + next_size > MAX_SIZE {
                    break;
                }
                size += next_size;
                run_end += next_size;
                iter.next();
            }

            spans.push((offset, size));
        }

        spans
    }
}

/// `args` is ignored; a fresh `BuddyAllocator` always claims the whole
/// of `backend`'s data arena.
///
/// The free lists this allocator keeps are process-local (`round_up`/
/// `round_down` live in the Rust struct, not placed into arena bytes),
/// so there is nothing for a second process to attach to; use
/// [`crate::multiprocess::MultiProcessAllocator`] when multiple
/// processes need to share one pool.
impl ShmAllocatorInit for BuddyAllocator {
    type InitArgs = ();

    fn shm_init(backend: &mut Backend, _allocator_id: AllocatorId, _args: ()) -> Result<Self> {
        Self::new(0, backend.data_capacity())
    }

    fn shm_attach(_backend: &mut Backend, _allocator_id: AllocatorId) -> Result<Self> {
        Err(Error::unsupported(
            "BuddyAllocator's free lists live in process memory, not in the arena; it has no state for a second process to attach to",
        )
        .with_operation("BuddyAllocator::shm_attach"))
    }
}

fn round_up_index(size: u64) -> usize {
    if size <= MIN_SIZE {
        return 0;
    }
    let log2 = 64 - (size - 1).leading_zeros();
    if log2 < MIN_LOG2 {
        0
    } else if log2 > SMALL_LOG2 {
        NUM_ROUND_UP - 1
    } else {
        (log2 - MIN_LOG2) as usize
    }
}

fn round_down_index(size: u64) -> usize {
    let log2 = 63 - size.leading_zeros();
    if log2 <= SMALL_LOG2 {
        0
    } else if log2 > MAX_LOG2 {
        NUM_ROUND_DOWN - 1
    } else {
        (log2 - SMALL_LOG2 - 1) as usize
    }
}

fn free_list_index(size: u64) -> usize {
    if size < SMALL_THRESHOLD {
        round_up_index(size)
    } else {
        NUM_ROUND_UP + round_down_index(size)
    }
}
