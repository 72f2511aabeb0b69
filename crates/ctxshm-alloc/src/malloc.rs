//! `MallocAllocator`: a null-backend shim over the process heap.
//!
//! Mirrors `_MallocAllocator`/`MallocAllocatorSingleton`: a null
//! `BackendId`/`AllocatorId` allocator whose "arena" is the whole
//! process address space, so its `ShmPtr` offsets are just raw
//! addresses. This lets private, non-shared buffers (lightbeam
//! scenario 6: a bulk the sender never exposes into a backend) be
//! represented with the same `ShmPtr`/`FullPtr` types as arena memory,
//! without a backend to allocate them from.
//!
//! Built on `std::alloc` rather than calling libc `malloc` directly,
//! since nothing else in this workspace takes a dependency on `libc`.

use std::alloc::{alloc, dealloc, realloc, Layout};
use std::sync::OnceLock;

use ctxshm_error::{Error, Result};
use ctxshm_ptr::{AllocatorId, ArenaView, OffsetPtr, ShmPtr};
use parking_lot::Mutex;

/// Header stored immediately before every allocation this type hands
/// out, so `free`/`reallocate` can recover the original `Layout`.
#[repr(C)]
struct MallocPage {
    size: usize,
}

const HEADER_SIZE: usize = std::mem::size_of::<MallocPage>();
const HEADER_ALIGN: usize = std::mem::align_of::<MallocPage>();

/// Sentinel allocator id for process-heap pointers. Deliberately
/// distinct from [`AllocatorId::null`] (all fields `u32::MAX`):
/// `ShmPtr::is_null` treats a null allocator id as "no pointer at all,"
/// which would make every malloc-backed `ShmPtr` report as null
/// regardless of its offset. Using backend `(0, 0)` with `sub_id ==
/// u32::MAX` keeps these pointers identifiable as "not backed by any
/// backend" without colliding with that check.
pub fn malloc_allocator_id() -> AllocatorId {
    AllocatorId::new(ctxshm_ptr::BackendId::new(0, 0), u32::MAX)
}

/// The process-heap-backed allocator. `ShmPtr` offsets it produces are
/// raw addresses: `arena_base()` is 0, so `offset == raw_ptr as u64`.
pub struct MallocAllocator {
    id: AllocatorId,
}

impl MallocAllocator {
    fn new() -> Self {
        Self { id: malloc_allocator_id() }
    }

    pub fn allocate(&self, size: usize) -> Result<ShmPtr> {
        let total = HEADER_SIZE + size.max(1);
        let layout = Layout::from_size_align(total, HEADER_ALIGN)
            .map_err(|e| Error::out_of_memory(size).with_operation("MallocAllocator::allocate").with_context("layout", e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        if raw.is_null() {
            return Err(Error::out_of_memory(size).with_operation("MallocAllocator::allocate"));
        }
        // SAFETY: raw is freshly allocated and large enough for MallocPage.
        unsafe {
            (raw as *mut MallocPage).write(MallocPage { size: total });
        }
        let user_ptr = unsafe { raw.add(HEADER_SIZE) };
        Ok(ShmPtr::new(self.id, OffsetPtr::new(user_ptr as u64)))
    }

    /// # Safety
    /// `ptr` must have come from [`Self::allocate`] or
    /// [`Self::reallocate`] on this same allocator and not already be
    /// freed.
    pub unsafe fn free(&self, ptr: ShmPtr) {
        if ptr.is_null() {
            return;
        }
        let user_ptr = ptr.offset.value() as *mut u8;
        let header_ptr = user_ptr.sub(HEADER_SIZE);
        let page = &*(header_ptr as *const MallocPage);
        let layout = Layout::from_size_align_unchecked(page.size, HEADER_ALIGN);
        dealloc(header_ptr, layout);
    }

    /// # Safety
    /// `ptr` must have come from [`Self::allocate`] or
    /// [`Self::reallocate`] on this same allocator and not already be
    /// freed.
    pub unsafe fn reallocate(&self, ptr: ShmPtr, new_size: usize) -> Result<ShmPtr> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        let user_ptr = ptr.offset.value() as *mut u8;
        let header_ptr = user_ptr.sub(HEADER_SIZE);
        let page = &*(header_ptr as *const MallocPage);
        let old_layout = Layout::from_size_align_unchecked(page.size, HEADER_ALIGN);
        let new_total = HEADER_SIZE + new_size.max(1);
        let new_raw = realloc(header_ptr, old_layout, new_total);
        if new_raw.is_null() {
            return Err(Error::out_of_memory(new_size).with_operation("MallocAllocator::reallocate"));
        }
        (new_raw as *mut MallocPage).write(MallocPage { size: new_total });
        let new_user_ptr = new_raw.add(HEADER_SIZE);
        Ok(ShmPtr::new(self.id, OffsetPtr::new(new_user_ptr as u64)))
    }
}

impl ArenaView for MallocAllocator {
    fn allocator_id(&self) -> AllocatorId {
        self.id
    }

    fn arena_base(&self) -> *mut u8 {
        std::ptr::null_mut()
    }

    fn data_range(&self) -> (*mut u8, *mut u8) {
        (std::ptr::null_mut(), usize::MAX as *mut u8)
    }

    fn resolve(&self, offset: OffsetPtr) -> *mut u8 {
        offset.value() as *mut u8
    }
}

static SINGLETON: OnceLock<Mutex<MallocAllocator>> = OnceLock::new();

/// The process-wide `MallocAllocator` instance, created lazily on
/// first use. Mirrors `MallocAllocatorSingleton::Get()`.
pub fn global() -> &'static Mutex<MallocAllocator> {
    SINGLETON.get_or_init(|| Mutex::new(MallocAllocator::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_round_trip() {
        let alloc = MallocAllocator::new();
        let ptr = alloc.allocate(128).unwrap();
        assert!(!ptr.is_null());
        unsafe {
            let raw = ptr.offset.value() as *mut u8;
            std::ptr::write_bytes(raw, 0xAB, 128);
            alloc.free(ptr);
        }
    }

    #[test]
    fn test_offset_equals_raw_address() {
        let alloc = MallocAllocator::new();
        let ptr = alloc.allocate(16).unwrap();
        assert_eq!(alloc.resolve(ptr.offset) as u64, ptr.offset.value());
        unsafe {
            alloc.free(ptr);
        }
    }

    #[test]
    fn test_global_singleton_allocates() {
        let guard = global().lock();
        let ptr = guard.allocate(8).unwrap();
        assert!(!ptr.is_null());
        unsafe {
            guard.free(ptr);
        }
    }
}
