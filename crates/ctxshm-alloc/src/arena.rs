//! Monotonic bump allocator.
//!
//! Used for objects that live as long as the arena itself (allocator
//! headers, top-level singletons): a `heap_begin`/`heap_current`/
//! `heap_end` triple that only ever moves forward. No `free`, no
//! reset; callers that need either should use [`crate::buddy`] instead.

use ctxshm_backend::{Backend, ShmAllocatorInit};
use ctxshm_error::{Error, Result};
use ctxshm_ptr::{AllocatorId, ArenaView, OffsetPtr};

const ALIGNMENT: u64 = 8;

/// A bump-pointer region within an arena: `[heap_begin, heap_end)`,
/// with `heap_current` marking the next free byte.
#[derive(Debug, Clone, Copy)]
pub struct ArenaAllocator {
    heap_begin: u64,
    heap_current: u64,
    heap_end: u64,
}

impl ArenaAllocator {
    /// Claim `[begin, begin + size)` for bump allocation.
    pub const fn new(begin: u64, size: u64) -> Self {
        Self {
            heap_begin: begin,
            heap_current: begin,
            heap_end: begin + size,
        }
    }

    pub fn allocated(&self) -> u64 {
        self.heap_current - self.heap_begin
    }

    pub fn remaining(&self) -> u64 {
        self.heap_end - self.heap_current
    }

    /// Bump-allocate `size` bytes, 8-byte aligned.
    ///
    /// # Errors
    /// Returns [`ctxshm_error::ErrorKind::OutOfMemory`] if the arena has
    /// no room left.
    pub fn allocate(&mut self, _view: &impl ArenaView, size: u64) -> Result<OffsetPtr> {
        let aligned_size = align_up(size.max(1), ALIGNMENT);
        let offset = align_up(self.heap_current, ALIGNMENT);
        let next = offset
            .checked_add(aligned_size)
            .ok_or_else(|| Error::out_of_memory(size as usize).with_operation("ArenaAllocator::allocate"))?;
        if next > self.heap_end {
            return Err(Error::out_of_memory(size as usize).with_operation("ArenaAllocator::allocate"));
        }
        self.heap_current = next;
        Ok(OffsetPtr::new(offset))
    }

    /// No-op. The bump allocator never reclaims; callers that need
    /// reclamation should use [`crate::buddy`] instead.
    pub fn free(&self, _ptr: OffsetPtr) {}
}

/// `args` is the number of bytes to reserve for the bump region; `0`
/// claims the backend's entire data arena.
///
/// `ArenaAllocator` keeps its cursor in process memory rather than
/// placed inside the arena bytes, so there is nothing for a second
/// process to recover; `shm_attach` always fails.
impl ShmAllocatorInit for ArenaAllocator {
    type InitArgs = u64;

    fn shm_init(backend: &mut Backend, _allocator_id: AllocatorId, reservation_size: Self::InitArgs) -> Result<Self> {
        let capacity = backend.data_capacity();
        let size = if reservation_size == 0 { capacity } else { reservation_size.min(capacity) };
        Ok(Self::new(0, size))
    }

    fn shm_attach(_backend: &mut Backend, _allocator_id: AllocatorId) -> Result<Self> {
        Err(Error::unsupported(
            "ArenaAllocator's bump cursor lives in process memory, not in the arena; it has no state for a second process to attach to",
        )
        .with_operation("ArenaAllocator::shm_attach"))
    }
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxshm_ptr::AllocatorId;

    struct FakeArena;
    impl ArenaView for FakeArena {
        fn allocator_id(&self) -> AllocatorId {
            AllocatorId::null()
        }
        fn arena_base(&self) -> *mut u8 {
            std::ptr::null_mut()
        }
        fn data_range(&self) -> (*mut u8, *mut u8) {
            (std::ptr::null_mut(), std::ptr::null_mut())
        }
    }

    #[test]
    fn test_sequential_allocations_never_overlap() {
        let arena = FakeArena;
        let mut bump = ArenaAllocator::new(0, 1024);
        let a = bump.allocate(&arena, 10).unwrap();
        let b = bump.allocate(&arena, 10).unwrap();
        assert!(b.value() >= a.value() + 10);
    }

    #[test]
    fn test_allocations_are_aligned() {
        let arena = FakeArena;
        let mut bump = ArenaAllocator::new(0, 1024);
        bump.allocate(&arena, 3).unwrap();
        let second = bump.allocate(&arena, 3).unwrap();
        assert_eq!(second.value() % ALIGNMENT, 0);
    }

    #[test]
    fn test_out_of_memory_when_exhausted() {
        let arena = FakeArena;
        let mut bump = ArenaAllocator::new(0, 16);
        assert!(bump.allocate(&arena, 8).is_ok());
        assert!(bump.allocate(&arena, 32).is_err());
    }

    #[test]
    fn test_free_does_not_reclaim() {
        let arena = FakeArena;
        let mut bump = ArenaAllocator::new(0, 16);
        let a = bump.allocate(&arena, 8).unwrap();
        bump.free(a);
        assert_eq!(bump.remaining(), 8);
    }

    #[test]
    #[serial_test::serial]
    fn test_shm_init_through_backend_and_attach_is_unsupported() {
        use ctxshm_backend::{attach_alloc, make_alloc, BackendArenaView};
        use ctxshm_ptr::BackendId;

        let name = format!("ctxshm-alloc-test-arena-{}", std::process::id());
        let backend_id = BackendId::new(9, 0);
        let mut backend = Backend::create(&name, backend_id, 1 << 16).expect("create");
        let allocator_id = AllocatorId::new(backend_id, 0);

        let mut arena = make_alloc::<ArenaAllocator>(&mut backend, allocator_id, 0).expect("shm_init");
        let view = BackendArenaView::new(&mut backend, allocator_id);
        let p = arena.allocate(&view, 64).unwrap();
        assert!(!p.is_null());

        assert!(attach_alloc::<ArenaAllocator>(&mut backend, allocator_id).is_err());
        backend.destroy();
    }
}
