//! `FullPtr<T>`: a process-local cache of `(raw_ptr, shm_ptr)`.

use std::fmt;
use std::marker::PhantomData;

use ctxshm_error::{Error, Result};

use crate::id::AllocatorId;
use crate::offset::OffsetPtr;
use crate::shm::ShmPtr;

/// Anything that can resolve a [`ShmPtr`]'s offset half to a raw address
/// and report the data-arena range it owns. Implemented by the allocator
/// types in `ctxshm-alloc`; kept as a trait here so `ctxshm-ptr` stays
/// free of a dependency on the allocator/backend crates.
pub trait ArenaView {
    /// This view's allocator id, stamped onto any `ShmPtr` it resolves.
    fn allocator_id(&self) -> AllocatorId;

    /// Base address corresponding to offset 0.
    fn arena_base(&self) -> *mut u8;

    /// `[start, end)` of the addressable data range, in raw addresses.
    fn data_range(&self) -> (*mut u8, *mut u8);

    /// Resolve an offset to a raw address within this view.
    fn resolve(&self, offset: OffsetPtr) -> *mut u8 {
        // SAFETY: caller-visible only through FullPtr, which validates
        // the resulting pointer lies in `data_range()` before use.
        unsafe { self.arena_base().add(offset.value() as usize) }
    }
}

/// A process-local cached pair `(raw_ptr, shm_ptr)`. Valid only within the
/// process that constructed it; never send the `raw_ptr` half across a
/// wire, only the `shm_ptr` half (see `ctxshm-lightbeam`).
pub struct FullPtr<T> {
    raw_ptr: *mut T,
    shm_ptr: ShmPtr,
    _marker: PhantomData<T>,
}

impl<T> FullPtr<T> {
    /// Build from a raw pointer plus the view it should belong to.
    /// Verifies `raw_ptr` lies within the view's data range.
    ///
    /// # Errors
    /// Returns [`ctxshm_error::ErrorKind::InvalidFree`] if `raw_ptr` does
    /// not lie in `view.data_range()` — used to reject pointers that did
    /// not originate from this arena.
    pub fn from_raw(raw_ptr: *mut T, view: &impl ArenaView) -> Result<Self> {
        let (start, end) = view.data_range();
        let addr = raw_ptr as *mut u8;
        if addr < start || addr >= end {
            return Err(Error::invalid_free(
                "pointer does not lie within the arena's data range",
            )
            .with_operation("FullPtr::from_raw")
            .with_context("ptr", format!("{:p}", raw_ptr)));
        }
        // SAFETY: addr is within [arena_base, arena_base + capacity), so
        // the subtraction cannot underflow and fits in the arena's offset
        // space.
        let offset = (addr as usize) - (view.arena_base() as usize);
        let shm_ptr = ShmPtr::new(view.allocator_id(), OffsetPtr::new(offset as u64));
        Ok(Self {
            raw_ptr,
            shm_ptr,
            _marker: PhantomData,
        })
    }

    /// Build from an allocator-relative offset: `raw_ptr = arena_base + offset`.
    pub fn from_offset(offset: OffsetPtr, view: &impl ArenaView) -> Self {
        let raw_ptr = view.resolve(offset) as *mut T;
        Self {
            raw_ptr,
            shm_ptr: ShmPtr::new(view.allocator_id(), offset),
            _marker: PhantomData,
        }
    }

    /// Build from a `ShmPtr`. The allocator id on `shm_ptr` is assumed
    /// consistent with `view`; only the offset half is used to resolve
    /// the raw pointer.
    pub fn from_shm_ptr(shm_ptr: ShmPtr, view: &impl ArenaView) -> Self {
        let raw_ptr = view.resolve(shm_ptr.offset) as *mut T;
        Self {
            raw_ptr,
            shm_ptr,
            _marker: PhantomData,
        }
    }

    pub const fn null() -> Self {
        Self {
            raw_ptr: std::ptr::null_mut(),
            shm_ptr: ShmPtr::null(),
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw_ptr.is_null() || self.shm_ptr.is_null()
    }

    pub fn raw_ptr(&self) -> *mut T {
        self.raw_ptr
    }

    pub fn shm_ptr(&self) -> ShmPtr {
        self.shm_ptr
    }

    /// Re-type the cached raw pointer. A no-op at runtime; it exists so
    /// callers can change the pointee type without re-resolving.
    pub fn cast<U>(self) -> FullPtr<U> {
        FullPtr {
            raw_ptr: self.raw_ptr as *mut U,
            shm_ptr: self.shm_ptr,
            _marker: PhantomData,
        }
    }
}

// `FullPtr` wraps a raw pointer into shared memory; it is Send/Sync
// exactly when T is, mirroring a reference into memory every attached
// process can see.
unsafe impl<T: Send> Send for FullPtr<T> {}
unsafe impl<T: Sync> Sync for FullPtr<T> {}

impl<T> Clone for FullPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for FullPtr<T> {}

impl<T> PartialEq for FullPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shm_ptr == other.shm_ptr
    }
}
impl<T> Eq for FullPtr<T> {}

impl<T> fmt::Debug for FullPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullPtr({:p}, {:?})", self.raw_ptr, self.shm_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::BackendId;

    struct FakeArena {
        base: Vec<u8>,
        id: AllocatorId,
    }

    impl FakeArena {
        fn new(size: usize) -> Self {
            Self {
                base: vec![0u8; size],
                id: AllocatorId::primary(BackendId::new(1, 0)),
            }
        }
    }

    impl ArenaView for FakeArena {
        fn allocator_id(&self) -> AllocatorId {
            self.id
        }

        fn arena_base(&self) -> *mut u8 {
            self.base.as_ptr() as *mut u8
        }

        fn data_range(&self) -> (*mut u8, *mut u8) {
            let start = self.base.as_ptr() as *mut u8;
            // SAFETY: offset stays within the allocation (one-past-end).
            let end = unsafe { start.add(self.base.len()) };
            (start, end)
        }
    }

    #[test]
    fn test_from_offset_round_trip() {
        let arena = FakeArena::new(4096);
        let fp = FullPtr::<u8>::from_offset(OffsetPtr::new(128), &arena);
        assert_eq!(fp.shm_ptr().offset.value(), 128);
        assert!(!fp.is_null());
    }

    #[test]
    fn test_from_raw_rejects_out_of_range() {
        let arena = FakeArena::new(64);
        let outside = Box::into_raw(Box::new(0u8));
        let result = FullPtr::<u8>::from_raw(outside, &arena);
        assert!(result.is_err());
        // SAFETY: reclaim the leaked box so the test does not leak memory.
        unsafe {
            drop(Box::from_raw(outside));
        }
    }

    #[test]
    fn test_from_raw_accepts_in_range() {
        let arena = FakeArena::new(64);
        let ptr = arena.arena_base();
        let result = FullPtr::<u8>::from_raw(ptr, &arena);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().shm_ptr().offset.value(), 0);
    }

    #[test]
    fn test_cast_preserves_shm_ptr() {
        let arena = FakeArena::new(64);
        let fp = FullPtr::<u8>::from_offset(OffsetPtr::new(8), &arena);
        let casted: FullPtr<u32> = fp.cast();
        assert_eq!(casted.shm_ptr(), fp.shm_ptr());
    }
}
