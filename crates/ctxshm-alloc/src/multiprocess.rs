//! `MultiProcessAllocator`: the allocator runtime and clients actually
//! allocate request/response buffers from.
//!
//! Layers on the buddy shape (`crate::buddy::BuddyAllocator`) but
//! splits its state across the two fixed header sections of a
//! `ctxshm-backend` region: per-thread caches live in the *private*
//! header (process-local, unsynchronized), the buddy free lists live
//! in the *shared* header behind a `parking_lot::Mutex` (the lightweight
//! lock the spec calls for on the shared-pool slow path).
//!
//! The shared `Mutex<BuddyAllocator>` is placed into the mapped bytes
//! exactly once, by whichever process creates the backend; every
//! attacher reinterprets the same bytes as a reference rather than
//! re-running `Mutex::new`, the same pattern `BackendRecord` uses for
//! the header ahead of it.

use std::sync::atomic::{AtomicU64, Ordering};

use ctxshm_backend::{Backend, ShmAllocatorInit, HEADER_SECTION_SIZE};
use ctxshm_error::{Error, Result};
use ctxshm_ptr::{AllocatorId, ArenaView, OffsetPtr};
use parking_lot::Mutex;

use crate::buddy::BuddyAllocator;
use crate::slist::Slist;

/// Number of concurrent thread caches a single allocator instance can
/// hand out. Generous for a request/response workload; exhausting this
/// falls back to going straight to the shared pool uncached.
const MAX_TLS_SLOTS: usize = 64;

/// Blocks at or under this size are served from a thread's local cache
/// when possible, to avoid contending the shared-pool mutex on the hot
/// path. Larger requests always go through the shared pool.
const TLS_FAST_PATH_MAX: u64 = 256;

#[derive(Clone, Copy)]
struct TlsSlot {
    /// 0 means the slot is unclaimed. Otherwise a process+counter id,
    /// unique within this process's lifetime (see `create_tls`).
    owner: u64,
    cached: Slist,
}

impl TlsSlot {
    const fn empty() -> Self {
        Self { owner: 0, cached: Slist::new() }
    }
}

/// Private, process-local state: one slot per concurrently-active
/// thread using this allocator.
struct PrivateState {
    slots: [TlsSlot; MAX_TLS_SLOTS],
}

impl PrivateState {
    fn new() -> Self {
        Self { slots: [TlsSlot::empty(); MAX_TLS_SLOTS] }
    }
}

/// Opaque handle returned by `create_tls`, identifying a claimed slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsHandle(usize);

static NEXT_TLS_ID: AtomicU64 = AtomicU64::new(1);

/// The allocator actually used for request/response buffers: a buddy
/// pool in the shared header, fronted by per-thread caches in the
/// private header.
pub struct MultiProcessAllocator {
    shared: *mut Mutex<BuddyAllocator>,
    private: *mut PrivateState,
}

// SAFETY: both pointers reference shared/process-local mapped memory
// that outlives this handle; the types behind them (`Mutex<...>`,
// plain private-header state) are Send/Sync on their own terms.
unsafe impl Send for MultiProcessAllocator {}
unsafe impl Sync for MultiProcessAllocator {}

impl MultiProcessAllocator {
    /// Construct a fresh allocator over `shared_header`/`private_header`
    /// (each expected to be the 4 KiB sections a `ctxshm_backend::Backend`
    /// exposes) and `heap_begin`/`heap_size` describing the data arena
    /// the buddy pool manages.
    ///
    /// # Safety
    /// `shared_header` and `private_header` must each be at least large
    /// enough for their respective state (`Mutex<BuddyAllocator>` and
    /// `PrivateState`), writable, and not already initialized by
    /// another call to `create` or `attach`.
    pub unsafe fn create(shared_header: &mut [u8], private_header: &mut [u8], heap_begin: u64, heap_size: u64) -> Result<Self> {
        let buddy = BuddyAllocator::new(heap_begin, heap_size)?;
        let shared = shared_header.as_mut_ptr() as *mut Mutex<BuddyAllocator>;
        shared.write(Mutex::new(buddy));

        let private = private_header.as_mut_ptr() as *mut PrivateState;
        private.write(PrivateState::new());

        Ok(Self { shared, private })
    }

    /// Reattach to state a prior `create` call already initialized.
    ///
    /// # Safety
    /// `shared_header`/`private_header` must be the same mapped bytes
    /// (or a twin mapping of the same region) a live `create` call
    /// wrote into; this never re-initializes them.
    pub unsafe fn attach(shared_header: &mut [u8], private_header: &mut [u8]) -> Self {
        Self {
            shared: shared_header.as_mut_ptr() as *mut Mutex<BuddyAllocator>,
            private: private_header.as_mut_ptr() as *mut PrivateState,
        }
    }

    fn private(&self) -> &mut PrivateState {
        // SAFETY: private header is process-local; this allocator
        // instance is the only thing that touches it.
        unsafe { &mut *self.private }
    }

    /// Claim a thread cache slot. Mirrors `CreateTls`.
    pub fn create_tls(&self) -> Result<TlsHandle> {
        let id = NEXT_TLS_ID.fetch_add(1, Ordering::Relaxed);
        let state = self.private();
        for (i, slot) in state.slots.iter_mut().enumerate() {
            if slot.owner == 0 {
                slot.owner = id;
                slot.cached = Slist::new();
                return Ok(TlsHandle(i));
            }
        }
        Err(Error::new(ctxshm_error::ErrorKind::ResourceExhausted, "no free TLS slot")
            .with_operation("MultiProcessAllocator::create_tls"))
    }

    /// Release a thread cache slot, returning any blocks it still
    /// holds to the shared pool. Mirrors `FreeTls`.
    pub fn free_tls(&self, view: &impl ArenaView, handle: TlsHandle) {
        let state = self.private();
        let slot = &mut state.slots[handle.0];
        if slot.owner == 0 {
            return;
        }
        let mut guard = self.shared_mut().lock();
        while let Some(offset) = unsafe { slot.cached.pop(view) } {
            unsafe { guard.free(view, offset) };
        }
        *slot = TlsSlot::empty();
    }

    fn shared_mut(&self) -> &Mutex<BuddyAllocator> {
        // SAFETY: `shared` was written exactly once by `create` before
        // any handle existed; every subsequent access only borrows it.
        unsafe { &*self.shared }
    }

    /// Allocate `size` bytes, trying the calling thread's cache first.
    pub fn allocate(&self, view: &impl ArenaView, handle: TlsHandle, size: u64) -> Result<OffsetPtr> {
        if size <= TLS_FAST_PATH_MAX {
            let state = self.private();
            let slot = &mut state.slots[handle.0];
            if let Some(offset) = unsafe { slot.cached.pop(view) } {
                return Ok(offset);
            }
        }
        let mut guard = self.shared_mut().lock();
        unsafe { guard.allocate(view, size) }
    }

    /// Free a block, returning it to the calling thread's cache when
    /// the block is small enough to be worth caching, otherwise
    /// straight to the shared pool.
    pub fn free(&self, view: &impl ArenaView, handle: TlsHandle, offset: OffsetPtr, size: u64) {
        if size <= TLS_FAST_PATH_MAX {
            let state = self.private();
            let slot = &mut state.slots[handle.0];
            unsafe { slot.cached.emplace(view, offset) };
            return;
        }
        let mut guard = self.shared_mut().lock();
        unsafe { guard.free(view, offset) };
    }

    /// Resize a block in place where possible, otherwise allocate a new
    /// one, copy `old_size` bytes across, and free the original.
    /// Mirrors `MallocAllocator::reallocate`'s shape, routed through the
    /// buddy pool instead of the process heap.
    pub fn reallocate(&self, view: &impl ArenaView, handle: TlsHandle, offset: OffsetPtr, old_size: u64, new_size: u64) -> Result<OffsetPtr> {
        if offset.is_null() {
            return self.allocate(view, handle, new_size);
        }
        let new_offset = self.allocate(view, handle, new_size)?;
        let copy_size = old_size.min(new_size);
        if copy_size > 0 {
            // SAFETY: both offsets resolve into the same arena `view`
            // covers; `offset` names `old_size` live bytes and
            // `new_offset` was just allocated with room for `new_size`.
            unsafe {
                std::ptr::copy_nonoverlapping(view.resolve(offset), view.resolve(new_offset), copy_size as usize);
            }
        }
        self.free(view, handle, offset, old_size);
        Ok(new_offset)
    }
}

const _: () = assert!(std::mem::size_of::<Mutex<BuddyAllocator>>() <= HEADER_SECTION_SIZE);
const _: () = assert!(std::mem::size_of::<PrivateState>() <= HEADER_SECTION_SIZE);

/// `args` is the `(TlsHandle-less) heap size` to reserve, or `0` to
/// claim the backend's full data arena; sizing the shared free-list
/// state and the per-thread cache state both come from the fixed 4 KiB
/// header sections `backend` already carries, so there is nothing else
/// to configure.
///
/// Unlike [`crate::arena::ArenaAllocator`] and [`crate::buddy::BuddyAllocator`]
/// on their own, this allocator's state genuinely lives in the backend:
/// the buddy free lists sit in the shared header and the thread caches
/// sit in the private header, so `shm_attach` is a real reattach rather
/// than an `Unsupported` stub.
impl ShmAllocatorInit for MultiProcessAllocator {
    type InitArgs = u64;

    fn shm_init(backend: &mut Backend, _allocator_id: AllocatorId, reservation_size: Self::InitArgs) -> Result<Self> {
        let capacity = backend.data_capacity();
        let size = if reservation_size == 0 { capacity } else { reservation_size.min(capacity) };
        let (private_header, shared_header) = backend.private_and_shared_headers_mut();
        // SAFETY: `shared_header`/`private_header` are freshly mapped,
        // zeroed backend sections that no prior call has written into.
        unsafe { Self::create(shared_header, private_header, 0, size) }
    }

    fn shm_attach(backend: &mut Backend, _allocator_id: AllocatorId) -> Result<Self> {
        let (private_header, shared_header) = backend.private_and_shared_headers_mut();
        // SAFETY: `backend` names the same region a prior `shm_init`
        // call initialized; this only reinterprets its header bytes.
        Ok(unsafe { Self::attach(shared_header, private_header) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxshm_ptr::AllocatorId;

    struct FakeArena {
        bytes: std::cell::UnsafeCell<Vec<u8>>,
    }

    impl FakeArena {
        fn new(size: usize) -> Self {
            Self { bytes: std::cell::UnsafeCell::new(vec![0u8; size]) }
        }
    }

    impl ArenaView for FakeArena {
        fn allocator_id(&self) -> AllocatorId {
            AllocatorId::null()
        }
        fn arena_base(&self) -> *mut u8 {
            unsafe { (*self.bytes.get()).as_mut_ptr() }
        }
        fn data_range(&self) -> (*mut u8, *mut u8) {
            let start = self.arena_base();
            let len = unsafe { (*self.bytes.get()).len() };
            (start, unsafe { start.add(len) })
        }
    }

    #[test]
    fn test_create_tls_and_allocate() {
        let arena = FakeArena::new(1 << 20);
        let mut shared_header = vec![0u8; 4096];
        let mut private_header = vec![0u8; 4096];
        unsafe {
            let alloc = MultiProcessAllocator::create(&mut shared_header, &mut private_header, 0, 1 << 20).unwrap();
            let handle = alloc.create_tls().unwrap();
            let p = alloc.allocate(&arena, handle, 64).unwrap();
            assert!(!p.is_null());
            alloc.free(&arena, handle, p, 64);
            alloc.free_tls(&arena, handle);
        }
    }

    #[test]
    fn test_tls_slot_exhaustion_is_reported() {
        let mut shared_header = vec![0u8; 4096];
        let mut private_header = vec![0u8; 4096];
        unsafe {
            let alloc = MultiProcessAllocator::create(&mut shared_header, &mut private_header, 0, 1 << 16).unwrap();
            let mut handles = Vec::new();
            for _ in 0..MAX_TLS_SLOTS {
                handles.push(alloc.create_tls().unwrap());
            }
            assert!(alloc.create_tls().is_err());
        }
    }

    #[test]
    fn test_large_allocation_bypasses_tls_cache() {
        let arena = FakeArena::new(1 << 20);
        let mut shared_header = vec![0u8; 4096];
        let mut private_header = vec![0u8; 4096];
        unsafe {
            let alloc = MultiProcessAllocator::create(&mut shared_header, &mut private_header, 0, 1 << 20).unwrap();
            let handle = alloc.create_tls().unwrap();
            let p = alloc.allocate(&arena, handle, 20_000).unwrap();
            assert!(!p.is_null());
        }
    }

    #[test]
    fn test_reallocate_preserves_prefix_bytes() {
        let arena = FakeArena::new(1 << 20);
        let mut shared_header = vec![0u8; 4096];
        let mut private_header = vec![0u8; 4096];
        unsafe {
            let alloc = MultiProcessAllocator::create(&mut shared_header, &mut private_header, 0, 1 << 20).unwrap();
            let handle = alloc.create_tls().unwrap();
            let p = alloc.allocate(&arena, handle, 64).unwrap();
            std::ptr::write_bytes(arena.resolve(p), 0xCD, 64);
            let grown = alloc.reallocate(&arena, handle, p, 64, 4096).unwrap();
            assert!(!grown.is_null());
            let grown_bytes = std::slice::from_raw_parts(arena.resolve(grown), 64);
            assert!(grown_bytes.iter().all(|&b| b == 0xCD));
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_shm_init_through_backend_and_attach_recovers_state() {
        use ctxshm_backend::{attach_alloc, make_alloc};
        use ctxshm_ptr::BackendId;

        let name = format!("ctxshm-alloc-test-multiprocess-{}", std::process::id());
        let backend_id = BackendId::new(10, 0);
        let mut backend = Backend::create(&name, backend_id, 1 << 20).expect("create");
        let allocator_id = AllocatorId::new(backend_id, 0);

        let arena = ctxshm_backend::BackendArenaView::new(&mut backend, allocator_id);
        let alloc = make_alloc::<MultiProcessAllocator>(&mut backend, allocator_id, 0).expect("shm_init");
        let handle = alloc.create_tls().unwrap();
        let p = alloc.allocate(&arena, handle, 64).unwrap();
        assert!(!p.is_null());

        let attached = attach_alloc::<MultiProcessAllocator>(&mut backend, allocator_id).expect("shm_attach");
        let attached_handle = attached.create_tls().unwrap();
        let q = attached.allocate(&arena, attached_handle, 64).unwrap();
        assert!(!q.is_null());
        assert_ne!(p, q);

        backend.destroy();
    }
}
