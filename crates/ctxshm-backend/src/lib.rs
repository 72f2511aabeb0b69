//! # ctxshm-backend
//!
//! Shared-memory backend regions: `shm_open`/`mmap`-backed mappings laid
//! out as a private header, a shared header, a backend record, and a
//! data arena. This crate owns the region lifecycle (`create`,
//! `attach`, `destroy`) and the fixed record layout; allocator
//! algorithms that carve up the data arena live in `ctxshm-alloc`.
//!
//! Only a POSIX shared-memory backing store is implemented here. A
//! backend whose record reports [`header::BackendFlags::GPU_ONLY`] has
//! no host-accessible data arena; attempting to build an allocator over
//! one returns [`ctxshm_error::ErrorKind::Unsupported`].

mod header;
mod region;

pub use header::{
    align_to_section, BackendFlags, BackendRecord, BACKEND_RECORD_SIZE, HEADER_SECTION_SIZE, RECORD_OFFSET,
};
pub use region::{Backend, BackendArenaView, DATA_OFFSET};

use ctxshm_error::{Error, Result};
use ctxshm_ptr::AllocatorId;

/// Construct an allocator of type `A` in place at the start of a
/// backend's data arena, initializing it for first use.
///
/// Mirrors `MemoryBackend::MakeAlloc` from the original system: `shm_init`
/// takes the backend itself (not just a resolved arena view), since an
/// allocator may need the shared/private header sections as well as the
/// data arena to build its cross-process state. On a GPU-only backend
/// this returns `Unsupported` rather than attempting a device-side
/// construction, since this workspace implements the host-only path.
pub trait ShmAllocatorInit: Sized {
    type InitArgs;

    /// Build a fresh allocator instance over `backend`, writing whatever
    /// metadata it needs into the arena or header sections it owns.
    fn shm_init(backend: &mut Backend, allocator_id: AllocatorId, args: Self::InitArgs) -> Result<Self>;

    /// Reconstruct a handle onto an allocator a prior process already
    /// initialized over the same backend.
    fn shm_attach(backend: &mut Backend, allocator_id: AllocatorId) -> Result<Self>;
}

/// Build an allocator of type `A` over `backend`'s data arena.
pub fn make_alloc<A: ShmAllocatorInit>(backend: &mut Backend, allocator_id: AllocatorId, args: A::InitArgs) -> Result<A> {
    if backend.is_gpu_only() {
        return Err(Error::unsupported(
            "GPU-only backends have no host-accessible data arena in this workspace",
        )
        .with_operation("make_alloc"));
    }
    A::shm_init(backend, allocator_id, args)
}

/// Attach an allocator of type `A` onto `backend`'s data arena, where
/// some other process already called [`make_alloc`].
pub fn attach_alloc<A: ShmAllocatorInit>(backend: &mut Backend, allocator_id: AllocatorId) -> Result<A> {
    if backend.is_gpu_only() {
        return Err(Error::unsupported(
            "GPU-only backends have no host-accessible data arena in this workspace",
        )
        .with_operation("attach_alloc"));
    }
    A::shm_attach(backend, allocator_id)
}
