//! `Backend`: a POSIX shared-memory region owning a private header, a
//! shared header, and a 4 KiB-aligned data arena.
//!
//! Layout, offset 0 from the start of the mapping:
//!
//! ```text
//! [ private header (4 KiB) ][ shared header (4 KiB) ][ backend record ][ padding ][ data arena ]
//! ```
//!
//! The private header is process-local scratch; nothing in this crate
//! assumes other processes ever read it. The shared header and the
//! backend record are written once, at `create()` time, by the owning
//! process and never mutated by attachers.

use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use ctxshm_error::{Error, Result};
use ctxshm_ptr::{AllocatorId, ArenaView, BackendId};
use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::stat::Mode;
use nix::unistd;

use crate::header::{align_to_section, BackendRecord, BACKEND_RECORD_SIZE, HEADER_SECTION_SIZE, RECORD_OFFSET};

/// Offset from the start of the mapping to the first byte of the data
/// arena. The backend record sits right after the two header sections;
/// the arena itself starts at the next 4 KiB boundary.
pub const DATA_OFFSET: usize = align_to_section(RECORD_OFFSET + BACKEND_RECORD_SIZE);

/// A mapped shared-memory region plus the backend record describing it.
///
/// Move-only: dropping the last handle to an owned backend unmaps (and,
/// if this process created the region, unlinks) it.
pub struct Backend {
    id: BackendId,
    name: String,
    mmap: MmapMut,
    /// Process-local copy of the ownership bit. Distinct from the bytes
    /// in the mapped record, which are never rewritten after `create()`.
    owned: bool,
    destroyed: bool,
}

impl Backend {
    /// Create a new backend region of `size` bytes at a fresh
    /// `shm_open` name derived from `name` and `id`.
    ///
    /// Fails with [`ctxshm_error::ErrorKind::CreationFailed`] if a
    /// region by that name already exists or the size is too small to
    /// hold the fixed headers.
    pub fn create(name: &str, id: BackendId, size: usize) -> Result<Self> {
        if size <= DATA_OFFSET {
            return Err(Error::creation_failed(format!(
                "backend size {size} too small, headers alone need {DATA_OFFSET} bytes"
            ))
            .with_operation("Backend::create"));
        }

        let shm_name = shm_open_name(name);
        let fd = mman::shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| {
            Error::creation_failed(format!("shm_open({shm_name}) failed: {errno}"))
                .with_operation("Backend::create")
                .with_context("name", shm_name.clone())
        })?;

        let result = (|| -> Result<MmapMut> {
            unistd::ftruncate(&fd, size as i64).map_err(|errno| {
                Error::creation_failed(format!("ftruncate failed: {errno}")).with_operation("Backend::create")
            })?;
            // SAFETY: fd was just created and sized by this process; no
            // other process can have mapped it yet.
            unsafe { MmapMut::map_mut(fd.as_raw_fd()) }
                .map_err(|e| Error::creation_failed(format!("mmap failed: {e}")).with_operation("Backend::create"))
        })();

        let mut mmap = match result {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = mman::shm_unlink(shm_name.as_str());
                return Err(e);
            }
        };

        let data_capacity = (size - DATA_OFFSET) as u64;
        let record = BackendRecord::new(id, size as u64, data_capacity, DATA_OFFSET as u64);
        write_record(&mut mmap, &record);

        tracing::debug!(backend = %id, name = %shm_name, size, "created shared memory backend");

        Ok(Self {
            id,
            name: shm_name,
            mmap,
            owned: true,
            destroyed: false,
        })
    }

    /// Attach to an existing backend region created by `create()`
    /// (possibly in another process).
    ///
    /// Fails with [`ctxshm_error::ErrorKind::AttachFailed`] if the
    /// region does not exist, or its record is not marked initialized.
    pub fn attach(name: &str) -> Result<Self> {
        let shm_name = shm_open_name(name);
        let fd = mman::shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            Error::attach_failed(format!("shm_open({shm_name}) failed: {errno}"))
                .with_operation("Backend::attach")
                .with_context("name", shm_name.clone())
        })?;

        // SAFETY: fd refers to a live shm object; MmapMut::map_mut maps
        // its full current size.
        let mmap = unsafe { MmapMut::map_mut(fd.as_raw_fd()) }
            .map_err(|e| Error::attach_failed(format!("mmap failed: {e}")).with_operation("Backend::attach"))?;

        let record = read_record(&mmap);
        if !record.is_initialized() {
            return Err(Error::attach_failed("backend record is not initialized")
                .with_operation("Backend::attach")
                .with_context("name", shm_name.clone()));
        }
        if record.backend_size != mmap.len() as u64 {
            return Err(Error::attach_failed(format!(
                "backend record size {} does not match mapped size {}",
                record.backend_size,
                mmap.len()
            ))
            .with_operation("Backend::attach"));
        }

        let id = record.id();
        tracing::debug!(backend = %id, name = %shm_name, "attached shared memory backend");

        Ok(Self {
            id,
            name: shm_name,
            mmap,
            // Every attacher's local view starts unowned; only the
            // creator's handle starts owned. The mapped record keeps
            // whatever OWNED bit the creator wrote, but this crate never
            // reads that bit back out, only the local copy here.
            owned: false,
            destroyed: false,
        })
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owned
    }

    pub fn unset_owner(&mut self) {
        self.owned = false;
    }

    pub fn is_gpu_only(&self) -> bool {
        read_record(&self.mmap).is_gpu_only()
    }

    pub fn do_accel_path(&self) -> bool {
        self.is_gpu_only()
    }

    /// The 4 KiB private header. Process-local; never read by another
    /// process's `Backend` handle onto the same region.
    pub fn private_header(&mut self) -> &mut [u8] {
        &mut self.mmap[0..HEADER_SECTION_SIZE]
    }

    /// The 4 KiB shared header, written once by the creator.
    pub fn shared_header(&self) -> &[u8] {
        &self.mmap[HEADER_SECTION_SIZE..2 * HEADER_SECTION_SIZE]
    }

    pub fn shared_header_mut(&mut self) -> &mut [u8] {
        if !self.owned {
            tracing::warn!(backend = %self.id, "writing shared header from a non-owning handle");
        }
        &mut self.mmap[HEADER_SECTION_SIZE..2 * HEADER_SECTION_SIZE]
    }

    /// Both header sections at once, borrowed disjointly. Needed by
    /// allocators (like `MultiProcessAllocator`) that place state into
    /// both the private and the shared header from a single call and
    /// can't take two separate `&mut self` borrows to do it.
    pub fn private_and_shared_headers_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let (private, rest) = self.mmap.split_at_mut(HEADER_SECTION_SIZE);
        let shared = &mut rest[..HEADER_SECTION_SIZE];
        (private, shared)
    }

    /// Base pointer of the data arena (offset [`DATA_OFFSET`] into the
    /// mapping), and its length in bytes.
    pub fn data_arena(&mut self) -> (NonNull<u8>, usize) {
        let len = self.mmap.len() - DATA_OFFSET;
        let ptr = self.mmap[DATA_OFFSET..].as_mut_ptr();
        // SAFETY: ptr comes from a live mmap slice, never null.
        (unsafe { NonNull::new_unchecked(ptr) }, len)
    }

    pub fn data_capacity(&self) -> u64 {
        read_record(&self.mmap).data_capacity
    }

    /// Unmap (and, if this handle owns the region, unlink) it. Safe to
    /// call more than once.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if self.owned {
            if let Err(errno) = mman::shm_unlink(self.name.as_str()) {
                tracing::warn!(backend = %self.id, name = %self.name, %errno, "shm_unlink failed");
            } else {
                tracing::debug!(backend = %self.id, name = %self.name, "unlinked shared memory backend");
            }
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Minimal [`ArenaView`] over a backend's data arena, used by allocators
/// built on top of this crate to resolve `ShmPtr`s into raw addresses.
pub struct BackendArenaView {
    allocator_id: AllocatorId,
    base: *mut u8,
    len: usize,
}

impl BackendArenaView {
    pub fn new(backend: &mut Backend, allocator_id: AllocatorId) -> Self {
        let (base, len) = backend.data_arena();
        Self {
            allocator_id,
            base: base.as_ptr(),
            len,
        }
    }
}

impl ArenaView for BackendArenaView {
    fn allocator_id(&self) -> AllocatorId {
        self.allocator_id
    }

    fn arena_base(&self) -> *mut u8 {
        self.base
    }

    fn data_range(&self) -> (*mut u8, *mut u8) {
        // SAFETY: `len` is the mapped arena length; one-past-end is valid.
        (self.base, unsafe { self.base.add(self.len) })
    }
}

// `Backend` owns its mapping and fd exclusively once constructed; it is
// safe to move between threads. Shared access to the mapped bytes from
// multiple processes is governed by the allocator built on top, not by
// this type.
unsafe impl Send for Backend {}

fn shm_open_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

fn write_record(mmap: &mut MmapMut, record: &BackendRecord) {
    let bytes = unsafe {
        std::slice::from_raw_parts(record as *const BackendRecord as *const u8, BACKEND_RECORD_SIZE)
    };
    mmap[RECORD_OFFSET..RECORD_OFFSET + BACKEND_RECORD_SIZE].copy_from_slice(bytes);
}

fn read_record(mmap: &MmapMut) -> BackendRecord {
    let mut record = std::mem::MaybeUninit::<BackendRecord>::uninit();
    unsafe {
        std::ptr::copy_nonoverlapping(
            mmap[RECORD_OFFSET..RECORD_OFFSET + BACKEND_RECORD_SIZE].as_ptr(),
            record.as_mut_ptr() as *mut u8,
            BACKEND_RECORD_SIZE,
        );
        record.assume_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn unique_name(tag: &str) -> String {
        format!("ctxshm-test-{tag}-{}", std::process::id())
    }

    #[test]
    #[serial]
    fn test_create_attach_destroy() {
        let name = unique_name("create-attach");
        let id = BackendId::new(1, 0);
        let mut creator = Backend::create(&name, id, 1 << 20).expect("create");
        assert!(creator.is_owner());
        assert_eq!(creator.id(), id);
        assert_eq!(creator.data_capacity(), (1 << 20) - DATA_OFFSET as u64);

        let mut attacher = Backend::attach(&name).expect("attach");
        assert!(!attacher.is_owner());
        assert_eq!(attacher.id(), id);

        let (ptr, len) = attacher.data_arena();
        assert!(len > 0);
        unsafe {
            *ptr.as_ptr() = 42;
        }
        let (creator_ptr, _) = creator.data_arena();
        assert_eq!(unsafe { *creator_ptr.as_ptr() }, 42);

        attacher.destroy();
        creator.destroy();
    }

    #[test]
    #[serial]
    fn test_create_rejects_duplicate_name() {
        let name = unique_name("dup");
        let id = BackendId::new(2, 0);
        let mut first = Backend::create(&name, id, 1 << 16).expect("create");
        let second = Backend::create(&name, id, 1 << 16);
        assert!(second.is_err());
        first.destroy();
    }

    #[test]
    #[serial]
    fn test_attach_missing_fails() {
        let name = unique_name("missing");
        let result = Backend::attach(&name);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_create_rejects_too_small_size() {
        let name = unique_name("too-small");
        let result = Backend::create(&name, BackendId::new(3, 0), 64);
        assert!(result.is_err());
    }
}
