//! `#[repr(C)]` layout of the on-disk/on-mmap backend record.
//!
//! Mirrors `MemoryBackendHeader` from the original system: a fixed-layout
//! struct written once at creation and read thereafter by every attaching
//! process. Fields are ordered widest-first so `#[repr(C)]` never inserts
//! implicit padding, and a compile-time assertion pins the size so the
//! layout cannot silently drift between builds sharing a region.

use ctxshm_ptr::BackendId;

/// Each header section (private, shared) is exactly this many bytes.
pub const HEADER_SECTION_SIZE: usize = 4 * 1024;

/// Byte offset of the backend record from the start of the region:
/// private header (4 KiB) + shared header (4 KiB).
pub const RECORD_OFFSET: usize = 2 * HEADER_SECTION_SIZE;

/// Bits of `BackendRecord::flags`, plain constants rather than a crate:
/// there are only three of them and they never combine with anything
/// outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendFlags(u64);

impl BackendFlags {
    /// The record has been fully written; an attacher never observes a
    /// half-initialized record.
    pub const INITIALIZED: BackendFlags = BackendFlags(1 << 0);
    /// Set locally by the creating process; cleared locally by every
    /// attacher. Never written back into the mapped record after
    /// creation (the shared header is write-once).
    pub const OWNED: BackendFlags = BackendFlags(1 << 1);
    /// The data arena lives in device memory; host access must route
    /// through an accelerator (unsupported on this host-only path).
    pub const GPU_ONLY: BackendFlags = BackendFlags(1 << 2);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self(bits & (Self::INITIALIZED.0 | Self::OWNED.0 | Self::GPU_ONLY.0))
    }

    pub const fn contains(self, other: BackendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// The fixed-layout backend record, written once at `create()` time at
/// [`RECORD_OFFSET`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BackendRecord {
    // 8-byte aligned group first, to avoid implicit padding under repr(C).
    pub backend_size: u64,
    pub data_capacity: u64,
    pub priv_header_off: u64,
    pub flags: u64,

    // 4-byte aligned group.
    pub major: u32,
    pub minor: u32,
    /// Device id for the data buffer (GPU id, etc.); -1 means host memory.
    pub data_id: i32,
    pub _pad: u32,
}

pub const BACKEND_RECORD_SIZE: usize = std::mem::size_of::<BackendRecord>();
const _: () = assert!(BACKEND_RECORD_SIZE == 40);

impl BackendRecord {
    pub fn new(id: BackendId, backend_size: u64, data_capacity: u64, priv_header_off: u64) -> Self {
        Self {
            backend_size,
            data_capacity,
            priv_header_off,
            flags: BackendFlags::INITIALIZED.bits(),
            major: id.major,
            minor: id.minor,
            data_id: -1,
            _pad: 0,
        }
    }

    pub fn id(&self) -> BackendId {
        BackendId::new(self.major, self.minor)
    }

    pub fn flags(&self) -> BackendFlags {
        BackendFlags::from_bits_truncate(self.flags)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags().contains(BackendFlags::INITIALIZED)
    }

    pub fn is_gpu_only(&self) -> bool {
        self.flags().contains(BackendFlags::GPU_ONLY)
    }

    pub fn set_gpu_only(&mut self) {
        self.flags |= BackendFlags::GPU_ONLY.bits();
    }
}

/// Round `offset` up to the next multiple of [`HEADER_SECTION_SIZE`].
pub const fn align_to_section(offset: usize) -> usize {
    (offset + HEADER_SECTION_SIZE - 1) & !(HEADER_SECTION_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trips_id_and_flags() {
        let record = BackendRecord::new(BackendId::new(7, 1), 1 << 20, (1 << 20) - 8192, 8192);
        assert_eq!(record.id(), BackendId::new(7, 1));
        assert!(record.is_initialized());
        assert!(!record.is_gpu_only());
    }

    #[test]
    fn test_align_to_section() {
        assert_eq!(align_to_section(8192), 8192);
        assert_eq!(align_to_section(8193), 8192 + HEADER_SECTION_SIZE);
        assert_eq!(align_to_section(0), 0);
    }
}
