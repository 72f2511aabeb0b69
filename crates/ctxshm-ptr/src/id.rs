//! `BackendId` / `AllocatorId`: identifiers for a mapped region and for an
//! allocator living inside one.

use std::fmt;

/// Sentinel used for every field of a null identifier.
const NULL_FIELD: u32 = u32::MAX;

/// Identifies a mapped backend region: `(major, minor)`.
///
/// `major` is typically the creating process id; `minor` distinguishes
/// regions owned by the same process. The null id (`UINT32_MAX` in both
/// fields) means "no backend."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackendId {
    pub major: u32,
    pub minor: u32,
}

impl BackendId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The reserved null backend id.
    pub const fn null() -> Self {
        Self {
            major: NULL_FIELD,
            minor: NULL_FIELD,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.major == NULL_FIELD && self.minor == NULL_FIELD
    }

    /// Collapse the id to a single integer, for use as a map key or a
    /// compact log field. Not guaranteed stable across processes.
    pub const fn to_index(&self) -> u64 {
        ((self.major as u64) << 32) | (self.minor as u64)
    }
}

impl Default for BackendId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "BackendId(null)")
        } else {
            write!(f, "BackendId({}, {})", self.major, self.minor)
        }
    }
}

/// Identifies an allocator within a backend: `(backend_id, sub_id)`.
///
/// `sub_id == 0` is the primary allocator for that backend. The null id
/// marks pointers produced outside any backend (see [`crate::malloc`] in
/// `ctxshm-alloc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocatorId {
    pub backend: BackendId,
    pub sub_id: u32,
}

impl AllocatorId {
    pub const fn new(backend: BackendId, sub_id: u32) -> Self {
        Self { backend, sub_id }
    }

    /// The primary allocator id for a given backend (`sub_id == 0`).
    pub const fn primary(backend: BackendId) -> Self {
        Self { backend, sub_id: 0 }
    }

    pub const fn null() -> Self {
        Self {
            backend: BackendId::null(),
            sub_id: NULL_FIELD,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.backend.is_null() && self.sub_id == NULL_FIELD
    }
}

impl Default for AllocatorId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "AllocatorId(null)")
        } else {
            write!(f, "AllocatorId({}, {})", self.backend, self.sub_id)
        }
    }
}
