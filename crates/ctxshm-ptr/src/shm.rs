//! `ShmPtr`: a fully self-describing position-independent pointer.

use std::fmt;

use crate::id::AllocatorId;
use crate::offset::OffsetPtr;

/// A pair `(allocator_id, offset)`. Any process attached to `allocator_id`
/// can resolve this to a raw pointer without further context.
///
/// Null is defined by either half being null; constructing from two
/// non-null halves where one half later becomes null (e.g. via
/// [`Self::set_null`]) nulls the whole value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShmPtr {
    pub allocator_id: AllocatorId,
    pub offset: OffsetPtr,
}

impl ShmPtr {
    pub const fn new(allocator_id: AllocatorId, offset: OffsetPtr) -> Self {
        Self {
            allocator_id,
            offset,
        }
    }

    pub const fn null() -> Self {
        Self {
            allocator_id: AllocatorId::null(),
            offset: OffsetPtr::null(),
        }
    }

    pub const fn is_null(&self) -> bool {
        self.allocator_id.is_null() || self.offset.is_null()
    }

    pub fn set_null(&mut self) {
        *self = Self::null();
    }

    /// Offset this pointer by `delta` bytes. Only the offset half changes;
    /// the allocator id is untouched.
    pub fn add(&self, delta: u64) -> Self {
        Self {
            allocator_id: self.allocator_id,
            offset: self.offset.add(delta),
        }
    }

    pub fn sub(&self, delta: u64) -> Self {
        Self {
            allocator_id: self.allocator_id,
            offset: self.offset.sub(delta),
        }
    }

    pub const fn is_marked(&self) -> bool {
        self.offset.is_marked()
    }

    pub const fn mark(&self) -> Self {
        Self {
            allocator_id: self.allocator_id,
            offset: self.offset.mark(),
        }
    }

    pub const fn unmark(&self) -> Self {
        Self {
            allocator_id: self.allocator_id,
            offset: self.offset.unmark(),
        }
    }
}

impl Default for ShmPtr {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for ShmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ShmPtr(null)")
        } else {
            write!(f, "ShmPtr({:?}, {:?})", self.allocator_id, self.offset)
        }
    }
}

impl std::ops::Add<u64> for ShmPtr {
    type Output = ShmPtr;
    fn add(self, rhs: u64) -> ShmPtr {
        ShmPtr::add(&self, rhs)
    }
}

impl std::ops::Sub<u64> for ShmPtr {
    type Output = ShmPtr;
    fn sub(self, rhs: u64) -> ShmPtr {
        ShmPtr::sub(&self, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::BackendId;
    use pretty_assertions::assert_eq;

    fn alloc_id() -> AllocatorId {
        AllocatorId::primary(BackendId::new(1, 0))
    }

    #[test]
    fn test_null_via_either_half() {
        assert!(ShmPtr::new(AllocatorId::null(), OffsetPtr::new(0)).is_null());
        assert!(ShmPtr::new(alloc_id(), OffsetPtr::null()).is_null());
        assert!(!ShmPtr::new(alloc_id(), OffsetPtr::new(0)).is_null());
    }

    #[test]
    fn test_equality_requires_both_halves() {
        let a = ShmPtr::new(alloc_id(), OffsetPtr::new(10));
        let b = ShmPtr::new(alloc_id(), OffsetPtr::new(10));
        let c = ShmPtr::new(alloc_id(), OffsetPtr::new(11));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_add_only_touches_offset() {
        let p = ShmPtr::new(alloc_id(), OffsetPtr::new(100));
        let moved = p + 28;
        assert_eq!(moved.allocator_id, p.allocator_id);
        assert_eq!(moved.offset.value(), 128);
    }
}
