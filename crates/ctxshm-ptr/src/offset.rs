//! `OffsetPtr`: a byte offset into a specific arena.
//!
//! Null is `u64::MAX`, not zero, since offset 0 is a valid arena location.
//! The top bit is reserved as a mark bit for lock-free algorithms (e.g. a
//! Harris-style linked list); mark/unmark never change the pointed-to
//! location. A non-atomic and an atomic flavor are provided as distinct
//! types rather than one type generic over storage, since their APIs
//! diverge (the atomic flavor exposes load/exchange/compare_exchange
//! instead of a bare value).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Offset value meaning "no offset."
pub const NULL_OFFSET: u64 = u64::MAX;

/// The mark bit reserved for lock-free algorithms.
const MARK_BIT: u64 = 1 << 63;

/// A non-atomic byte offset into an arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OffsetPtr(u64);

impl OffsetPtr {
    /// Construct a null offset pointer.
    pub const fn null() -> Self {
        Self(NULL_OFFSET)
    }

    /// Construct from a raw offset. `offset` must not collide with
    /// [`NULL_OFFSET`]; in practice arena sizes never approach `u64::MAX`.
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn is_null(&self) -> bool {
        self.0 == NULL_OFFSET
    }

    pub fn set_null(&mut self) {
        self.0 = NULL_OFFSET;
    }

    /// The raw stored value, mark bit included.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The offset with the mark bit cleared. Arithmetic operates on this
    /// value; callers that need to know whether the pointer was marked
    /// should check [`Self::is_marked`] first.
    pub const fn value(&self) -> u64 {
        self.0 & !MARK_BIT
    }

    pub const fn is_marked(&self) -> bool {
        self.0 & MARK_BIT != 0
    }

    /// Return a copy with the mark bit set. Marking a null pointer is a
    /// no-op (it is already all-ones).
    pub const fn mark(&self) -> Self {
        Self(self.0 | MARK_BIT)
    }

    /// Return a copy with the mark bit cleared. Unmarking a null pointer
    /// would turn it into a very large, non-null offset, so it is
    /// rejected: unmarking null returns null unchanged.
    pub const fn unmark(&self) -> Self {
        if self.is_null() {
            *self
        } else {
            Self(self.0 & !MARK_BIT)
        }
    }

    /// Offset this pointer by `delta` bytes, preserving the mark bit.
    ///
    /// # Panics
    /// Debug builds panic if `self` is null; arithmetic on a null offset
    /// is undefined per the pointer contract and release builds leave the
    /// behavior unspecified rather than paying for the check.
    pub fn add(&self, delta: u64) -> Self {
        debug_assert!(!self.is_null(), "arithmetic on a null OffsetPtr");
        let marked = self.is_marked();
        let base = Self(self.value().wrapping_add(delta));
        if marked {
            base.mark()
        } else {
            base
        }
    }

    /// Offset this pointer backward by `delta` bytes, preserving the mark
    /// bit. See [`Self::add`] for the null-pointer contract.
    pub fn sub(&self, delta: u64) -> Self {
        debug_assert!(!self.is_null(), "arithmetic on a null OffsetPtr");
        let marked = self.is_marked();
        let base = Self(self.value().wrapping_sub(delta));
        if marked {
            base.mark()
        } else {
            base
        }
    }
}

impl Default for OffsetPtr {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for OffsetPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "OffsetPtr(null)")
        } else {
            write!(
                f,
                "OffsetPtr({}{})",
                self.value(),
                if self.is_marked() { ", marked" } else { "" }
            )
        }
    }
}

impl std::ops::Add<u64> for OffsetPtr {
    type Output = OffsetPtr;
    fn add(self, rhs: u64) -> OffsetPtr {
        OffsetPtr::add(&self, rhs)
    }
}

impl std::ops::Sub<u64> for OffsetPtr {
    type Output = OffsetPtr;
    fn sub(self, rhs: u64) -> OffsetPtr {
        OffsetPtr::sub(&self, rhs)
    }
}

/// An atomically-accessed byte offset into an arena. Used where the offset
/// slot itself is shared-memory state mutated from multiple threads or
/// processes (e.g. a free-list head).
pub struct AtomicOffsetPtr(AtomicU64);

impl AtomicOffsetPtr {
    pub const fn null() -> Self {
        Self(AtomicU64::new(NULL_OFFSET))
    }

    pub const fn new(offset: u64) -> Self {
        Self(AtomicU64::new(offset))
    }

    pub fn load(&self, order: Ordering) -> OffsetPtr {
        OffsetPtr(self.0.load(order))
    }

    pub fn store(&self, value: OffsetPtr, order: Ordering) {
        self.0.store(value.raw(), order);
    }

    pub fn exchange(&self, value: OffsetPtr, order: Ordering) -> OffsetPtr {
        OffsetPtr(self.0.swap(value.raw(), order))
    }

    pub fn compare_exchange(
        &self,
        current: OffsetPtr,
        new: OffsetPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<OffsetPtr, OffsetPtr> {
        self.0
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .map(OffsetPtr)
            .map_err(OffsetPtr)
    }

    pub fn is_null(&self, order: Ordering) -> bool {
        self.load(order).is_null()
    }

    pub fn set_null(&self, order: Ordering) {
        self.0.store(NULL_OFFSET, order);
    }
}

impl Default for AtomicOffsetPtr {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for AtomicOffsetPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atomic{:?}", self.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_null_is_not_zero() {
        let null = OffsetPtr::null();
        let zero = OffsetPtr::new(0);
        assert_ne!(null, zero);
        assert!(null.is_null());
        assert!(!zero.is_null());
    }

    #[test]
    fn test_mark_unmark_preserves_value() {
        let p = OffsetPtr::new(4096);
        let marked = p.mark();
        assert!(marked.is_marked());
        assert_eq!(marked.value(), 4096);
        let unmarked = marked.unmark();
        assert!(!unmarked.is_marked());
        assert_eq!(unmarked, p);
    }

    #[test]
    fn test_mark_null_is_still_null() {
        let null = OffsetPtr::null();
        assert!(null.mark().is_null());
    }

    #[test]
    fn test_arithmetic_preserves_mark() {
        let p = OffsetPtr::new(100).mark();
        let moved = p + 28;
        assert!(moved.is_marked());
        assert_eq!(moved.value(), 128);
    }

    #[test]
    fn test_atomic_offset_ptr_cas() {
        let a = AtomicOffsetPtr::new(10);
        let cur = a.load(Ordering::SeqCst);
        let result = a.compare_exchange(cur, OffsetPtr::new(20), Ordering::SeqCst, Ordering::SeqCst);
        assert_eq!(result, Ok(OffsetPtr::new(10)));
        assert_eq!(a.load(Ordering::SeqCst), OffsetPtr::new(20));
    }

    #[test]
    fn test_atomic_offset_ptr_null() {
        let a = AtomicOffsetPtr::null();
        assert!(a.is_null(Ordering::SeqCst));
        a.store(OffsetPtr::new(5), Ordering::SeqCst);
        assert!(!a.is_null(Ordering::SeqCst));
        a.set_null(Ordering::SeqCst);
        assert!(a.is_null(Ordering::SeqCst));
    }
}
