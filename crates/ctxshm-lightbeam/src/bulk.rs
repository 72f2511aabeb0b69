//! `Bulk` and `LbmMeta`: the unit of data a lightbeam message transfers
//! and the metadata envelope that carries it.

use ctxshm_ptr::FullPtr;
use serde::{Deserialize, Serialize};

/// Bulk metadata is sent but no data transfer is attempted; the
/// receiver learns the sender's pointer without receiving bytes.
pub const BULK_EXPOSE: u32 = 1 << 0;
/// Bulk is marked for an actual data transmission.
pub const BULK_XFER: u32 = 1 << 1;

/// One data segment participating in a lightbeam exchange.
///
/// `data` is process-local and never serialized directly; the wire
/// codec in [`crate::wire`] either inlines a byte copy or, for
/// shared-memory-backed bulks, sends the `ShmPtr` offset so the peer
/// can resolve it against its own mapping of the same backend.
#[derive(Clone, Debug)]
pub struct Bulk {
    pub data: FullPtr<u8>,
    pub size: usize,
    pub flags: u32,
    /// Opaque transport registration handle (an RDMA memory region key,
    /// for a transport that has one). Populated by a transport's
    /// `expose`, `None` for transports with nothing to register; carried
    /// unconditionally since the wire format has a slot for it whether
    /// or not the active transport fills it in.
    pub memory_region_handle: Option<Vec<u8>>,
}

impl Bulk {
    pub fn new(data: FullPtr<u8>, size: usize, flags: u32) -> Self {
        Self { data, size, flags, memory_region_handle: None }
    }

    pub fn with_memory_region_handle(mut self, handle: Option<Vec<u8>>) -> Self {
        self.memory_region_handle = handle;
        self
    }

    pub fn is_expose(&self) -> bool {
        self.flags & BULK_EXPOSE != 0
    }

    pub fn is_xfer(&self) -> bool {
        self.flags & BULK_XFER != 0
    }
}

/// The metadata envelope carried alongside a lightbeam message:
/// sender-side bulk descriptors and, on the receiver, the matching
/// local descriptors once they are populated.
#[derive(Clone, Debug, Default)]
pub struct LbmMeta {
    pub send: Vec<Bulk>,
    pub recv: Vec<Bulk>,
}

impl LbmMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of `send` entries marked for actual transfer.
    pub fn send_bulks(&self) -> usize {
        self.send.iter().filter(|b| b.is_xfer()).count()
    }

    /// Count of `recv` entries marked for actual transfer.
    pub fn recv_bulks(&self) -> usize {
        self.recv.iter().filter(|b| b.is_xfer()).count()
    }
}

/// The wire-serializable shape of a [`Bulk`]: everything except the
/// process-local `data` pointer, which either travels as a `ShmPtr`
/// offset or is reconstructed from the inline payload on the other
/// side (see [`crate::wire`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkMeta {
    pub size: usize,
    pub flags: u32,
    pub memory_region_handle: Option<Vec<u8>>,
}

impl From<&Bulk> for BulkMeta {
    fn from(bulk: &Bulk) -> Self {
        Self {
            size: bulk.size,
            flags: bulk.flags,
            memory_region_handle: bulk.memory_region_handle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn fake_ptr() -> FullPtr<u8> {
        FullPtr::null()
    }

    #[test]
    fn test_flags_roundtrip() {
        let bulk = Bulk::new(fake_ptr(), 128, BULK_XFER);
        assert!(bulk.is_xfer());
        assert!(!bulk.is_expose());
    }

    #[test]
    fn test_meta_counts_only_xfer_bulks() {
        let mut meta = LbmMeta::new();
        meta.send.push(Bulk::new(fake_ptr(), 16, BULK_EXPOSE));
        meta.send.push(Bulk::new(fake_ptr(), 32, BULK_XFER));
        assert_eq!(meta.send_bulks(), 1);
    }
}
