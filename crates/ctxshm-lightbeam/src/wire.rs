//! The lightbeam wire format.
//!
//! A message on the wire is:
//!
//! ```text
//! [ u32 LE length ][ bincode-encoded WireMeta ][ per-XFER-bulk: 1 mode byte + payload ]
//! ```
//!
//! `WireMeta` carries only the size/flags half of each bulk (see
//! [`crate::bulk::BulkMeta`]); the process-local `data` pointer never
//! crosses the wire. For each `send` entry marked [`crate::bulk::BULK_XFER`],
//! a mode byte follows the metadata block, then its payload:
//!
//! - mode `1`: the bulk lives in a backend both ends have mapped. The
//!   payload is a fixed-width `ShmPtr` (`major`, `minor`, `sub_id`,
//!   `offset`, all little-endian); the peer resolves it against its own
//!   attachment of that backend instead of copying bytes.
//! - mode `0`: the bulk is private process memory (a `MallocAllocator`
//!   buffer, say). The payload is a straight byte copy, `size` bytes
//!   long. On decode it lands in the matching `recv` bulk's
//!   caller-prepared destination, or a freshly allocated one if that
//!   destination is null (see [`decode`]).

use serde::{Deserialize, Serialize};

use ctxshm_alloc::malloc;
use ctxshm_error::{Error, Result};
use ctxshm_ptr::{AllocatorId, BackendId, FullPtr, OffsetPtr, ShmPtr};

use crate::bulk::{Bulk, BulkMeta, LbmMeta, BULK_XFER};

const LENGTH_PREFIX_SIZE: usize = 4;

const MODE_INLINE: u8 = 0;
const MODE_SHM_OFFSET: u8 = 1;

/// `ShmPtr` travels as a fixed-width `major | minor | sub_id | offset`
/// quad rather than through `bincode`, so a receiver can read it off
/// the wire without a length prefix of its own.
pub(crate) const SHM_PTR_WIRE_SIZE: usize = 4 + 4 + 4 + 8;

fn encode_shm_ptr(ptr: ShmPtr) -> [u8; SHM_PTR_WIRE_SIZE] {
    let mut buf = [0u8; SHM_PTR_WIRE_SIZE];
    buf[0..4].copy_from_slice(&ptr.allocator_id.backend.major.to_le_bytes());
    buf[4..8].copy_from_slice(&ptr.allocator_id.backend.minor.to_le_bytes());
    buf[8..12].copy_from_slice(&ptr.allocator_id.sub_id.to_le_bytes());
    buf[12..20].copy_from_slice(&ptr.offset.raw().to_le_bytes());
    buf
}

fn decode_shm_ptr(bytes: &[u8]) -> ShmPtr {
    let major = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let minor = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let sub_id = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let offset = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
    ShmPtr::new(AllocatorId::new(BackendId::new(major, minor), sub_id), OffsetPtr::new(offset))
}

#[derive(Serialize, Deserialize)]
struct WireMeta {
    send: Vec<BulkMeta>,
    recv: Vec<BulkMeta>,
}

/// Whether a bulk's payload should travel as an inline byte copy or as
/// a `ShmPtr` the peer resolves itself. Exposed so transports can
/// decide which addressing a given `Bulk` supports without this crate
/// guessing from its allocator id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadMode {
    Inline,
    ShmOffset,
}

impl PayloadMode {
    /// The wire mode a bulk must use, derived from its pointer rather
    /// than asserted by a caller: a null allocator id means `data` was
    /// never carved out of a backend (e.g. a [`crate::bulk::Bulk`] built
    /// over a `MallocAllocator`-style private buffer), so there is no
    /// arena for a peer to resolve an offset against and the bytes have
    /// to travel inline. Any other allocator id names a real backend,
    /// so the cheaper [`PayloadMode::ShmOffset`] path applies.
    pub fn of(bulk: &Bulk) -> Self {
        if bulk.data.shm_ptr().allocator_id.is_null() {
            PayloadMode::Inline
        } else {
            PayloadMode::ShmOffset
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            PayloadMode::Inline => MODE_INLINE,
            PayloadMode::ShmOffset => MODE_SHM_OFFSET,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            MODE_INLINE => Ok(PayloadMode::Inline),
            MODE_SHM_OFFSET => Ok(PayloadMode::ShmOffset),
            other => Err(Error::deserialization(format!("unknown lightbeam payload mode byte {other}"))
                .with_operation("wire::PayloadMode::from_byte")),
        }
    }
}

/// Encode `meta`'s `send` bulks into a single framed message. The wire
/// mode for each `BULK_XFER` bulk is [`PayloadMode::of`]; it is not a
/// caller choice.
pub fn encode(meta: &LbmMeta) -> Result<Vec<u8>> {
    let wire_meta = WireMeta {
        send: meta.send.iter().map(BulkMeta::from).collect(),
        recv: meta.recv.iter().map(BulkMeta::from).collect(),
    };
    let meta_bytes = bincode::serialize(&wire_meta)
        .map_err(|e| Error::serialization_failed(e.to_string()).with_operation("wire::encode"))?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + meta_bytes.len());
    out.extend_from_slice(&(meta_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta_bytes);

    for bulk in meta.send.iter().filter(|b| b.flags & BULK_XFER != 0) {
        let mode = PayloadMode::of(bulk);
        out.push(mode.to_byte());
        match mode {
            PayloadMode::ShmOffset => {
                out.extend_from_slice(&encode_shm_ptr(bulk.data.shm_ptr()));
            }
            PayloadMode::Inline => {
                // SAFETY: caller guarantees `bulk.data`/`bulk.size` describe
                // a live, readable region for the duration of this call.
                let payload = unsafe { std::slice::from_raw_parts(bulk.data.raw_ptr(), bulk.size) };
                out.extend_from_slice(payload);
            }
        }
    }

    Ok(out)
}

/// The decoded metadata plus, for each `BULK_XFER` entry, either the
/// `ShmPtr` the peer should resolve or the destination the inline bytes
/// were copied into.
pub struct DecodedMessage {
    pub send: Vec<BulkMeta>,
    pub recv: Vec<BulkMeta>,
    pub xfers: Vec<XferPayload>,
}

pub enum XferPayload {
    ShmOffset(ShmPtr),
    Inline(FullPtr<u8>),
}

/// Allocate a fresh destination for an inline payload whose `recv` bulk
/// arrived with a null `data` pointer. Mirrors `MallocAllocatorSingleton`:
/// the thread reaches for the process-wide malloc-backed allocator
/// rather than a backend, since there is no backend to carve the
/// destination out of.
fn allocate_wire_destination(size: usize) -> Result<FullPtr<u8>> {
    let guard = malloc::global().lock();
    let shm_ptr = guard.allocate(size)?;
    Ok(FullPtr::from_shm_ptr(shm_ptr, &*guard))
}

/// Decode just the length-prefixed metadata block at the front of
/// `bytes`, ignoring any bulk payloads that may or may not follow it.
/// Lets a transport learn `send`/`recv` (and therefore how many xfer
/// payloads to expect) before it has read them off the wire.
pub fn decode_meta(bytes: &[u8]) -> Result<(Vec<BulkMeta>, Vec<BulkMeta>, usize)> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(Error::deserialization("buffer too short for length prefix").with_operation("wire::decode_meta"));
    }
    let meta_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let cursor = LENGTH_PREFIX_SIZE;
    if bytes.len() < cursor + meta_len {
        return Err(Error::deserialization("buffer too short for metadata block").with_operation("wire::decode_meta"));
    }
    let wire_meta: WireMeta = bincode::deserialize(&bytes[cursor..cursor + meta_len])
        .map_err(|e| Error::deserialization(e.to_string()).with_operation("wire::decode_meta"))?;
    Ok((wire_meta.send, wire_meta.recv, cursor + meta_len))
}

/// Decode one framed message from the front of `bytes`, returning the
/// decoded message and the number of bytes consumed.
///
/// `recv` is the caller's own `LbmMeta::recv` list: for each mode-0
/// (inline) payload, the next `BULK_XFER`-flagged entry of `recv`
/// supplies the destination. A null destination is filled in by
/// allocating a fresh buffer and writing its pointer back into that
/// entry; a non-null one is copied into directly. `recv` must carry at
/// least as many `BULK_XFER` entries as the decoded `send` list, one
/// per inline-or-offset payload in order.
pub fn decode(bytes: &[u8], recv: &mut [Bulk]) -> Result<(DecodedMessage, usize)> {
    let (send, recv_meta, mut cursor) = decode_meta(bytes)?;
    let wire_meta = WireMeta { send, recv: recv_meta };

    let mut recv_slots = recv.iter_mut().filter(|b| b.flags & BULK_XFER != 0);

    let mut xfers = Vec::new();
    for bulk_meta in wire_meta.send.iter().filter(|b| b.flags & BULK_XFER != 0) {
        if bytes.len() <= cursor {
            return Err(Error::deserialization("buffer truncated before bulk payload").with_operation("wire::decode"));
        }
        let mode = PayloadMode::from_byte(bytes[cursor])?;
        cursor += 1;
        match mode {
            PayloadMode::ShmOffset => {
                if bytes.len() < cursor + SHM_PTR_WIRE_SIZE {
                    return Err(Error::deserialization("buffer too short for shm pointer payload").with_operation("wire::decode"));
                }
                let shm_ptr = decode_shm_ptr(&bytes[cursor..cursor + SHM_PTR_WIRE_SIZE]);
                cursor += SHM_PTR_WIRE_SIZE;
                xfers.push(XferPayload::ShmOffset(shm_ptr));
            }
            PayloadMode::Inline => {
                if bytes.len() < cursor + bulk_meta.size {
                    return Err(Error::deserialization("buffer too short for inline payload").with_operation("wire::decode"));
                }
                let payload = &bytes[cursor..cursor + bulk_meta.size];
                cursor += bulk_meta.size;

                let slot = recv_slots.next().ok_or_else(|| {
                    Error::deserialization("recv bulk list has fewer XFER entries than the decoded message")
                        .with_operation("wire::decode")
                })?;
                let dest = if slot.data.is_null() {
                    allocate_wire_destination(bulk_meta.size)?
                } else {
                    slot.data
                };
                // SAFETY: `dest` resolves to a writable region at least
                // `bulk_meta.size` bytes long: either the caller's own
                // guarantee (pre-allocated branch) or the allocation
                // just made above.
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), dest.raw_ptr(), bulk_meta.size);
                }
                slot.data = dest;
                xfers.push(XferPayload::Inline(dest));
            }
        }
    }

    Ok((
        DecodedMessage {
            send: wire_meta.send,
            recv: wire_meta.recv,
            xfers,
        },
        cursor,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BULK_EXPOSE;
    use ctxshm_ptr::FullPtr;

    #[test]
    fn test_inline_round_trip_allocates_destination_when_recv_is_null() {
        let payload = vec![1u8, 2, 3, 4];
        let data_ptr = FullPtr::<u8>::from_offset(ctxshm_ptr::OffsetPtr::new(payload.as_ptr() as u64), &PrivateView);
        let mut meta = LbmMeta::new();
        meta.send.push(Bulk::new(data_ptr, payload.len(), BULK_XFER));

        let encoded = encode(&meta).unwrap();
        let mut recv = vec![Bulk::new(FullPtr::null(), payload.len(), BULK_XFER)];
        let (decoded, consumed) = decode(&encoded, &mut recv).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.send.len(), 1);
        match &decoded.xfers[0] {
            XferPayload::Inline(dest) => {
                assert!(!dest.is_null());
                let bytes = unsafe { std::slice::from_raw_parts(dest.raw_ptr(), payload.len()) };
                assert_eq!(bytes, &payload[..]);
            }
            _ => panic!("expected inline payload"),
        }
        assert!(!recv[0].data.is_null());
    }

    #[test]
    fn test_inline_round_trip_writes_into_preallocated_destination() {
        let payload = vec![5u8, 6, 7, 8];
        let data_ptr = FullPtr::<u8>::from_offset(ctxshm_ptr::OffsetPtr::new(payload.as_ptr() as u64), &PrivateView);
        let mut meta = LbmMeta::new();
        meta.send.push(Bulk::new(data_ptr, payload.len(), BULK_XFER));
        let encoded = encode(&meta).unwrap();

        let mut dest_buf = vec![0u8; payload.len()];
        let dest_ptr = FullPtr::<u8>::from_offset(ctxshm_ptr::OffsetPtr::new(dest_buf.as_mut_ptr() as u64), &PrivateView);
        let mut recv = vec![Bulk::new(dest_ptr, payload.len(), BULK_XFER)];
        let (_decoded, _) = decode(&encoded, &mut recv).unwrap();
        assert_eq!(dest_buf, payload);
    }

    #[test]
    fn test_expose_only_bulk_has_no_payload() {
        let mut meta = LbmMeta::new();
        meta.send.push(Bulk::new(FullPtr::null(), 64, BULK_EXPOSE));
        let encoded = encode(&meta).unwrap();
        let (decoded, consumed) = decode(&encoded, &mut []).unwrap();
        assert_eq!(consumed, encoded.len());
        assert!(decoded.xfers.is_empty());
    }

    #[test]
    fn test_shm_offset_mode_round_trips_pointer() {
        let mut meta = LbmMeta::new();
        let shm_backed = FullPtr::<u8>::from_offset(
            ctxshm_ptr::OffsetPtr::new(256),
            &BackendView,
        );
        meta.send.push(Bulk::new(shm_backed, 32, BULK_XFER));
        let encoded = encode(&meta).unwrap();
        let (decoded, _) = decode(&encoded, &mut []).unwrap();
        match &decoded.xfers[0] {
            XferPayload::ShmOffset(ptr) => assert_eq!(ptr.offset.value(), 256),
            _ => panic!("expected shm-offset payload"),
        }
    }

    #[test]
    fn test_payload_mode_of_follows_allocator_id() {
        let private = FullPtr::<u8>::from_offset(ctxshm_ptr::OffsetPtr::new(8), &PrivateView);
        let backed = FullPtr::<u8>::from_offset(ctxshm_ptr::OffsetPtr::new(8), &BackendView);
        assert_eq!(PayloadMode::of(&Bulk::new(private, 8, BULK_XFER)), PayloadMode::Inline);
        assert_eq!(PayloadMode::of(&Bulk::new(backed, 8, BULK_XFER)), PayloadMode::ShmOffset);
    }

    /// A view with a null allocator id, modeling a `MallocAllocator`-style
    /// private buffer with no backing backend.
    struct PrivateView;
    impl ctxshm_ptr::ArenaView for PrivateView {
        fn allocator_id(&self) -> ctxshm_ptr::AllocatorId {
            ctxshm_ptr::AllocatorId::null()
        }
        fn arena_base(&self) -> *mut u8 {
            std::ptr::null_mut()
        }
        fn data_range(&self) -> (*mut u8, *mut u8) {
            (std::ptr::null_mut(), usize::MAX as *mut u8)
        }
        fn resolve(&self, offset: ctxshm_ptr::OffsetPtr) -> *mut u8 {
            offset.value() as *mut u8
        }
    }

    /// A view with a real backend's allocator id, modeling a bulk whose
    /// memory was carved out of a shared backend.
    struct BackendView;
    impl ctxshm_ptr::ArenaView for BackendView {
        fn allocator_id(&self) -> ctxshm_ptr::AllocatorId {
            ctxshm_ptr::AllocatorId::primary(ctxshm_ptr::BackendId::new(1, 0))
        }
        fn arena_base(&self) -> *mut u8 {
            std::ptr::null_mut()
        }
        fn data_range(&self) -> (*mut u8, *mut u8) {
            (std::ptr::null_mut(), usize::MAX as *mut u8)
        }
        fn resolve(&self, offset: ctxshm_ptr::OffsetPtr) -> *mut u8 {
            offset.value() as *mut u8
        }
    }
}
