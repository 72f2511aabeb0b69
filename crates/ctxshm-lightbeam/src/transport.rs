//! `Client`/`Server`: the send/receive interfaces a lightbeam transport
//! implements, plus a TCP reference transport.
//!
//! Transports only ever see [`BulkMeta`]/the framed bytes from
//! [`crate::wire`]; resolving a received `ShmPtr` back into local
//! memory is the caller's job, and this module never touches
//! `ctxshm-backend` directly. It does reach into `ctxshm-alloc` at one
//! seam: [`crate::wire::decode`] allocates an inline payload's
//! destination from the process-wide `MallocAllocator` when the caller
//! did not pre-allocate one.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use ctxshm_error::{Error, Result};

use crate::bulk::{Bulk, LbmMeta};
use crate::wire::{self, DecodedMessage};

/// Exposes local memory for a peer to either read metadata-only
/// ([`crate::bulk::BULK_EXPOSE`]) or pull/push as a transfer
/// ([`crate::bulk::BULK_XFER`]), then ships an [`LbmMeta`] and its
/// marked bulks to the peer.
pub trait Client {
    /// Describe `ptr`/`data_size` as a bulk with `flags` set. Transports
    /// that need out-of-band registration (RDMA memory regions) do it
    /// here; the reference TCP transport just records the pointer.
    fn expose(&mut self, ptr: ctxshm_ptr::FullPtr<u8>, data_size: usize, flags: u32) -> Bulk {
        Bulk::new(ptr, data_size, flags)
    }

    /// Send `meta`'s metadata and, for each `BULK_XFER` entry, its
    /// payload (wire mode derived by [`crate::wire::PayloadMode::of`]).
    fn send(&mut self, meta: &LbmMeta) -> Result<()>;
}

/// Receives metadata and bulk payloads sent by a [`Client`].
pub trait Server {
    fn expose(&mut self, ptr: ctxshm_ptr::FullPtr<u8>, data_size: usize, flags: u32) -> Bulk {
        Bulk::new(ptr, data_size, flags)
    }

    /// Block for the next framed message and decode it. Each
    /// `BULK_XFER` entry of `recv` supplies the destination for a
    /// mode-0 (inline) payload in order; a null entry gets a freshly
    /// allocated destination written back into it (see
    /// [`crate::wire::decode`]). Returns `Err(ErrorKind::Timeout)` if no
    /// message arrives before any deadline this transport enforces.
    fn recv(&mut self, recv: &mut [Bulk]) -> Result<DecodedMessage>;

    fn local_address(&self) -> String;
}

/// `Client` over a plain `TcpStream`. Grounded on the length-prefixed
/// framing in [`crate::wire`]; every call writes one complete frame.
pub struct TcpClient {
    stream: TcpStream,
}

impl TcpClient {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpClient::connect"))?;
        tracing::debug!(addr, "lightbeam TcpClient connected");
        Ok(Self { stream })
    }
}

impl Client for TcpClient {
    fn send(&mut self, meta: &LbmMeta) -> Result<()> {
        let frame = wire::encode(meta)?;
        self.stream
            .write_all(&frame)
            .map_err(|e| Error::transport_error(e.to_string()).with_operation("TcpClient::send"))
    }
}

/// `Server` over a single accepted `TcpStream`. [`TcpListenerServer`]
/// hands these out as connections arrive.
pub struct TcpServerConn {
    stream: TcpStream,
    local_addr: String,
}

impl Server for TcpServerConn {
    fn recv(&mut self, recv: &mut [Bulk]) -> Result<DecodedMessage> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpServerConn::recv"))?;
        let meta_len = u32::from_le_bytes(len_buf) as usize;

        // The length prefix only covers the metadata block; bulk
        // payloads that follow are read incrementally below, so the
        // frame buffer starts at just the prefix plus metadata.
        let mut frame = Vec::with_capacity(4 + meta_len);
        frame.extend_from_slice(&len_buf);
        frame.resize(4 + meta_len, 0);
        self.stream
            .read_exact(&mut frame[4..])
            .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpServerConn::recv"))?;

        // The frame so far only covers the metadata block; peek it to
        // learn how many xfer bulks (and of what size) to read next.
        let (send, _recv, _) = wire::decode_meta(&frame)?;
        let xfer_metas: Vec<_> = send.iter().filter(|b| b.flags & crate::bulk::BULK_XFER != 0).collect();
        if xfer_metas.is_empty() {
            let (decoded, _) = wire::decode(&frame, recv)?;
            return Ok(decoded);
        }

        let mut body = Vec::new();
        for bulk_meta in xfer_metas {
            let mut mode_byte = [0u8; 1];
            self.stream
                .read_exact(&mut mode_byte)
                .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpServerConn::recv"))?;
            body.push(mode_byte[0]);
            match mode_byte[0] {
                1 => {
                    let mut payload = [0u8; wire::SHM_PTR_WIRE_SIZE];
                    self.stream
                        .read_exact(&mut payload)
                        .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpServerConn::recv"))?;
                    body.extend_from_slice(&payload);
                }
                0 => {
                    let mut payload = vec![0u8; bulk_meta.size];
                    self.stream
                        .read_exact(&mut payload)
                        .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpServerConn::recv"))?;
                    body.extend_from_slice(&payload);
                }
                other => {
                    return Err(Error::deserialization(format!("unknown lightbeam payload mode byte {other}"))
                        .with_operation("TcpServerConn::recv"));
                }
            }
        }

        frame.extend_from_slice(&body);
        let (decoded, _) = wire::decode(&frame, recv)?;
        Ok(decoded)
    }

    fn local_address(&self) -> String {
        self.local_addr.clone()
    }
}

/// Listens on `addr` and hands out one [`TcpServerConn`] per accepted
/// connection, mirroring `TransportFactory::GetServer`.
pub struct TcpListenerServer {
    listener: TcpListener,
}

impl TcpListenerServer {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| Error::creation_failed(e.to_string()).with_operation("TcpListenerServer::bind"))?;
        tracing::debug!(addr, "lightbeam TcpListenerServer bound");
        Ok(Self { listener })
    }

    pub fn address(&self) -> Result<String> {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .map_err(|e| Error::unexpected(e.to_string()).with_operation("TcpListenerServer::address"))
    }

    /// Block until a peer connects, returning a server handle for that
    /// single connection.
    pub fn accept(&self) -> Result<TcpServerConn> {
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| Error::connection_closed(e.to_string()).with_operation("TcpListenerServer::accept"))?;
        tracing::debug!(%peer, "lightbeam TcpListenerServer accepted connection");
        Ok(TcpServerConn {
            stream,
            local_addr: peer.to_string(),
        })
    }
}

/// Transports this crate knows how to build via [`connect`]/[`listen`].
/// RDMA is named because the metadata and bulk model carries the
/// fields (`desc`/`mr`-equivalent registration) an RDMA transport would
/// need, even though no RDMA transport is implemented here; dialing or
/// listening on it reports `Unsupported`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Rdma,
}

pub fn connect(addr: &str, kind: TransportKind) -> Result<TcpClient> {
    match kind {
        TransportKind::Tcp => TcpClient::connect(addr),
        TransportKind::Rdma => Err(Error::unsupported("RDMA transport is not implemented").with_operation("connect")),
    }
}

pub fn listen(addr: &str, kind: TransportKind) -> Result<TcpListenerServer> {
    match kind {
        TransportKind::Tcp => TcpListenerServer::bind(addr),
        TransportKind::Rdma => Err(Error::unsupported("RDMA transport is not implemented").with_operation("listen")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BULK_XFER;
    use std::thread;

    #[test]
    fn test_tcp_round_trip_inline_payload() {
        let server = TcpListenerServer::bind("127.0.0.1:0").unwrap();
        let addr = server.address().unwrap();

        let handle = thread::spawn(move || {
            let mut conn = server.accept().unwrap();
            let mut recv = vec![Bulk::new(ctxshm_ptr::FullPtr::null(), 16, BULK_XFER)];
            conn.recv(&mut recv).unwrap()
        });

        let mut client = TcpClient::connect(&addr).unwrap();
        let payload = vec![9u8; 16];
        let ptr = ctxshm_ptr::FullPtr::<u8>::from_offset(ctxshm_ptr::OffsetPtr::new(payload.as_ptr() as u64), &PrivateView);
        let mut meta = LbmMeta::new();
        meta.send.push(Bulk::new(ptr, payload.len(), BULK_XFER));
        client.send(&meta).unwrap();

        let decoded = handle.join().unwrap();
        assert_eq!(decoded.send.len(), 1);
        assert_eq!(decoded.xfers.len(), 1);
    }

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
}
