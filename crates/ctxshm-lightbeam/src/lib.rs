//! # ctxshm-lightbeam
//!
//! The bulk-transfer wire protocol layered over `ctxshm-ptr`'s pointer
//! family: [`Bulk`]/[`LbmMeta`] describe what to send, [`wire`] frames
//! it onto the network, and [`Client`]/[`Server`] are the transport
//! interfaces a concrete carrier (TCP here; RDMA a named but
//! unimplemented variant) implements.
//!
//! Metadata always crosses the wire; bulk payloads only do when a bulk
//! is marked [`BULK_XFER`] rather than [`BULK_EXPOSE`], and even then
//! only as raw bytes when the peer has no other way to reach them (see
//! [`wire::PayloadMode`]).

pub mod bulk;
pub mod transport;
pub mod wire;

pub use bulk::{Bulk, BulkMeta, LbmMeta, BULK_EXPOSE, BULK_XFER};
pub use transport::{connect, listen, Client, Server, TcpClient, TcpListenerServer, TcpServerConn, TransportKind};
pub use wire::{decode, decode_meta, encode, DecodedMessage, PayloadMode, XferPayload};
