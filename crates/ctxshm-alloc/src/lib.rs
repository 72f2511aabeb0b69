//! # ctxshm-alloc
//!
//! Allocator algorithms that carve a `ctxshm-backend` data arena into
//! typed objects and variable-sized buffers:
//!
//! - [`arena::ArenaAllocator`]: monotonic bump allocator for
//!   lifetime-of-arena objects.
//! - [`buddy::BuddyAllocator`]: segregated free lists with on-demand
//!   coalescing.
//! - [`multiprocess::MultiProcessAllocator`]: the allocator request and
//!   response buffers actually come from, layering thread-local caches
//!   over a shared buddy pool.
//! - [`malloc::MallocAllocator`]: a null-backend shim over the process
//!   heap, for buffers that never need to be shared.
//!
//! [`slist`] and [`rb_tree`] are the intrusive data structures these
//! allocators are built from.

// These intrusive structures thread raw pointers through every unsafe
// fn body; each already carries a `# Safety` section at its public
// boundary, so the inner-block requirement this lint adds is noise.
#![allow(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod buddy;
pub mod malloc;
pub mod multiprocess;
pub mod rb_tree;
pub mod slist;

pub use arena::ArenaAllocator;
pub use buddy::BuddyAllocator;
pub use malloc::{malloc_allocator_id, MallocAllocator};
pub use multiprocess::{MultiProcessAllocator, TlsHandle};
pub use rb_tree::{RbNode, RbTree};
pub use slist::{Slist, SlistNode};
