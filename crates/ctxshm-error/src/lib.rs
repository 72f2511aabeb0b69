//! # ctxshm-error
//!
//! Unified error handling for the ctxshm shared-memory IPC substrate -
//! following OpenDAL's error handling practices.
//!
//! ## Design Philosophy
//!
//! - **ErrorKind**: Know what error occurred (e.g., OutOfMemory, InvalidFree)
//! - **ErrorStatus**: Decide how to handle it (Permanent, Temporary, Persistent)
//! - **Error Context**: Assist in locating the cause with rich context
//! - **Error Source**: Wrap underlying errors without leaking raw types
//!
//! ## Usage
//!
//! ```rust
//! use ctxshm_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::OutOfMemory, "arena exhausted")
//!         .with_operation("arena::allocate")
//!         .with_context("requested_bytes", "4096"))
//! }
//! ```
//!
//! ## Principles
//!
//! - All functions return `Result<T, ctxshm_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - Same error handled once, subsequent ops only append context
//! - Don't abuse `From<OtherError>` to prevent raw error leakage

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using ctxshm Error
pub type Result<T> = std::result::Result<T, Error>;
