//! Error types for the allocator and hash table.

use thiserror::Error;

/// Result alias for allocator operations.
pub type Result<T> = std::result::Result<T, AllocError>;

/// Errors surfaced by the buddy allocator API.
///
/// Mirrors the `BUDDY_ERR_*` codes of the original C allocator (spec §6):
/// every fallible operation records one of these in the owning context's
/// last-error slot (see [`crate::alloc::context::OwnerContext::last_error`])
/// in addition to returning it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("no such entity")]
    NoEntity,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid memory reference")]
    Fault,
    #[error("resource is still in use")]
    InUse,
    #[error("system allocator failed: {0}")]
    Malloc(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("allocator not initialized for this thread")]
    NotInit,
    #[error("allocator already initialized for this thread")]
    AlreadyInit,
}

/// Result alias for hash table operations.
pub type HtResult<T> = std::result::Result<T, HashTableError>;

/// Errors surfaced by the hash table API (spec §6).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashTableError {
    #[error("key already exists")]
    KeyAlreadyExists,
    #[error("no such key")]
    NoSuchKey,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
}
