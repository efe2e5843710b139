//! `nfs-core-alloc`: a per-thread buddy memory allocator and an RB-tree-
//! backed hash table, the two subsystems underpinning an NFS server's
//! in-process data structures.
//!
//! - [`alloc`] — [`alloc::Allocator`], the per-thread buddy allocator facade,
//!   plus its object-pool layer ([`alloc::pool`]).
//! - [`rbtree`] — the red-black tree primitive buckets are built from.
//! - [`hashtable`] — [`hashtable::HashTable`], a bucket array of red-black
//!   trees with configurable hashing/comparison and per-table statistics.

pub mod alloc;
pub mod error;
pub mod hashtable;
pub mod rbtree;

pub use alloc::config::BuddyParameter;
pub use alloc::Allocator;
pub use error::{AllocError, HashTableError, HtResult, Result};
pub use hashtable::{default_index_size, HashTable, HashTableParams, SetMode};
