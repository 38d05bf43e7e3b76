//! Offline-first request-queue tree.
//!
//! `spoolfs-tree` merges an authoritative remote file tree with a durable
//! local cache. Reads are served locally whenever possible; writes land in
//! the cache immediately and are recorded in a persistent request queue
//! for later replay against the remote. The crate provides:
//!
//! - [`tree::SpoolTree`], the merged-view façade and its operations
//! - [`cache::CacheStore`], on-disk content blobs plus a metadata index
//! - [`queue::RequestQueue`], the durable pending-mutation queue
//! - [`worktree::WorkTree`], per-path sync metadata
//! - [`conflict`], the delete gate and sync-conflict notifications
//! - [`fetch::FetchCoordinator`], one in-flight download per path
//! - [`listing::ListingCache`], TTL-bounded merged directory listings
//! - [`remote::RemoteTree`], the trait a backend implements, with
//!   [`remote::MemoryRemote`] as the in-memory reference
//!
//! Paths whose final segment starts with the configured marker character
//! are *temporary*: they live only in the local cache and are never
//! uploaded, queued, or listed against the remote.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fetch;
pub mod listing;
pub mod node;
pub mod path;
pub mod queue;
pub mod remote;
pub mod tree;
pub mod util;
pub mod worktree;

pub use config::TreeConfig;
pub use conflict::{ConflictReason, DeleteVerdict, SyncConflict};
pub use error::{Result, TreeError};
pub use node::{DirNode, FileNode, Node};
pub use queue::{QueueEntry, QueueMethod};
pub use remote::{MemoryRemote, RemoteError, RemoteResult, RemoteTree};
pub use tree::SpoolTree;
