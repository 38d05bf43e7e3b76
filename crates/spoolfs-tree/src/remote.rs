//! Remote tree interface: the canonical content and metadata source when
//! reachable.
//!
//! The core treats any `Unavailable` failure as "operate from local cache
//! only" for reads and "queue for later" for writes, never as a
//! cache-invalidating success. [`MemoryRemote`] is an in-memory
//! implementation with call counters and an optional fetch delay, used by
//! the test suites and as a reference backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

use crate::error::TreeError;
use crate::node::{FileNode, Node};
use crate::path;
use crate::util::now_ms;

/// Failures from the remote tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote tree has no such path.
    #[error("remote path not found: {path}")]
    NotFound {
        /// Missing path.
        path: String,
    },

    /// The remote tree cannot be reached at all.
    #[error("remote tree unavailable: {msg}")]
    Unavailable {
        /// Underlying failure description.
        msg: String,
    },

    /// The remote tree was reached but the operation failed.
    #[error("remote operation failed on {path}: {msg}")]
    Failed {
        /// Affected path.
        path: String,
        /// Underlying failure description.
        msg: String,
    },
}

/// Result alias for remote operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

impl From<RemoteError> for TreeError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { path } => TreeError::NotFound { path },
            RemoteError::Unavailable { msg } => TreeError::UpstreamUnavailable { msg },
            RemoteError::Failed { path, msg } => TreeError::UpstreamUnavailable {
                msg: format!("{path}: {msg}"),
            },
        }
    }
}

/// Operations the core requires from the authoritative remote tree.
#[async_trait]
pub trait RemoteTree: Send + Sync {
    /// Direct children of a directory.
    async fn list(&self, dir: &str) -> RemoteResult<Vec<Node>>;
    /// Whether a path exists.
    async fn exists(&self, p: &str) -> RemoteResult<bool>;
    /// Metadata for a single path.
    async fn open(&self, p: &str) -> RemoteResult<Node>;
    /// Full content of a file.
    async fn fetch(&self, p: &str) -> RemoteResult<Vec<u8>>;
    /// Create an empty file.
    async fn create_file(&self, p: &str) -> RemoteResult<Node>;
    /// Create a directory.
    async fn create_directory(&self, p: &str) -> RemoteResult<Node>;
    /// Delete a file.
    async fn delete(&self, p: &str) -> RemoteResult<()>;
    /// Delete a directory and its contents.
    async fn delete_directory(&self, p: &str) -> RemoteResult<()>;
    /// Rename a file or directory.
    async fn rename(&self, old: &str, new: &str) -> RemoteResult<()>;
}

#[derive(Debug, Clone)]
struct RemoteFile {
    content: Vec<u8>,
    last_modified: u64,
}

/// Snapshot of how many times each remote operation was invoked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCalls {
    /// `list` invocations.
    pub list: u64,
    /// `exists` invocations.
    pub exists: u64,
    /// `open` invocations.
    pub open: u64,
    /// `fetch` invocations.
    pub fetch: u64,
    /// `create_file` invocations.
    pub create_file: u64,
    /// `create_directory` invocations.
    pub create_directory: u64,
    /// `delete` invocations.
    pub delete: u64,
    /// `delete_directory` invocations.
    pub delete_directory: u64,
    /// `rename` invocations.
    pub rename: u64,
}

impl RemoteCalls {
    /// Total invocations across every operation.
    pub fn total(&self) -> u64 {
        self.list
            + self.exists
            + self.open
            + self.fetch
            + self.create_file
            + self.create_directory
            + self.delete
            + self.delete_directory
            + self.rename
    }
}

#[derive(Default)]
struct CallCounters {
    list: AtomicU64,
    exists: AtomicU64,
    open: AtomicU64,
    fetch: AtomicU64,
    create_file: AtomicU64,
    create_directory: AtomicU64,
    delete: AtomicU64,
    delete_directory: AtomicU64,
    rename: AtomicU64,
}

/// In-memory remote tree with call counting, an offline switch, and a
/// configurable fetch delay for concurrency tests.
#[derive(Default)]
pub struct MemoryRemote {
    files: DashMap<String, RemoteFile>,
    dirs: DashSet<String>,
    offline: AtomicBool,
    fetch_delay_ms: AtomicU64,
    calls: CallCounters,
}

impl MemoryRemote {
    /// Empty remote tree containing only the root directory.
    pub fn new() -> Self {
        let remote = Self::default();
        remote.dirs.insert("/".to_string());
        remote
    }

    /// Seed a file (content's mtime is "now").
    pub fn add_file(&self, p: &str, content: &[u8]) {
        self.add_file_with_mtime(p, content, now_ms());
    }

    /// Seed a file with an explicit modification time.
    pub fn add_file_with_mtime(&self, p: &str, content: &[u8], mtime: u64) {
        self.files.insert(
            p.to_string(),
            RemoteFile {
                content: content.to_vec(),
                last_modified: mtime,
            },
        );
        self.track_ancestors(p);
    }

    /// Seed a directory.
    pub fn add_directory(&self, p: &str) {
        self.dirs.insert(p.to_string());
        self.track_ancestors(p);
    }

    /// Remove a file without going through the tree (simulates an
    /// independent remote-side deletion).
    pub fn remove_file(&self, p: &str) {
        self.files.remove(p);
    }

    /// Remove a directory subtree without going through the tree.
    pub fn remove_directory(&self, p: &str) {
        self.files.retain(|k, _| !path::is_within(k, p));
        self.dirs.retain(|k| !path::is_within(k, p));
    }

    /// Toggle connectivity; while offline every operation fails
    /// `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every `fetch` by the given duration, to widen the window in
    /// which concurrent opens can race a download.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Snapshot of per-operation call counts.
    pub fn calls(&self) -> RemoteCalls {
        RemoteCalls {
            list: self.calls.list.load(Ordering::SeqCst),
            exists: self.calls.exists.load(Ordering::SeqCst),
            open: self.calls.open.load(Ordering::SeqCst),
            fetch: self.calls.fetch.load(Ordering::SeqCst),
            create_file: self.calls.create_file.load(Ordering::SeqCst),
            create_directory: self.calls.create_directory.load(Ordering::SeqCst),
            delete: self.calls.delete.load(Ordering::SeqCst),
            delete_directory: self.calls.delete_directory.load(Ordering::SeqCst),
            rename: self.calls.rename.load(Ordering::SeqCst),
        }
    }

    fn track_ancestors(&self, p: &str) {
        let mut dir = path::parent_of(p).to_string();
        while self.dirs.insert(dir.clone()) && dir != "/" {
            dir = path::parent_of(&dir).to_string();
        }
    }

    fn check_online(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable {
                msg: "remote offline".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn file_node(&self, p: &str, f: &RemoteFile) -> Node {
        Node::File(FileNode {
            path: p.to_string(),
            size: f.content.len() as u64,
            last_modified: f.last_modified,
            last_synced: None,
            locally_created: false,
        })
    }
}

#[async_trait]
impl RemoteTree for MemoryRemote {
    async fn list(&self, dir: &str) -> RemoteResult<Vec<Node>> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if !self.dirs.contains(dir) {
            return Err(RemoteError::NotFound {
                path: dir.to_string(),
            });
        }
        let mut out = Vec::new();
        for entry in self.files.iter() {
            if path::parent_of(entry.key()) == dir {
                out.push(self.file_node(entry.key(), entry.value()));
            }
        }
        for entry in self.dirs.iter() {
            let d = entry.key();
            if d != "/" && d != dir && path::parent_of(d) == dir {
                out.push(Node::directory(d));
            }
        }
        out.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(out)
    }

    async fn exists(&self, p: &str) -> RemoteResult<bool> {
        self.calls.exists.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.files.contains_key(p) || self.dirs.contains(p))
    }

    async fn open(&self, p: &str) -> RemoteResult<Node> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if let Some(f) = self.files.get(p) {
            return Ok(self.file_node(p, f.value()));
        }
        if self.dirs.contains(p) {
            return Ok(Node::directory(p));
        }
        Err(RemoteError::NotFound {
            path: p.to_string(),
        })
    }

    async fn fetch(&self, p: &str) -> RemoteResult<Vec<u8>> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.files
            .get(p)
            .map(|f| f.content.clone())
            .ok_or_else(|| RemoteError::NotFound {
                path: p.to_string(),
            })
    }

    async fn create_file(&self, p: &str) -> RemoteResult<Node> {
        self.calls.create_file.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.add_file_with_mtime(p, &[], now_ms());
        self.open(p).await
    }

    async fn create_directory(&self, p: &str) -> RemoteResult<Node> {
        self.calls.create_directory.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.add_directory(p);
        Ok(Node::directory(p))
    }

    async fn delete(&self, p: &str) -> RemoteResult<()> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.files
            .remove(p)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound {
                path: p.to_string(),
            })
    }

    async fn delete_directory(&self, p: &str) -> RemoteResult<()> {
        self.calls.delete_directory.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if !self.dirs.contains(p) {
            return Err(RemoteError::NotFound {
                path: p.to_string(),
            });
        }
        self.remove_directory(p);
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> RemoteResult<()> {
        self.calls.rename.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if let Some((_, f)) = self.files.remove(old) {
            self.files.insert(new.to_string(), f);
            self.track_ancestors(new);
            return Ok(());
        }
        if self.dirs.contains(old) {
            let moved: Vec<String> = self
                .files
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| path::is_within(k, old))
                .collect();
            for k in moved {
                if let Some((_, f)) = self.files.remove(&k) {
                    self.files.insert(format!("{new}{}", &k[old.len()..]), f);
                }
            }
            let moved_dirs: Vec<String> = self
                .dirs
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| path::is_within(k, old))
                .collect();
            for k in moved_dirs {
                self.dirs.remove(&k);
                self.dirs.insert(format!("{new}{}", &k[old.len()..]));
            }
            self.track_ancestors(new);
            return Ok(());
        }
        Err(RemoteError::NotFound {
            path: old.to_string(),
        })
    }
}
