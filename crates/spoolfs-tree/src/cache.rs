//! Local cache store: on-disk content blobs mirroring the remote structure,
//! plus a persistent metadata index for offline reads.
//!
//! The blob tree lives under `<root>/data`; the index
//! (`cache-index.json`) records per-file size and modification time and the
//! set of known directories so the merged view can be served without
//! touching blob files. The index is rewritten atomically (temp file then
//! rename) after every mutation.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TreeError};
use crate::path;

const INDEX_FILE: &str = "cache-index.json";
const DATA_DIR: &str = "data";

/// Per-file metadata held in the cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Content length in bytes.
    pub size: u64,
    /// Wall-clock time of the last content change (ms since epoch).
    pub last_modified: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    files: BTreeMap<String, FileMeta>,
    dirs: Vec<String>,
}

/// Child entry returned by [`CacheStore::children`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChild {
    /// Cached file with its metadata.
    File(String, FileMeta),
    /// Known directory.
    Directory(String),
}

impl CacheChild {
    /// Normalized path of the child.
    pub fn path(&self) -> &str {
        match self {
            CacheChild::File(p, _) => p,
            CacheChild::Directory(p) => p,
        }
    }
}

/// Tree of cached file content plus per-file timestamps.
pub struct CacheStore {
    data_root: PathBuf,
    index_path: PathBuf,
    files: DashMap<String, FileMeta>,
    dirs: DashSet<String>,
    save_lock: Mutex<()>,
}

impl CacheStore {
    /// Open (or create) a cache store rooted at `store_root`, reloading the
    /// index from a previous run when present.
    pub fn open(store_root: &Path) -> Result<Self> {
        let data_root = store_root.join(DATA_DIR);
        fs::create_dir_all(&data_root)?;
        let index_path = store_root.join(INDEX_FILE);

        let store = Self {
            data_root,
            index_path,
            files: DashMap::new(),
            dirs: DashSet::new(),
            save_lock: Mutex::new(()),
        };
        store.dirs.insert("/".to_string());

        if store.index_path.exists() {
            let raw = fs::read_to_string(&store.index_path)?;
            let snapshot: IndexSnapshot =
                serde_json::from_str(&raw).map_err(|e| TreeError::StoreCorrupted {
                    path: store.index_path.display().to_string(),
                    msg: e.to_string(),
                })?;
            for (p, meta) in snapshot.files {
                store.files.insert(p, meta);
            }
            for d in snapshot.dirs {
                store.dirs.insert(d);
            }
            debug!(files = store.files.len(), "reloaded cache index");
        }
        Ok(store)
    }

    fn blob_path(&self, p: &str) -> PathBuf {
        self.data_root.join(p.trim_start_matches('/'))
    }

    fn save_index(&self) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = IndexSnapshot {
            files: self
                .files
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            dirs: self.dirs.iter().map(|e| e.key().clone()).collect(),
        };
        let raw = serde_json::to_vec_pretty(&snapshot).map_err(|e| TreeError::StoreCorrupted {
            path: self.index_path.display().to_string(),
            msg: e.to_string(),
        })?;
        let tmp = self.index_path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }

    fn track_ancestors(&self, p: &str) {
        let mut dir = path::parent_of(p).to_string();
        while self.dirs.insert(dir.clone()) && dir != "/" {
            dir = path::parent_of(&dir).to_string();
        }
    }

    /// True when the path is a cached file.
    pub fn contains_file(&self, p: &str) -> bool {
        self.files.contains_key(p)
    }

    /// True when the path is a known directory.
    pub fn contains_dir(&self, p: &str) -> bool {
        self.dirs.contains(p)
    }

    /// True when the path is present as either kind.
    pub fn contains(&self, p: &str) -> bool {
        self.contains_file(p) || self.contains_dir(p)
    }

    /// Metadata for a cached file.
    pub fn file_meta(&self, p: &str) -> Option<FileMeta> {
        self.files.get(p).map(|e| *e.value())
    }

    /// Write (or replace) a cached file's full content.
    pub fn put_file(&self, p: &str, content: &[u8], mtime: u64) -> Result<FileMeta> {
        let blob = self.blob_path(p);
        if let Some(parent) = blob.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&blob, content)?;
        let meta = FileMeta {
            size: content.len() as u64,
            last_modified: mtime,
        };
        self.files.insert(p.to_string(), meta);
        self.track_ancestors(p);
        self.save_index()?;
        Ok(meta)
    }

    /// Read a cached file's content.
    pub fn read_file(&self, p: &str) -> Result<Vec<u8>> {
        if !self.contains_file(p) {
            return Err(TreeError::not_found(p));
        }
        Ok(fs::read(self.blob_path(p))?)
    }

    /// Write a range into a cached file, extending it as needed.
    pub fn write_at(&self, p: &str, offset: u64, data: &[u8], now: u64) -> Result<FileMeta> {
        let mut entry = self
            .files
            .get_mut(p)
            .ok_or_else(|| TreeError::not_found(p))?;
        let mut fh = fs::OpenOptions::new().write(true).open(self.blob_path(p))?;
        fh.seek(SeekFrom::Start(offset))?;
        fh.write_all(data)?;
        let end = offset + data.len() as u64;
        entry.size = entry.size.max(end);
        entry.last_modified = now;
        let meta = *entry;
        drop(entry);
        self.save_index()?;
        Ok(meta)
    }

    /// Truncate or extend a cached file.
    pub fn set_length(&self, p: &str, len: u64, now: u64) -> Result<FileMeta> {
        let mut entry = self
            .files
            .get_mut(p)
            .ok_or_else(|| TreeError::not_found(p))?;
        let fh = fs::OpenOptions::new().write(true).open(self.blob_path(p))?;
        fh.set_len(len)?;
        entry.size = len;
        entry.last_modified = now;
        let meta = *entry;
        drop(entry);
        self.save_index()?;
        Ok(meta)
    }

    /// Override a cached file's modification time without touching content.
    pub fn set_last_modified(&self, p: &str, mtime: u64) -> Result<()> {
        let mut entry = self
            .files
            .get_mut(p)
            .ok_or_else(|| TreeError::not_found(p))?;
        entry.last_modified = mtime;
        drop(entry);
        self.save_index()
    }

    /// Remove a cached file and its blob.
    pub fn remove_file(&self, p: &str) -> Result<()> {
        if self.files.remove(p).is_none() {
            return Err(TreeError::not_found(p));
        }
        if let Err(e) = fs::remove_file(self.blob_path(p)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = p, error = %e, "failed to remove cached blob");
            }
        }
        self.save_index()
    }

    /// Register a directory (and its ancestors).
    pub fn create_dir(&self, p: &str) -> Result<()> {
        fs::create_dir_all(self.blob_path(p))?;
        self.dirs.insert(p.to_string());
        self.track_ancestors(p);
        self.save_index()
    }

    /// Drop a directory from the cache. The caller is responsible for
    /// emptying it first.
    pub fn remove_dir(&self, p: &str) -> Result<()> {
        self.dirs.remove(p);
        let blob = self.blob_path(p);
        if blob.exists() {
            if let Err(e) = fs::remove_dir_all(&blob) {
                warn!(path = p, error = %e, "failed to remove cached directory");
            }
        }
        self.save_index()
    }

    /// Direct children of a directory, files and subdirectories.
    pub fn children(&self, dir: &str) -> Vec<CacheChild> {
        let mut out = Vec::new();
        for entry in self.files.iter() {
            if path::parent_of(entry.key()) == dir {
                out.push(CacheChild::File(entry.key().clone(), *entry.value()));
            }
        }
        for entry in self.dirs.iter() {
            let d = entry.key();
            if d != "/" && d != dir && path::parent_of(d) == dir {
                out.push(CacheChild::Directory(d.clone()));
            }
        }
        out.sort_by(|a, b| a.path().cmp(b.path()));
        out
    }

    /// True when the directory exists and has no cached children.
    pub fn is_empty_dir(&self, dir: &str) -> bool {
        self.contains_dir(dir) && self.children(dir).is_empty()
    }

    /// Rename a file or directory subtree, replacing any existing
    /// destination file.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if self.contains_file(old) {
            let meta = self
                .files
                .remove(old)
                .map(|(_, m)| m)
                .ok_or_else(|| TreeError::not_found(old))?;
            if self.contains_file(new) {
                self.files.remove(new);
                let _ = fs::remove_file(self.blob_path(new));
            }
            let dst = self.blob_path(new);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(self.blob_path(old), dst)?;
            self.files.insert(new.to_string(), meta);
            self.track_ancestors(new);
            return self.save_index();
        }
        if self.contains_dir(old) {
            let moved: Vec<String> = self
                .files
                .iter()
                .map(|e| e.key().clone())
                .filter(|p| path::is_within(p, old))
                .collect();
            for p in moved {
                if let Some((_, meta)) = self.files.remove(&p) {
                    let renamed = format!("{new}{}", &p[old.len()..]);
                    self.files.insert(renamed, meta);
                }
            }
            let moved_dirs: Vec<String> = self
                .dirs
                .iter()
                .map(|e| e.key().clone())
                .filter(|d| path::is_within(d, old))
                .collect();
            for d in moved_dirs {
                self.dirs.remove(&d);
                self.dirs.insert(format!("{new}{}", &d[old.len()..]));
            }
            let src = self.blob_path(old);
            let dst = self.blob_path(new);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            if src.exists() {
                fs::rename(src, dst)?;
            } else {
                fs::create_dir_all(dst)?;
            }
            self.track_ancestors(new);
            return self.save_index();
        }
        Err(TreeError::not_found(old))
    }
}
