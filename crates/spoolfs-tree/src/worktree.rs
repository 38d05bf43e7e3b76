//! Work shadow tree: per-path sync metadata tracked independently of
//! whether content is actually cached.
//!
//! This is the authoritative answer to "has this path ever been synced,
//! and when". Entries persist across restarts and across content eviction
//! so timestamp comparisons stay possible.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TreeError};
use crate::path;

const WORK_FILE: &str = "work-tree.json";

/// Kind of path a work entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// Sync metadata for a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEntry {
    /// File or directory.
    pub kind: WorkKind,
    /// True when the path was created locally and has no remote
    /// counterpart yet.
    pub locally_created: bool,
    /// Last successful reconciliation with the remote tree; `None` means
    /// never synced.
    pub last_synced: Option<u64>,
}

impl WorkEntry {
    /// Entry for a locally created file awaiting its first upload.
    pub fn created_file() -> Self {
        Self {
            kind: WorkKind::File,
            locally_created: true,
            last_synced: None,
        }
    }

    /// Entry for a file known to the remote, synced at `at`.
    pub fn synced_file(at: u64) -> Self {
        Self {
            kind: WorkKind::File,
            locally_created: false,
            last_synced: Some(at),
        }
    }

    /// Entry for a directory.
    pub fn directory(locally_created: bool) -> Self {
        Self {
            kind: WorkKind::Directory,
            locally_created,
            last_synced: None,
        }
    }
}

/// Persistent path-keyed map of [`WorkEntry`] values.
pub struct WorkTree {
    store_path: PathBuf,
    entries: DashMap<String, WorkEntry>,
    save_lock: Mutex<()>,
}

impl WorkTree {
    /// Open (or create) the work tree under `store_root`.
    pub fn open(store_root: &Path) -> Result<Self> {
        fs::create_dir_all(store_root)?;
        let store_path = store_root.join(WORK_FILE);
        let tree = Self {
            store_path,
            entries: DashMap::new(),
            save_lock: Mutex::new(()),
        };
        if tree.store_path.exists() {
            let raw = fs::read_to_string(&tree.store_path)?;
            let snapshot: BTreeMap<String, WorkEntry> =
                serde_json::from_str(&raw).map_err(|e| TreeError::StoreCorrupted {
                    path: tree.store_path.display().to_string(),
                    msg: e.to_string(),
                })?;
            for (p, entry) in snapshot {
                tree.entries.insert(p, entry);
            }
            debug!(entries = tree.entries.len(), "reloaded work tree");
        }
        Ok(tree)
    }

    fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot: BTreeMap<String, WorkEntry> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let raw = serde_json::to_vec_pretty(&snapshot).map_err(|e| TreeError::StoreCorrupted {
            path: self.store_path.display().to_string(),
            msg: e.to_string(),
        })?;
        let tmp = self.store_path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.store_path)?;
        Ok(())
    }

    /// Metadata for a path, if tracked.
    pub fn get(&self, p: &str) -> Option<WorkEntry> {
        self.entries.get(p).map(|e| *e.value())
    }

    /// True when the path is tracked.
    pub fn contains(&self, p: &str) -> bool {
        self.entries.contains_key(p)
    }

    /// Insert or replace the entry for a path.
    pub fn put(&self, p: &str, entry: WorkEntry) -> Result<()> {
        self.entries.insert(p.to_string(), entry);
        self.save()
    }

    /// Record a successful sync at `at` without touching anything else.
    /// No-op when the path is untracked.
    pub fn mark_synced(&self, p: &str, at: u64) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(p) {
            entry.last_synced = Some(at);
            entry.locally_created = false;
            drop(entry);
            self.save()?;
        }
        Ok(())
    }

    /// Remove the entry for a path. No-op when untracked.
    pub fn remove(&self, p: &str) -> Result<()> {
        if self.entries.remove(p).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Remove every entry at or below a directory.
    pub fn remove_subtree(&self, dir: &str) -> Result<()> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| path::is_within(p, dir))
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        for p in doomed {
            self.entries.remove(&p);
        }
        self.save()
    }

    /// Move an entry (or a directory's whole subtree) to a new path,
    /// replacing anything already at the destination.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let moved: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| path::is_within(p, old))
            .collect();
        if moved.is_empty() {
            return Ok(());
        }
        for p in moved {
            if let Some((_, entry)) = self.entries.remove(&p) {
                let renamed = format!("{new}{}", &p[old.len()..]);
                self.entries.insert(renamed, entry);
            }
        }
        self.save()
    }
}
