//! Durable request queue: pending remote mutations awaiting replay.
//!
//! The queue holds at most one outstanding action per path; a later write
//! for the same key replaces the earlier one, and an explicit *clear*
//! cancels any pending action (used when a never-uploaded file is deleted,
//! or when a path is demoted to temporary). Entries survive process
//! restart since they represent unflushed caller intent.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TreeError};
use crate::path;

const QUEUE_FILE: &str = "request-queue.json";

/// Remote mutation kind recorded in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueMethod {
    /// Upload the path's current local content.
    Put,
    /// Delete the path on the remote tree.
    Delete,
    /// Move the path to `destination` on the remote tree.
    Move,
    /// Copy the path to `destination` on the remote tree.
    Copy,
}

/// A single pending remote mutation, keyed by `(directory, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Parent directory of the affected path.
    pub directory: String,
    /// Final path segment of the affected path.
    pub name: String,
    /// Action to replay against the remote tree.
    pub method: QueueMethod,
    /// Destination name for MOVE/COPY.
    pub destination: Option<String>,
    /// When the entry was (last) written, ms since epoch.
    pub queued_at: u64,
}

impl QueueEntry {
    /// Full normalized path of the affected file.
    pub fn path(&self) -> String {
        path::join(&self.directory, &self.name)
    }
}

/// Durable, path-keyed log of pending remote mutations.
pub struct RequestQueue {
    store_path: PathBuf,
    entries: DashMap<String, QueueEntry>,
    // saves snapshot the whole map; concurrent saves must not interleave
    // or a stale snapshot can land last
    save_lock: Mutex<()>,
}

impl RequestQueue {
    /// Open (or create) the queue under `store_root`, reloading pending
    /// entries from a previous run.
    pub fn open(store_root: &Path) -> Result<Self> {
        fs::create_dir_all(store_root)?;
        let store_path = store_root.join(QUEUE_FILE);
        let queue = Self {
            store_path,
            entries: DashMap::new(),
            save_lock: Mutex::new(()),
        };
        if queue.store_path.exists() {
            let raw = fs::read_to_string(&queue.store_path)?;
            let snapshot: BTreeMap<String, QueueEntry> =
                serde_json::from_str(&raw).map_err(|e| TreeError::StoreCorrupted {
                    path: queue.store_path.display().to_string(),
                    msg: e.to_string(),
                })?;
            for (p, entry) in snapshot {
                queue.entries.insert(p, entry);
            }
            debug!(pending = queue.entries.len(), "reloaded request queue");
        }
        Ok(queue)
    }

    fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot: BTreeMap<String, QueueEntry> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
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

    /// Record a pending action for a path, replacing any earlier entry.
    pub fn enqueue(
        &self,
        p: &str,
        method: QueueMethod,
        destination: Option<String>,
        now: u64,
    ) -> Result<()> {
        let entry = QueueEntry {
            directory: path::parent_of(p).to_string(),
            name: path::name_of(p).to_string(),
            method,
            destination,
            queued_at: now,
        };
        debug!(path = p, method = ?method, "queueing remote action");
        self.entries.insert(p.to_string(), entry);
        self.save()
    }

    /// Cancel any pending action for a path (the explicit no-op). No error
    /// when nothing was queued.
    pub fn clear(&self, p: &str) -> Result<()> {
        if self.entries.remove(p).is_some() {
            debug!(path = p, "cancelled queued action");
            self.save()?;
        }
        Ok(())
    }

    /// The pending method for a path, if any.
    pub fn method_for(&self, p: &str) -> Option<QueueMethod> {
        self.entries.get(p).map(|e| e.method)
    }

    /// The full pending entry for a path, if any.
    pub fn entry_for(&self, p: &str) -> Option<QueueEntry> {
        self.entries.get(p).map(|e| e.value().clone())
    }

    /// True when a DELETE is pending for the path, i.e. the file is gone
    /// from the merged view even if the remote still has it.
    pub fn is_delete_pending(&self, p: &str) -> bool {
        matches!(self.method_for(p), Some(QueueMethod::Delete))
    }

    /// Pending entries whose affected path sits directly in `dir`.
    pub fn entries_in(&self, dir: &str) -> Vec<QueueEntry> {
        let mut out: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().directory == dir)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Drop every pending entry at or below a directory (after the
    /// directory itself was deleted remotely).
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

    /// Rewrite pending entries under a renamed directory so replay targets
    /// the new location.
    pub fn rename_subtree(&self, old: &str, new: &str) -> Result<()> {
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
            if let Some((_, mut entry)) = self.entries.remove(&p) {
                let renamed = format!("{new}{}", &p[old.len()..]);
                entry.directory = path::parent_of(&renamed).to_string();
                entry.name = path::name_of(&renamed).to_string();
                self.entries.insert(renamed, entry);
            }
        }
        self.save()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
