//! Conflict detection: the single policy gate for discarding local content.
//!
//! Every destructive or overwrite path (recursive directory delete,
//! listing-driven remote-deletion propagation, rename-overwrite) must get a
//! [`DeleteVerdict`] before dropping a local copy. Refusals surface as
//! [`SyncConflict`] notifications on a process-wide observer channel and
//! are never silently dropped.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::cache::FileMeta;
use crate::node;
use crate::worktree::WorkEntry;

/// Why a destructive operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The file was modified locally after its last successful sync.
    LocalEditsPending,
    /// The file was created locally and never uploaded; deleting it would
    /// silently discard the only copy.
    NeverUploaded,
}

/// Notification that local edits and remote state diverged in a way an
/// automatic resolution would lose data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Path of the preserved local copy.
    pub path: String,
    /// Why the operation was refused.
    pub reason: ConflictReason,
}

/// Outcome of the delete gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteVerdict {
    /// True when the local copy may be discarded without losing work.
    pub allowed: bool,
    /// Last successful sync time, when known.
    pub last_synced: Option<u64>,
}

/// Decide whether a file's local copy can be discarded.
///
/// - No local cache entry: nothing local to lose, allowed.
/// - Locally created and never synced: refused.
/// - Cached content with no work metadata: treated as never-synced local
///   work, refused.
/// - Otherwise allowed iff there have been no local edits since the last
///   successful sync (`last_modified <= last_synced`; a sync confirmation
///   recorded after the edit makes the file clean again).
pub fn delete_verdict(cached: Option<FileMeta>, work: Option<WorkEntry>) -> DeleteVerdict {
    let last_synced = work.and_then(|w| w.last_synced);
    let allowed = match cached {
        None => true,
        Some(meta) => node::is_clean(meta.last_modified, last_synced),
    };
    DeleteVerdict {
        allowed,
        last_synced,
    }
}

/// Reason to report when a verdict refused deletion.
pub fn refusal_reason(work: Option<WorkEntry>) -> ConflictReason {
    match work {
        Some(w) if w.last_synced.is_some() => ConflictReason::LocalEditsPending,
        _ => ConflictReason::NeverUploaded,
    }
}

/// Process-wide sync-conflict observer hook with per-path dedup: a given
/// divergence notifies exactly once until the path is deleted, renamed
/// away, or re-synced.
pub struct ConflictNotifier {
    tx: UnboundedSender<SyncConflict>,
    notified: Mutex<HashSet<String>>,
}

impl ConflictNotifier {
    /// Build a notifier and the receiving end of its channel.
    pub fn channel() -> (Self, UnboundedReceiver<SyncConflict>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                notified: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }

    /// Emit a conflict for a path. Returns false when this path already
    /// notified for its current divergence.
    pub fn notify(&self, conflict: SyncConflict) -> bool {
        let mut seen = self.notified.lock().unwrap_or_else(|e| e.into_inner());
        if !seen.insert(conflict.path.clone()) {
            return false;
        }
        warn!(path = %conflict.path, reason = ?conflict.reason, "sync conflict");
        // Receiver may be gone; the conflict is still logged above.
        let _ = self.tx.send(conflict);
        true
    }

    /// Forget a path's dedup mark after it was deleted, renamed, or
    /// re-synced.
    pub fn reset(&self, path: &str) {
        let mut seen = self.notified.lock().unwrap_or_else(|e| e.into_inner());
        if seen.remove(path) {
            debug!(path, "conflict mark cleared");
        }
    }

    /// Forget the dedup marks of every path under a directory, the
    /// directory itself included. Used when a subtree is deleted or
    /// renamed away wholesale.
    pub fn reset_subtree(&self, dir: &str) {
        let mut seen = self.notified.lock().unwrap_or_else(|e| e.into_inner());
        let before = seen.len();
        seen.retain(|p| !crate::path::is_within(p, dir));
        if seen.len() != before {
            debug!(dir, "conflict marks cleared under subtree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::WorkKind;

    fn meta(last_modified: u64) -> FileMeta {
        FileMeta {
            size: 1,
            last_modified,
        }
    }

    fn synced(at: u64) -> WorkEntry {
        WorkEntry::synced_file(at)
    }

    #[test]
    fn test_remote_only_is_deletable() {
        let verdict = delete_verdict(None, None);
        assert!(verdict.allowed);
        assert_eq!(verdict.last_synced, None);
    }

    #[test]
    fn test_clean_file_is_deletable() {
        let verdict = delete_verdict(Some(meta(100)), Some(synced(100)));
        assert!(verdict.allowed);
        assert_eq!(verdict.last_synced, Some(100));
    }

    #[test]
    fn test_sync_confirmation_after_edit_is_clean() {
        // edit at 200, upload confirmed at 300
        let verdict = delete_verdict(Some(meta(200)), Some(synced(300)));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_locally_modified_file_is_refused() {
        let verdict = delete_verdict(Some(meta(200)), Some(synced(100)));
        assert!(!verdict.allowed);
        assert_eq!(verdict.last_synced, Some(100));
        assert_eq!(
            refusal_reason(Some(synced(100))),
            ConflictReason::LocalEditsPending
        );
    }

    #[test]
    fn test_locally_created_never_synced_is_refused() {
        let verdict = delete_verdict(Some(meta(100)), Some(WorkEntry::created_file()));
        assert!(!verdict.allowed);
        assert_eq!(verdict.last_synced, None);
        assert_eq!(
            refusal_reason(Some(WorkEntry::created_file())),
            ConflictReason::NeverUploaded
        );
    }

    #[test]
    fn test_missing_work_metadata_is_refused() {
        let verdict = delete_verdict(Some(meta(100)), None);
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_directory_entry_without_sync_behaves_like_unsynced() {
        let work = WorkEntry {
            kind: WorkKind::Directory,
            locally_created: true,
            last_synced: None,
        };
        assert!(!delete_verdict(Some(meta(1)), Some(work)).allowed);
    }

    #[tokio::test]
    async fn test_notifier_dedups_per_path_until_reset() {
        let (notifier, mut rx) = ConflictNotifier::channel();
        let conflict = SyncConflict {
            path: "/f".to_string(),
            reason: ConflictReason::LocalEditsPending,
        };
        assert!(notifier.notify(conflict.clone()));
        assert!(!notifier.notify(conflict.clone()));
        assert_eq!(rx.recv().await.unwrap().path, "/f");
        assert!(rx.try_recv().is_err());

        notifier.reset("/f");
        assert!(notifier.notify(conflict));
        assert_eq!(rx.recv().await.unwrap().path, "/f");
    }

    #[tokio::test]
    async fn test_reset_subtree_forgets_children_only() {
        let (notifier, mut rx) = ConflictNotifier::channel();
        for p in ["/dir/a", "/dir/sub/b", "/other/c"] {
            assert!(notifier.notify(SyncConflict {
                path: p.to_string(),
                reason: ConflictReason::NeverUploaded,
            }));
        }
        while rx.try_recv().is_ok() {}

        notifier.reset_subtree("/dir");
        // marks under /dir are gone, the unrelated one still dedups
        assert!(notifier.notify(SyncConflict {
            path: "/dir/sub/b".to_string(),
            reason: ConflictReason::NeverUploaded,
        }));
        assert!(!notifier.notify(SyncConflict {
            path: "/other/c".to_string(),
            reason: ConflictReason::NeverUploaded,
        }));
    }
}
