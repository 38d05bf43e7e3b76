//! The request-queue tree: a merged view over the remote tree and the
//! local stores.
//!
//! Reads prefer the local cache and fall back to the remote tree; writes
//! land in the cache immediately and are queued for later replay against
//! the remote. Temporary paths (leading-marker final segment) never reach
//! the remote or the queue. Every operation that would discard a local
//! copy goes through the delete gate in [`crate::conflict`].

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::cache::{CacheChild, CacheStore, FileMeta};
use crate::config::TreeConfig;
use crate::conflict::{
    delete_verdict, refusal_reason, ConflictNotifier, ConflictReason, DeleteVerdict, SyncConflict,
};
use crate::error::{Result, TreeError};
use crate::fetch::{FetchCoordinator, FetchError};
use crate::listing::{ListingCache, ListingCacheStats};
use crate::node::{FileNode, Node};
use crate::path::{self, PathKind};
use crate::queue::{QueueMethod, RequestQueue};
use crate::remote::{RemoteError, RemoteTree};
use crate::util::now_ms;
use crate::worktree::{WorkEntry, WorkTree};

/// Offline-first tree over a remote backend.
///
/// All state lives in the stores under `config.store_root`; an instance
/// can be dropped and reopened without losing pending mutations.
pub struct SpoolTree {
    config: TreeConfig,
    remote: Arc<dyn RemoteTree>,
    cache: CacheStore,
    work: WorkTree,
    queue: RequestQueue,
    listings: Mutex<ListingCache>,
    fetches: FetchCoordinator,
    notifier: ConflictNotifier,
}

impl SpoolTree {
    /// Open the tree over `remote`, reloading durable state from
    /// `config.store_root`. Returns the tree and the receiving end of its
    /// sync-conflict channel.
    pub fn open_store(
        config: TreeConfig,
        remote: Arc<dyn RemoteTree>,
    ) -> Result<(Self, UnboundedReceiver<SyncConflict>)> {
        let cache = CacheStore::open(&config.store_root)?;
        let work = WorkTree::open(&config.store_root)?;
        let queue = RequestQueue::open(&config.store_root)?;
        let listings = Mutex::new(ListingCache::new(
            config.listing_capacity,
            config.listing_ttl(),
        ));
        let (notifier, conflicts) = ConflictNotifier::channel();
        debug!(root = %config.store_root.display(), "opened request-queue tree");
        let tree = Self {
            config,
            remote,
            cache,
            work,
            queue,
            listings,
            fetches: FetchCoordinator::new(),
            notifier,
        };
        Ok((tree, conflicts))
    }

    /// The pending-mutation queue, for replay by a sync processor.
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// The sync-metadata shadow tree.
    pub fn work_tree(&self) -> &WorkTree {
        &self.work
    }

    /// The local content store.
    pub fn cache_store(&self) -> &CacheStore {
        &self.cache
    }

    /// Listing-cache statistics snapshot.
    pub fn listing_stats(&self) -> ListingCacheStats {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
    }

    fn kind(&self, p: &str) -> PathKind {
        path::classify(p, self.config.temp_marker)
    }

    fn local_file_node(&self, p: &str) -> Option<Node> {
        let meta = self.cache.file_meta(p)?;
        let work = self.work.get(p);
        Some(Node::File(FileNode {
            path: p.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
            last_synced: work.and_then(|w| w.last_synced),
            locally_created: work.map(|w| w.locally_created).unwrap_or(true),
        }))
    }

    fn listing_hit(&self, dir: &str) -> Option<Vec<Node>> {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(dir)
    }

    fn listing_store(&self, dir: &str, nodes: Vec<Node>) {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dir, nodes);
    }

    fn invalidate_listing(&self, dir: &str) {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .invalidate(dir);
    }

    fn clear_listings(&self) {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether a path exists in the merged view. Temporary paths are
    /// answered from the cache alone; a pending DELETE hides the remote
    /// copy.
    pub async fn exists(&self, p: &str) -> Result<bool> {
        let p = path::normalize(p);
        if self.kind(&p).is_temporary() {
            return Ok(self.cache.contains(&p));
        }
        if self.cache.contains(&p) {
            return Ok(true);
        }
        if self.queue.is_delete_pending(&p) {
            return Ok(false);
        }
        Ok(self.remote.exists(&p).await?)
    }

    /// Open a single path in the merged view. Remote files are downloaded
    /// into the cache first, so the returned node always reflects local
    /// content.
    pub async fn open(&self, p: &str) -> Result<Node> {
        let p = path::normalize(p);
        if self.kind(&p).is_temporary() {
            if let Some(node) = self.local_file_node(&p) {
                return Ok(node);
            }
            if self.cache.contains_dir(&p) {
                return Ok(Node::directory(&p));
            }
            return Err(TreeError::not_found(&p));
        }
        if let Some(node) = self.local_file_node(&p) {
            return Ok(node);
        }
        if self.cache.contains_dir(&p) {
            return Ok(Node::directory(&p));
        }
        if self.queue.is_delete_pending(&p) {
            return Err(TreeError::not_found(&p));
        }
        let remote_node = self.remote.open(&p).await?;
        if remote_node.is_directory() {
            return Ok(remote_node);
        }
        self.ensure_cached(&p).await?;
        self.local_file_node(&p)
            .ok_or_else(|| TreeError::not_found(&p))
    }

    /// Download a remote file into the cache unless it is already there.
    /// Concurrent callers for the same path share a single download.
    async fn ensure_cached(&self, p: &str) -> Result<()> {
        if self.cache.contains_file(p) {
            return Ok(());
        }
        let outcome = self
            .fetches
            .fetch(p, || async {
                // a racing caller may have completed while we queued up
                if self.cache.contains_file(p) {
                    return Ok(());
                }
                let content = match self.remote.fetch(p).await {
                    Ok(content) => content,
                    Err(RemoteError::NotFound { path }) => {
                        return Err(FetchError::NotFound { path })
                    }
                    Err(e) => return Err(FetchError::failed(p, e.to_string())),
                };
                let now = now_ms();
                self.cache
                    .put_file(p, &content, now)
                    .map_err(|e| FetchError::failed(p, e.to_string()))?;
                self.work
                    .put(p, WorkEntry::synced_file(now))
                    .map_err(|e| FetchError::failed(p, e.to_string()))?;
                Ok(())
            })
            .await;
        outcome.map_err(TreeError::from)
    }

    /// List the merged view. A pattern ending in `/*` lists a directory's
    /// direct children; any other pattern matches a single path and yields
    /// zero or one node.
    pub async fn list(&self, pattern: &str) -> Result<Vec<Node>> {
        if pattern == "*" {
            return self.list_directory("/").await;
        }
        if let Some(dir) = pattern.strip_suffix("/*") {
            let dir = if dir.is_empty() {
                "/".to_string()
            } else {
                path::normalize(dir)
            };
            return self.list_directory(&dir).await;
        }
        self.lookup(&path::normalize(pattern)).await
    }

    async fn lookup(&self, p: &str) -> Result<Vec<Node>> {
        if self.kind(p).is_temporary() {
            if let Some(node) = self.local_file_node(p) {
                return Ok(vec![node]);
            }
            if self.cache.contains_dir(p) {
                return Ok(vec![Node::directory(p)]);
            }
            return Ok(Vec::new());
        }
        if let Some(node) = self.local_file_node(p) {
            return Ok(vec![node]);
        }
        if self.cache.contains_dir(p) {
            return Ok(vec![Node::directory(p)]);
        }
        if self.queue.is_delete_pending(p) {
            return Ok(Vec::new());
        }
        match self.remote.open(p).await {
            Ok(node) => Ok(vec![node]),
            Err(RemoteError::NotFound { .. }) => Ok(Vec::new()),
            Err(RemoteError::Unavailable { msg }) => {
                warn!(path = p, %msg, "remote unavailable; matching from cache only");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge the remote listing of a directory with the local cache,
    /// reconciling remote-side deletions along the way. Served from the
    /// listing cache within its TTL.
    async fn list_directory(&self, dir: &str) -> Result<Vec<Node>> {
        if let Some(hit) = self.listing_hit(dir) {
            return Ok(hit);
        }

        let mut remote_nodes = Vec::new();
        // when false, remote absence means "unknown", not "deleted"
        let mut remote_valid = false;
        if !self.kind(dir).is_temporary() {
            match self.remote.list(dir).await {
                Ok(nodes) => {
                    remote_nodes = nodes;
                    remote_valid = true;
                }
                Err(RemoteError::NotFound { .. }) => {
                    remote_valid = true;
                }
                Err(e) => {
                    warn!(dir, error = %e, "remote listing unavailable; serving cached view");
                }
            }
        }

        let mut merged: BTreeMap<String, Node> = BTreeMap::new();
        let mut remote_names: HashSet<String> = HashSet::new();
        for node in remote_nodes {
            // temp-classified remote entries are invisible here, same as
            // exists/open
            if self.kind(node.path()).is_temporary() {
                continue;
            }
            let name = node.name().to_string();
            remote_names.insert(name.clone());
            if !node.is_directory() && self.queue.is_delete_pending(node.path()) {
                continue;
            }
            merged.insert(name, node);
        }

        for child in self.cache.children(dir) {
            match child {
                CacheChild::File(p, meta) => {
                    let name = path::name_of(&p).to_string();
                    if self.kind(&p).is_temporary() {
                        if let Some(node) = self.local_file_node(&p) {
                            merged.insert(name, node);
                        }
                        continue;
                    }
                    let work = self.work.get(&p);
                    let in_remote = remote_names.contains(&name);
                    let keep = match work {
                        None => {
                            // cached content with no sync metadata: repair it
                            if remote_valid {
                                if in_remote {
                                    self.work
                                        .put(&p, WorkEntry::synced_file(meta.last_modified))?;
                                } else {
                                    self.work.put(&p, WorkEntry::created_file())?;
                                }
                            }
                            true
                        }
                        Some(w) if w.locally_created || w.last_synced.is_none() => true,
                        Some(w) => {
                            if in_remote || !remote_valid {
                                true
                            } else {
                                // synced before, gone remotely: propagate the
                                // deletion unless local edits would be lost
                                let verdict = delete_verdict(Some(meta), Some(w));
                                if verdict.allowed {
                                    self.cache.remove_file(&p)?;
                                    self.work.remove(&p)?;
                                    self.queue.clear(&p)?;
                                    self.notifier.reset(&p);
                                    false
                                } else {
                                    self.notifier.notify(SyncConflict {
                                        path: p.clone(),
                                        reason: ConflictReason::LocalEditsPending,
                                    });
                                    true
                                }
                            }
                        }
                    };
                    if keep {
                        if let Some(node) = self.local_file_node(&p) {
                            merged.insert(name, node);
                        }
                    } else {
                        merged.remove(&name);
                    }
                }
                CacheChild::Directory(d) => {
                    let name = path::name_of(&d).to_string();
                    if self.kind(&d).is_temporary() {
                        merged.insert(name, Node::directory(&d));
                        continue;
                    }
                    let in_remote = remote_names.contains(&name);
                    let locally_created = self
                        .work
                        .get(&d)
                        .map(|w| w.locally_created)
                        .unwrap_or(false);
                    if in_remote || !remote_valid || locally_created {
                        merged.insert(name, Node::directory(&d));
                        continue;
                    }
                    // remote removed the directory; drop the local copy
                    // unless unsynced children hold it open
                    self.purge_local_dir(&d)?;
                    if self.cache.contains_dir(&d) {
                        merged.insert(name, Node::directory(&d));
                    } else {
                        merged.remove(&name);
                        self.queue.remove_subtree(&d)?;
                    }
                }
            }
        }

        let nodes: Vec<Node> = merged.into_values().collect();
        self.listing_store(dir, nodes.clone());
        Ok(nodes)
    }

    /// Create an empty file locally; normal paths get a PUT queued for the
    /// next replay. Never calls the remote.
    pub async fn create_file(&self, p: &str) -> Result<Node> {
        let p = path::normalize(p);
        if self.cache.contains_dir(&p) {
            return Err(TreeError::bad_state(&p, "path is a directory"));
        }
        let now = now_ms();
        self.cache.put_file(&p, &[], now)?;
        if self.kind(&p).is_temporary() {
            self.work.remove(&p)?;
            self.queue.clear(&p)?;
        } else {
            self.work.put(&p, WorkEntry::created_file())?;
            self.queue.enqueue(&p, QueueMethod::Put, None, now)?;
        }
        self.invalidate_listing(path::parent_of(&p));
        self.local_file_node(&p)
            .ok_or_else(|| TreeError::not_found(&p))
    }

    /// Create a directory locally and, for normal paths, eagerly on the
    /// remote. When the remote is unreachable the directory stays local
    /// and syncs implicitly through its children.
    pub async fn create_directory(&self, p: &str) -> Result<Node> {
        let p = path::normalize(p);
        if self.cache.contains(&p) {
            return Err(TreeError::bad_state(&p, "path already exists"));
        }
        self.cache.create_dir(&p)?;
        if !self.kind(&p).is_temporary() {
            match self.remote.create_directory(&p).await {
                Ok(_) => self.work.put(&p, WorkEntry::directory(false))?,
                Err(e) => {
                    warn!(path = %p, error = %e, "remote directory create deferred");
                    self.work.put(&p, WorkEntry::directory(true))?;
                }
            }
        }
        self.invalidate_listing(path::parent_of(&p));
        Ok(Node::directory(&p))
    }

    /// Delete a file from the merged view. Local content disappears
    /// immediately; the remote copy is removed by a queued DELETE unless
    /// the file never reached the remote at all.
    pub async fn delete(&self, p: &str) -> Result<()> {
        let p = path::normalize(p);
        if self.cache.contains_dir(&p) {
            return Err(TreeError::bad_state(&p, "delete on a directory"));
        }
        let now = now_ms();
        if self.kind(&p).is_temporary() {
            if !self.cache.contains_file(&p) {
                return Err(TreeError::not_found(&p));
            }
            self.cache.remove_file(&p)?;
            self.queue.clear(&p)?;
            self.notifier.reset(&p);
            self.invalidate_listing(path::parent_of(&p));
            return Ok(());
        }
        if self.cache.contains_file(&p) {
            let never_uploaded = self
                .work
                .get(&p)
                .map(|w| w.locally_created && w.last_synced.is_none())
                .unwrap_or(false);
            self.cache.remove_file(&p)?;
            self.work.remove(&p)?;
            if never_uploaded {
                self.queue.clear(&p)?;
            } else {
                self.queue.enqueue(&p, QueueMethod::Delete, None, now)?;
            }
            self.notifier.reset(&p);
            self.invalidate_listing(path::parent_of(&p));
            return Ok(());
        }
        if self.queue.is_delete_pending(&p) {
            return Err(TreeError::not_found(&p));
        }
        match self.remote.exists(&p).await {
            Ok(true) => {}
            Ok(false) => return Err(TreeError::not_found(&p)),
            Err(RemoteError::Unavailable { msg }) => {
                warn!(path = %p, %msg, "remote unreachable; queueing delete optimistically");
            }
            Err(e) => return Err(e.into()),
        }
        self.work.remove(&p)?;
        self.queue.enqueue(&p, QueueMethod::Delete, None, now)?;
        self.invalidate_listing(path::parent_of(&p));
        Ok(())
    }

    /// Delete only the local copy of a directory subtree, leaving the
    /// remote untouched. Files with unsynced local changes are preserved
    /// (and reported); directories holding survivors stay in place. The
    /// root directory itself is never removed.
    pub fn delete_local_directory(&self, p: &str) -> Result<Vec<SyncConflict>> {
        let p = path::normalize(p);
        if !self.cache.contains_dir(&p) {
            return Err(TreeError::not_found(&p));
        }
        let conflicts = self.purge_local_dir(&p)?;
        self.clear_listings();
        Ok(conflicts)
    }

    fn purge_local_dir(&self, dir: &str) -> Result<Vec<SyncConflict>> {
        let conflicts = self.purge_local_children(dir)?;
        if dir != "/" && self.cache.is_empty_dir(dir) {
            self.cache.remove_dir(dir)?;
            self.work.remove(dir)?;
        }
        Ok(conflicts)
    }

    fn purge_local_children(&self, dir: &str) -> Result<Vec<SyncConflict>> {
        let mut conflicts = Vec::new();
        for child in self.cache.children(dir) {
            match child {
                CacheChild::File(p, meta) => {
                    if self.kind(&p).is_temporary() {
                        self.cache.remove_file(&p)?;
                        self.queue.clear(&p)?;
                        self.notifier.reset(&p);
                        continue;
                    }
                    let work = self.work.get(&p);
                    let verdict = delete_verdict(Some(meta), work);
                    if verdict.allowed {
                        self.cache.remove_file(&p)?;
                        self.work.remove(&p)?;
                        self.notifier.reset(&p);
                    } else {
                        let conflict = SyncConflict {
                            path: p.clone(),
                            reason: refusal_reason(work),
                        };
                        self.notifier.notify(conflict.clone());
                        conflicts.push(conflict);
                    }
                }
                CacheChild::Directory(d) => {
                    conflicts.extend(self.purge_local_dir(&d)?);
                }
            }
        }
        Ok(conflicts)
    }

    /// Delete a directory subtree from the merged view. The remote copy is
    /// removed only when the local purge completed without conflicts, and
    /// not at all for directories that never reached the remote.
    pub async fn delete_directory(&self, p: &str) -> Result<()> {
        let p = path::normalize(p);
        if self.cache.contains_file(&p) {
            return Err(TreeError::bad_state(&p, "delete_directory on a file"));
        }
        let is_local = self.cache.contains_dir(&p);
        if self.kind(&p).is_temporary() {
            if !is_local {
                return Err(TreeError::not_found(&p));
            }
            self.purge_local_dir(&p)?;
            self.clear_listings();
            return Ok(());
        }
        if is_local {
            // a locally created directory has no remote counterpart to delete
            let local_only = self
                .work
                .get(&p)
                .map(|w| w.locally_created)
                .unwrap_or(false);
            self.purge_local_dir(&p)?;
            let removed = !self.cache.contains_dir(&p);
            if removed {
                if local_only {
                    self.queue.remove_subtree(&p)?;
                } else {
                    match self.remote.delete_directory(&p).await {
                        Ok(()) | Err(RemoteError::NotFound { .. }) => {
                            self.queue.remove_subtree(&p)?;
                        }
                        // pending child actions stay queued for replay
                        Err(e) => {
                            warn!(path = %p, error = %e, "remote directory delete skipped");
                        }
                    }
                }
                self.work.remove_subtree(&p)?;
                self.notifier.reset_subtree(&p);
            }
            self.clear_listings();
            return Ok(());
        }
        self.remote.delete_directory(&p).await?;
        self.clear_listings();
        Ok(())
    }

    /// Rename a file or directory. Cached files move locally and the
    /// remote side follows through queued DELETE+PUT; directories rename
    /// on the remote eagerly (unless they never reached it) and all three
    /// stores move their subtrees.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = path::normalize(old);
        let new = path::normalize(new);
        if old == new {
            return Ok(());
        }
        let old_kind = self.kind(&old);
        let new_kind = self.kind(&new);

        if self.cache.contains_dir(&old) {
            if !old_kind.is_temporary() && !new_kind.is_temporary() {
                let local_only = self
                    .work
                    .get(&old)
                    .map(|w| w.locally_created)
                    .unwrap_or(false);
                if !local_only {
                    match self.remote.rename(&old, &new).await {
                        Ok(()) | Err(RemoteError::NotFound { .. }) => {}
                        Err(e) => {
                            warn!(%old, %new, error = %e, "remote directory rename deferred");
                        }
                    }
                }
            }
            self.cache.rename(&old, &new)?;
            self.work.rename(&old, &new)?;
            self.queue.rename_subtree(&old, &new)?;
            self.notifier.reset_subtree(&old);
            self.clear_listings();
            return Ok(());
        }

        if self.cache.contains_file(&old) {
            self.queue_action(&old, QueueMethod::Move, Some(&new))?;
            self.cache.rename(&old, &new)?;
            self.work.remove(&old)?;
            self.work.remove(&new)?;
            if !new_kind.is_temporary() {
                self.work.put(&new, WorkEntry::created_file())?;
            }
            self.notifier.reset(&old);
            self.notifier.reset(&new);
            self.invalidate_listing(path::parent_of(&old));
            self.invalidate_listing(path::parent_of(&new));
            return Ok(());
        }

        // nothing local: pass through to the remote
        if old_kind.is_temporary() || new_kind.is_temporary() {
            return Err(TreeError::not_found(&old));
        }
        match self.remote.rename(&old, &new).await {
            Ok(()) => {}
            Err(RemoteError::Unavailable { msg }) => {
                warn!(%old, %msg, "remote unreachable; queueing move");
                self.queue
                    .enqueue(&old, QueueMethod::Move, Some(new.clone()), now_ms())?;
            }
            Err(e) => return Err(e.into()),
        }
        self.invalidate_listing(path::parent_of(&old));
        self.invalidate_listing(path::parent_of(&new));
        Ok(())
    }

    /// Copy a file within the merged view. The destination is a fresh
    /// local creation; its upload is queued, the source's pending state is
    /// left to the transfer rules.
    pub async fn copy(&self, old: &str, new: &str) -> Result<Node> {
        let old = path::normalize(old);
        let new = path::normalize(new);
        if self.cache.contains_dir(&old) {
            return Err(TreeError::bad_state(&old, "copy on a directory"));
        }
        if self.cache.contains_dir(&new) {
            return Err(TreeError::bad_state(&new, "copy onto a directory"));
        }
        if self.kind(&old).is_temporary() {
            if !self.cache.contains_file(&old) {
                return Err(TreeError::not_found(&old));
            }
        } else {
            if self.queue.is_delete_pending(&old) {
                return Err(TreeError::not_found(&old));
            }
            self.ensure_cached(&old).await?;
        }
        let content = self.cache.read_file(&old)?;
        let now = now_ms();
        self.cache.put_file(&new, &content, now)?;
        self.work.remove(&new)?;
        if !self.kind(&new).is_temporary() {
            self.work.put(&new, WorkEntry::created_file())?;
        }
        self.queue_action(&old, QueueMethod::Copy, Some(&new))?;
        self.notifier.reset(&new);
        self.invalidate_listing(path::parent_of(&old));
        self.invalidate_listing(path::parent_of(&new));
        self.local_file_node(&new)
            .ok_or_else(|| TreeError::not_found(&new))
    }

    /// Apply the queueing decision rules for a pending action. The outcome
    /// depends on the temporary/normal classification of the endpoints,
    /// the requested method, and whether the source ever reached the
    /// remote. A copy never disturbs the source's pending state.
    pub fn queue_action(
        &self,
        p: &str,
        method: QueueMethod,
        destination: Option<&str>,
    ) -> Result<()> {
        let p = path::normalize(p);
        let now = now_ms();
        let Some(dest) = destination else {
            return match self.kind(&p) {
                PathKind::Temporary => self.queue.clear(&p),
                PathKind::Normal => self.queue.enqueue(&p, method, None, now),
            };
        };
        let dest = path::normalize(dest);
        match (self.kind(&p), self.kind(&dest)) {
            (PathKind::Temporary, PathKind::Temporary) => {
                self.queue.clear(&p)?;
                self.queue.clear(&dest)?;
            }
            (PathKind::Normal, PathKind::Temporary) => {
                // moving out of sight deletes the source from the remote,
                // but only if it ever got there; an unsent upload just
                // cancels
                if method != QueueMethod::Copy {
                    if self.ever_synced(&p) {
                        self.queue.enqueue(&p, QueueMethod::Delete, None, now)?;
                    } else {
                        self.queue.clear(&p)?;
                    }
                }
                self.queue.clear(&dest)?;
            }
            (PathKind::Temporary, PathKind::Normal) => {
                // a temporary file becomes visible: upload the destination
                self.queue.clear(&p)?;
                self.queue.enqueue(&dest, QueueMethod::Put, None, now)?;
            }
            (PathKind::Normal, PathKind::Normal) => match method {
                QueueMethod::Move => {
                    self.queue.enqueue(&p, QueueMethod::Delete, None, now)?;
                    self.queue.enqueue(&dest, QueueMethod::Put, None, now)?;
                }
                QueueMethod::Copy => {
                    self.queue.enqueue(&dest, QueueMethod::Put, None, now)?;
                }
                other => {
                    self.queue.enqueue(&p, other, Some(dest.clone()), now)?;
                }
            },
        }
        Ok(())
    }

    fn ever_synced(&self, p: &str) -> bool {
        self.work
            .get(p)
            .map(|w| w.last_synced.is_some())
            .unwrap_or(false)
    }

    async fn materialize(&self, p: &str) -> Result<()> {
        if self.kind(p).is_temporary() {
            if self.cache.contains_file(p) {
                Ok(())
            } else {
                Err(TreeError::not_found(p))
            }
        } else {
            if self.queue.is_delete_pending(p) {
                return Err(TreeError::not_found(p));
            }
            self.ensure_cached(p).await
        }
    }

    /// Read a file's full content, downloading it first when necessary.
    pub async fn read(&self, p: &str) -> Result<Vec<u8>> {
        let p = path::normalize(p);
        self.materialize(&p).await?;
        self.cache.read_file(&p)
    }

    // Edits must be observably newer than the state they modify, even
    // within one clock tick.
    fn edit_stamp(&self, p: &str) -> u64 {
        let now = now_ms();
        match self.cache.file_meta(p) {
            Some(meta) if meta.last_modified >= now => meta.last_modified + 1,
            _ => now,
        }
    }

    /// Write a range into a file. The change lands locally and, for normal
    /// paths, queues a PUT replacing any earlier pending action.
    pub async fn write(&self, p: &str, offset: u64, data: &[u8]) -> Result<FileMeta> {
        let p = path::normalize(p);
        self.materialize(&p).await?;
        let now = self.edit_stamp(&p);
        let meta = self.cache.write_at(&p, offset, data, now)?;
        if !self.kind(&p).is_temporary() {
            self.queue.enqueue(&p, QueueMethod::Put, None, now)?;
        }
        self.invalidate_listing(path::parent_of(&p));
        Ok(meta)
    }

    /// Truncate or extend a file, with the same queueing as [`Self::write`].
    pub async fn set_length(&self, p: &str, len: u64) -> Result<FileMeta> {
        let p = path::normalize(p);
        self.materialize(&p).await?;
        let now = self.edit_stamp(&p);
        let meta = self.cache.set_length(&p, len, now)?;
        if !self.kind(&p).is_temporary() {
            self.queue.enqueue(&p, QueueMethod::Put, None, now)?;
        }
        self.invalidate_listing(path::parent_of(&p));
        Ok(meta)
    }

    /// Whether a path's local copy could be discarded without losing
    /// unsynced work. Directories are always removable at this level;
    /// their children are judged individually.
    pub fn can_delete(&self, p: &str) -> DeleteVerdict {
        let p = path::normalize(p);
        if self.cache.contains_dir(&p) {
            return DeleteVerdict {
                allowed: true,
                last_synced: None,
            };
        }
        delete_verdict(self.cache.file_meta(&p), self.work.get(&p))
    }

    /// A file's `(last_synced, last_modified)` pair from the local stores.
    /// Both `None` for paths with no local state.
    pub fn file_times(&self, p: &str) -> (Option<u64>, Option<u64>) {
        let p = path::normalize(p);
        let synced = self.work.get(&p).and_then(|w| w.last_synced);
        let modified = self.cache.file_meta(&p).map(|m| m.last_modified);
        (synced, modified)
    }

    /// Record a successful upload of a path: its work entry is stamped at
    /// or after the content's modification time and any outstanding
    /// conflict mark is cleared. Called by the sync processor after
    /// replaying a queued action.
    pub fn mark_synced(&self, p: &str) -> Result<()> {
        let p = path::normalize(p);
        let at = match self.cache.file_meta(&p) {
            Some(meta) => now_ms().max(meta.last_modified),
            None => now_ms(),
        };
        self.work.mark_synced(&p, at)?;
        self.notifier.reset(&p);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use tempfile::TempDir;

    async fn setup() -> (
        TempDir,
        Arc<MemoryRemote>,
        SpoolTree,
        UnboundedReceiver<SyncConflict>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let (tree, conflicts) =
            SpoolTree::open_store(TreeConfig::new(dir.path()), remote.clone()).unwrap();
        (dir, remote, tree, conflicts)
    }

    #[tokio::test]
    async fn test_open_remote_file_fetches_once() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/doc.txt", b"data");
        let node = tree.open("/doc.txt").await.unwrap();
        assert_eq!(node.size(), 4);
        let again = tree.open("/doc.txt").await.unwrap();
        assert_eq!(again.size(), 4);
        assert_eq!(remote.calls().fetch, 1);
        assert_eq!(tree.read("/doc.txt").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_exists_hides_pending_delete() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/f", b"x");
        tree.open("/f").await.unwrap();
        tree.delete("/f").await.unwrap();
        assert!(!tree.exists("/f").await.unwrap());
        // the remote copy is still there until replay
        assert!(remote.exists("/f").await.unwrap());
        assert!(tree.queue().is_delete_pending("/f"));
    }

    #[tokio::test]
    async fn test_create_file_is_local_and_queued() {
        let (_d, remote, tree, _c) = setup().await;
        let node = tree.create_file("/new.txt").await.unwrap();
        let file = node.as_file().unwrap();
        assert!(file.locally_created);
        assert_eq!(file.last_synced, None);
        assert_eq!(tree.queue().method_for("/new.txt"), Some(QueueMethod::Put));
        assert_eq!(remote.calls().create_file, 0);
    }

    #[tokio::test]
    async fn test_temporary_file_never_reaches_remote_or_queue() {
        let (_d, remote, tree, _c) = setup().await;
        tree.create_file("/.swap").await.unwrap();
        tree.write("/.swap", 0, b"scratch").await.unwrap();
        assert!(tree.exists("/.swap").await.unwrap());
        tree.delete("/.swap").await.unwrap();
        assert!(tree.queue().is_empty());
        assert_eq!(remote.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_delete_never_uploaded_clears_queue() {
        let (_d, _remote, tree, _c) = setup().await;
        tree.create_file("/short-lived").await.unwrap();
        assert_eq!(tree.queue().len(), 1);
        tree.delete("/short-lived").await.unwrap();
        assert!(tree.queue().is_empty());
        assert!(!tree.exists("/short-lived").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_synced_file_queues_delete() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/f", b"x");
        tree.open("/f").await.unwrap();
        tree.delete("/f").await.unwrap();
        assert_eq!(tree.queue().method_for("/f"), Some(QueueMethod::Delete));
    }

    #[tokio::test]
    async fn test_list_merges_local_and_remote() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/dir/remote.txt", b"r");
        tree.create_directory("/dir").await.ok();
        tree.create_file("/dir/local.txt").await.unwrap();
        tree.create_file("/dir/.scratch").await.unwrap();
        let nodes = tree.list("/dir/*").await.unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec![".scratch", "local.txt", "remote.txt"]);
    }

    #[tokio::test]
    async fn test_listing_served_from_cache_within_ttl() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/dir/a", b"a");
        tree.list("/dir/*").await.unwrap();
        tree.list("/dir/*").await.unwrap();
        assert_eq!(remote.calls().list, 1);
        assert_eq!(tree.listing_stats().hits, 1);

        // a local mutation under the directory invalidates the entry
        tree.create_file("/dir/b").await.unwrap();
        tree.list("/dir/*").await.unwrap();
        assert_eq!(remote.calls().list, 2);
    }

    #[tokio::test]
    async fn test_list_propagates_clean_remote_deletion() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/dir/f", b"x");
        tree.open("/dir/f").await.unwrap();
        remote.remove_file("/dir/f");
        let nodes = tree.list("/dir/*").await.unwrap();
        assert!(nodes.is_empty());
        assert!(!tree.cache_store().contains_file("/dir/f"));
    }

    #[tokio::test]
    async fn test_list_preserves_locally_edited_file_and_notifies() {
        let (_d, remote, tree, mut conflicts) = setup().await;
        remote.add_file("/dir/f", b"x");
        tree.open("/dir/f").await.unwrap();
        tree.write("/dir/f", 0, b"edited").await.unwrap();
        remote.remove_file("/dir/f");
        let nodes = tree.list("/dir/*").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name(), "f");
        let conflict = conflicts.try_recv().unwrap();
        assert_eq!(conflict.path, "/dir/f");
        assert_eq!(conflict.reason, ConflictReason::LocalEditsPending);
    }

    #[tokio::test]
    async fn test_rename_local_file_queues_delete_and_put() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/a", b"x");
        tree.open("/a").await.unwrap();
        tree.rename("/a", "/b").await.unwrap();
        assert_eq!(tree.queue().method_for("/a"), Some(QueueMethod::Delete));
        assert_eq!(tree.queue().method_for("/b"), Some(QueueMethod::Put));
        assert!(tree.cache_store().contains_file("/b"));
        assert!(!tree.cache_store().contains_file("/a"));
    }

    #[tokio::test]
    async fn test_rename_to_temporary_clears_queue() {
        let (_d, _remote, tree, _c) = setup().await;
        tree.create_file("/visible").await.unwrap();
        tree.rename("/visible", "/.hidden").await.unwrap();
        assert!(tree.queue().is_empty());
        assert!(tree.cache_store().contains_file("/.hidden"));
        assert!(tree.work_tree().get("/.hidden").is_none());
    }

    #[tokio::test]
    async fn test_write_offline_queues_put() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/f", b"before");
        tree.open("/f").await.unwrap();
        remote.set_offline(true);
        tree.write("/f", 0, b"after!").await.unwrap();
        assert_eq!(tree.queue().method_for("/f"), Some(QueueMethod::Put));
        assert_eq!(tree.read("/f").await.unwrap(), b"after!");
    }

    #[tokio::test]
    async fn test_can_delete_verdicts() {
        let (_d, remote, tree, _c) = setup().await;
        remote.add_file("/clean", b"x");
        tree.open("/clean").await.unwrap();
        assert!(tree.can_delete("/clean").allowed);

        tree.create_file("/fresh").await.unwrap();
        assert!(!tree.can_delete("/fresh").allowed);

        tree.write("/clean", 0, b"y").await.unwrap();
        assert!(!tree.can_delete("/clean").allowed);
        tree.mark_synced("/clean").unwrap();
        assert!(tree.can_delete("/clean").allowed);
    }

    #[tokio::test]
    async fn test_delete_directory_preserves_conflicting_children() {
        let (_d, remote, tree, mut conflicts) = setup().await;
        remote.add_file("/dir/synced", b"x");
        tree.open("/dir/synced").await.unwrap();
        tree.create_file("/dir/unsynced").await.unwrap();
        tree.delete_directory("/dir").await.unwrap();
        assert!(tree.cache_store().contains_file("/dir/unsynced"));
        assert!(!tree.cache_store().contains_file("/dir/synced"));
        assert!(tree.cache_store().contains_dir("/dir"));
        let conflict = conflicts.try_recv().unwrap();
        assert_eq!(conflict.path, "/dir/unsynced");
        assert_eq!(conflict.reason, ConflictReason::NeverUploaded);
        // remote copy untouched while the conflict stands
        assert!(remote.exists("/dir").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_times_for_created_file() {
        let (_d, _remote, tree, _c) = setup().await;
        tree.create_file("/f").await.unwrap();
        let (synced, modified) = tree.file_times("/f");
        assert_eq!(synced, None);
        assert!(modified.is_some());
        assert_eq!(tree.file_times("/absent"), (None, None));
    }
}
