//! Shared fixtures for the scenario suites.
//!
//! [`TestTree`] wires a [`SpoolTree`] over an in-memory remote in a fresh
//! temp directory, and exposes the seeded remote, the conflict channel,
//! and a handful of assertion helpers the suites use everywhere.

use std::sync::Arc;

use anyhow::Context;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use spoolfs_tree::{
    MemoryRemote, Node, QueueMethod, SpoolTree, SyncConflict, TreeConfig,
};

/// Install a compact tracing subscriber once per process. Safe to call
/// from every test; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A tree over a fresh store and an in-memory remote.
pub struct TestTree {
    store: TempDir,
    /// The seeded remote backend, for out-of-band mutations and call counts.
    pub remote: Arc<MemoryRemote>,
    /// The tree under test.
    pub tree: SpoolTree,
    /// Receiving end of the tree's sync-conflict channel.
    pub conflicts: UnboundedReceiver<SyncConflict>,
}

impl TestTree {
    /// Tree over an empty remote with default configuration.
    pub fn new() -> Self {
        Self::with_remote(Arc::new(MemoryRemote::new()))
    }

    /// Tree over a pre-seeded remote.
    pub fn with_remote(remote: Arc<MemoryRemote>) -> Self {
        Self::with_config(remote, |_| {})
    }

    /// Tree with configuration tweaks (listing TTL, temp marker, ...).
    pub fn with_config(remote: Arc<MemoryRemote>, tweak: impl FnOnce(&mut TreeConfig)) -> Self {
        init_tracing();
        let store = tempfile::tempdir().expect("create store dir");
        let mut config = TreeConfig::new(store.path());
        tweak(&mut config);
        let (tree, conflicts) = SpoolTree::open_store(config, remote.clone()).expect("open tree");
        Self {
            store,
            remote,
            tree,
            conflicts,
        }
    }

    /// Drop the tree and reopen it from the same store, simulating a
    /// process restart. The conflict channel starts fresh, so conflict
    /// dedup marks from the previous instance are gone.
    pub fn reopen(self) -> Self {
        let Self {
            store,
            remote,
            tree,
            conflicts,
        } = self;
        drop(tree);
        drop(conflicts);
        let (tree, conflicts) =
            SpoolTree::open_store(TreeConfig::new(store.path()), remote.clone())
                .expect("reopen tree");
        Self {
            store,
            remote,
            tree,
            conflicts,
        }
    }

    /// Seed a remote file and pull it into the local cache, leaving it in
    /// the clean (synced) state.
    pub async fn cached_file(&self, p: &str, content: &[u8]) {
        self.remote.add_file(p, content);
        self.tree.open(p).await.expect("cache remote file");
    }

    /// The next queued conflict notification, if any arrived.
    pub fn take_conflict(&mut self) -> Option<SyncConflict> {
        self.conflicts.try_recv().ok()
    }

    /// Assert the queue holds exactly `method` for `p`.
    pub fn expect_queued(&self, p: &str, method: QueueMethod) {
        assert_eq!(
            self.tree.queue().method_for(p),
            Some(method),
            "expected {method:?} queued for {p}"
        );
    }

    /// Assert the queue holds nothing for `p`.
    pub fn expect_not_queued(&self, p: &str) {
        assert_eq!(
            self.tree.queue().method_for(p),
            None,
            "expected no queue entry for {p}"
        );
    }

    /// Parse one of the persisted store files (`request-queue.json`,
    /// `work-tree.json`, `cache-index.json`) as raw JSON.
    pub fn store_json(&self, file: &str) -> anyhow::Result<serde_json::Value> {
        let path = self.store.path().join(file);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read store file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {file}"))
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Names of the listed nodes, in listing order.
pub fn names(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| n.name().to_string()).collect()
}
