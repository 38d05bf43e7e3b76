//! Tree configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::path::DEFAULT_TEMP_MARKER;

/// Configuration for a [`crate::tree::SpoolTree`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Root directory for the local stores (content blobs, work tree,
    /// request queue). Created on open if missing.
    pub store_root: PathBuf,
    /// Directory listing cache time-to-live, in milliseconds.
    pub listing_ttl_ms: u64,
    /// Maximum number of directories kept in the listing cache.
    pub listing_capacity: usize,
    /// Reserved leading character marking temporary (local-only) paths.
    pub temp_marker: char,
}

impl TreeConfig {
    /// Config rooted at the given store directory, defaults elsewhere.
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            ..Self::default()
        }
    }

    /// Listing TTL as a [`Duration`].
    pub fn listing_ttl(&self) -> Duration {
        Duration::from_millis(self.listing_ttl_ms)
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("spoolfs-store"),
            listing_ttl_ms: 30_000,
            listing_capacity: 1_000,
            temp_marker: DEFAULT_TEMP_MARKER,
        }
    }
}
