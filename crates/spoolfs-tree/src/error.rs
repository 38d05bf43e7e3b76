//! Error taxonomy shared by every store and the tree façade.

use thiserror::Error;

/// Errors surfaced by the request-queue tree and its stores.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Underlying filesystem failure in one of the local stores.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The path exists neither locally nor remotely (or is hidden by a
    /// pending delete).
    #[error("Path not found: {path}")]
    NotFound {
        /// Affected path.
        path: String,
    },

    /// The operation does not apply to the path's kind or current state.
    #[error("Invalid operation on {path}: {msg}")]
    BadState {
        /// Affected path.
        path: String,
        /// What was wrong.
        msg: String,
    },

    /// Completing the operation would discard unsynced local changes.
    #[error("Sync conflict on {path}: local changes would be lost")]
    Conflict {
        /// Path whose local copy was preserved.
        path: String,
    },

    /// The remote tree could not be reached or failed mid-operation.
    #[error("Remote tree unavailable: {msg}")]
    UpstreamUnavailable {
        /// Underlying failure description.
        msg: String,
    },

    /// A persisted store file failed to parse on open.
    #[error("Store corrupted at {path}: {msg}")]
    StoreCorrupted {
        /// Store file path.
        path: String,
        /// Parse failure description.
        msg: String,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

impl TreeError {
    /// Shorthand for a not-found error on the given path.
    pub fn not_found(path: &str) -> Self {
        TreeError::NotFound {
            path: path.to_string(),
        }
    }

    /// Shorthand for a bad-state error on the given path.
    pub fn bad_state(path: &str, msg: &str) -> Self {
        TreeError::BadState {
            path: path.to_string(),
            msg: msg.to_string(),
        }
    }

    /// True if this error represents a plain missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TreeError::NotFound { .. })
    }
}
