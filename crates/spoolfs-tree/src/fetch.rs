//! Fetch coordinator: at most one in-flight download per path.
//!
//! The first caller for a path runs the download; callers arriving while it
//! is active attach to its completion through a watch channel and observe
//! the same outcome, success or failure. This is what prevents an observer
//! from seeing a truncated file mid-download, and what keeps N concurrent
//! opens of the same uncached path to a single remote fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::TreeError;

/// Failure of a coordinated download, shared by every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The remote tree has no such file.
    #[error("remote path not found: {path}")]
    NotFound {
        /// Path that was missing.
        path: String,
    },
    /// The download started but could not complete.
    #[error("fetch failed for {path}: {msg}")]
    Failed {
        /// Path whose download failed.
        path: String,
        /// Underlying failure description.
        msg: String,
    },
}

impl FetchError {
    /// Build a download-failure error for a path.
    pub fn failed(path: &str, msg: impl Into<String>) -> Self {
        FetchError::Failed {
            path: path.to_string(),
            msg: msg.into(),
        }
    }
}

impl From<FetchError> for TreeError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { path } => TreeError::NotFound { path },
            FetchError::Failed { path, msg } => TreeError::UpstreamUnavailable {
                msg: format!("{path}: {msg}"),
            },
        }
    }
}

type Outcome = std::result::Result<(), FetchError>;

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Waiter(watch::Receiver<Option<Outcome>>),
}

type Registry = Mutex<HashMap<String, watch::Receiver<Option<Outcome>>>>;

/// Per-path registration of in-progress downloads.
#[derive(Default)]
pub struct FetchCoordinator {
    inflight: Registry,
}

// Clears a leader's registration even when its future is dropped
// mid-download; without this a cancelled leader would wedge the path
// for every later caller.
struct Registration<'a> {
    inflight: &'a Registry,
    path: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.path);
    }
}

impl FetchCoordinator {
    /// New coordinator with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `download` for `path`, unless a download for the same path is
    /// already active, in which case wait for it and return its outcome.
    pub async fn fetch<F, Fut>(&self, path: &str, download: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let role = {
            let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rx) = map.get(path) {
                trace!(path, "attaching to in-flight fetch");
                Role::Waiter(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                map.insert(path.to_string(), rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Leader(tx) => {
                let registration = Registration {
                    inflight: &self.inflight,
                    path,
                };
                debug!(path, "starting fetch");
                let outcome = download().await;
                drop(registration);
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
            Role::Waiter(mut rx) => {
                loop {
                    if let Some(outcome) = rx.borrow().clone() {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped without publishing; surface as failure.
                        return Err(FetchError::failed(path, "fetch aborted"));
                    }
                }
            }
        }
    }

    /// True when a download for the path is currently active.
    pub fn in_flight(&self, path: &str) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }
}
