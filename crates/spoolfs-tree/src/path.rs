//! Path normalization and the temporary/normal classifier.
//!
//! Paths are forward-slash-separated, case-sensitive identity keys. A path
//! is *temporary* when its final segment starts with the reserved marker
//! character; temporary paths live only in the local cache and never reach
//! the remote tree or the request queue.

/// Default reserved marker for temporary paths.
pub const DEFAULT_TEMP_MARKER: char = '.';

/// Classification of a path, evaluated once and threaded through decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Local-only path, invisible to the remote tree and the queue.
    Temporary,
    /// Ordinary path subject to remote sync.
    Normal,
}

impl PathKind {
    /// True for temporary paths.
    pub fn is_temporary(self) -> bool {
        self == PathKind::Temporary
    }
}

/// Normalize a caller-supplied path: forward slashes, single separators,
/// leading slash, no trailing slash (except the root itself).
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Classify a normalized path by its final segment.
pub fn classify(path: &str, marker: char) -> PathKind {
    if name_of(path).starts_with(marker) {
        PathKind::Temporary
    } else {
        PathKind::Normal
    }
}

/// Final segment of a normalized path; empty for the root.
pub fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Parent directory of a normalized path; the root is its own parent.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join a directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// True if `path` equals `dir` or sits anywhere below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }
    path == dir || path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/')
}
