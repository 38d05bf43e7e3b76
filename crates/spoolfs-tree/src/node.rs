//! Node model: the merged view's files and directories.

use serde::{Deserialize, Serialize};

use crate::path;

/// Metadata for a file in the merged namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Normalized path of the file.
    pub path: String,
    /// Content length in bytes.
    pub size: u64,
    /// Wall-clock time of the last content change (ms since epoch).
    pub last_modified: u64,
    /// Time of the last successful reconciliation with the remote tree;
    /// `None` means never synced (locally created, or remote-only).
    pub last_synced: Option<u64>,
    /// True when the file has no remote counterpart yet.
    pub locally_created: bool,
}

/// Metadata for a directory in the merged namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirNode {
    /// Normalized path of the directory.
    pub path: String,
}

/// A file or directory as seen through the request-queue tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Regular file.
    File(FileNode),
    /// Directory.
    Directory(DirNode),
}

impl Node {
    /// Build a file node.
    pub fn file(file: FileNode) -> Self {
        Node::File(file)
    }

    /// Build a directory node for the given path.
    pub fn directory(path: &str) -> Self {
        Node::Directory(DirNode {
            path: path.to_string(),
        })
    }

    /// True if this node is a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    /// Normalized path of the node.
    pub fn path(&self) -> &str {
        match self {
            Node::File(f) => &f.path,
            Node::Directory(d) => &d.path,
        }
    }

    /// Final path segment.
    pub fn name(&self) -> &str {
        path::name_of(self.path())
    }

    /// Content length; zero for directories.
    pub fn size(&self) -> u64 {
        match self {
            Node::File(f) => f.size,
            Node::Directory(_) => 0,
        }
    }

    /// Returns the inner file metadata, if this is a file.
    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }
}

/// A file is clean when it has synced and has not been edited since.
pub fn is_clean(last_modified: u64, last_synced: Option<u64>) -> bool {
    matches!(last_synced, Some(synced) if last_modified <= synced)
}
