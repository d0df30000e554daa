//! Tree resolver consumed by the server and plugins.
//!
//! The tree is the storage boundary: everything below it (files, metadata
//! caches, real locking) is an external collaborator. Paths are normalized
//! tree paths as produced by [`crate::path::normalize`].

use bytes::Bytes;

use crate::error::DavResult;
use crate::node::Node;

/// Kind of file lock taken around body I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Path-addressed resource tree.
pub trait Tree: Send + Sync {
    /// Resolve a path. Fails with `NotFound` when absent.
    fn get_node_for_path(&self, path: &str) -> DavResult<Node>;

    /// Direct children of a collection, in name order.
    fn get_children(&self, path: &str) -> DavResult<Vec<Node>>;

    fn node_exists(&self, path: &str) -> bool {
        self.get_node_for_path(path).is_ok()
    }

    /// Full content of a file.
    fn read(&self, path: &str) -> DavResult<Bytes>;

    /// Create or replace a file. The parent collection must exist.
    ///
    /// Replacing keeps the file id. Returns the new etag.
    fn write(&self, path: &str, data: Bytes) -> DavResult<String>;

    /// Create a collection. The parent must exist and the path must be free.
    fn create_directory(&self, path: &str) -> DavResult<()>;

    /// Delete a node and everything below it.
    fn delete(&self, path: &str) -> DavResult<()>;

    /// Move a node. An existing file at `destination` is replaced in place
    /// (keeping its id); any other existing destination is an error.
    fn move_node(&self, source: &str, destination: &str) -> DavResult<()>;

    /// Recursively copy a node to a free destination.
    fn copy(&self, source: &str, destination: &str) -> DavResult<()>;

    /// Set the modification time (seconds since the epoch).
    fn touch(&self, path: &str, mtime: i64) -> DavResult<()>;

    /// Override the stored etag.
    fn set_etag(&self, path: &str, etag: &str) -> DavResult<()>;

    /// Acquire a storage lock. Fails with `FileLocked` on contention.
    fn acquire_lock(&self, _path: &str, _kind: LockKind) -> DavResult<()> {
        Ok(())
    }

    /// Release a lock taken with [`Tree::acquire_lock`].
    fn release_lock(&self, _path: &str, _kind: LockKind) {}
}

/// Scoped storage lock. Released when dropped, on every exit path.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    tree: &'a dyn Tree,
    path: String,
    kind: LockKind,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(tree: &'a dyn Tree, path: &str, kind: LockKind) -> DavResult<Self> {
        tree.acquire_lock(path, kind)?;
        Ok(Self {
            tree,
            path: path.to_string(),
            kind,
        })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.tree.release_lock(&self.path, self.kind);
    }
}
