//! In-memory [`Tree`] implementation.
//!
//! Used by the demo server and throughout the test suites. Paths are kept in
//! a `BTreeMap` so that descendants of a collection form one contiguous key
//! range. Storage locks live in a `DashMap` keyed by path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{DavError, DavResult};
use crate::node::{FileId, Node, NodeKind, Permissions};
use crate::path;
use crate::tree::{LockKind, Tree};

#[derive(Debug, Clone)]
enum Content {
    File {
        data: Bytes,
        content_type: String,
        checksum: String,
    },
    Directory,
}

#[derive(Debug, Clone)]
struct Entry {
    id: FileId,
    permissions: Permissions,
    etag: String,
    modified: SystemTime,
    owner: Option<String>,
    shared: bool,
    mounted: bool,
    content: Content,
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
}

/// Tree held entirely in memory.
#[derive(Debug)]
pub struct MemoryTree {
    entries: RwLock<BTreeMap<String, Entry>>,
    locks: DashMap<String, LockState>,
    next_id: AtomicU64,
    owner: Option<String>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    /// Empty tree containing only the root collection.
    pub fn new() -> Self {
        Self::with_owner(None)
    }

    /// Empty tree whose nodes are all owned by `owner`.
    pub fn with_owner(owner: Option<String>) -> Self {
        let tree = Self {
            entries: RwLock::new(BTreeMap::new()),
            locks: DashMap::new(),
            next_id: AtomicU64::new(1),
            owner,
        };
        let root = tree.new_entry(Content::Directory);
        tree.entries.write().insert(String::new(), root);
        tree
    }

    /// Create a file, creating missing parent collections.
    pub fn add_file(&self, path: &str, data: impl Into<Bytes>) -> DavResult<FileId> {
        let path = path::normalize(path)?;
        let (parent, _) = path::split(&path);
        self.add_directory(parent)?;
        self.write(&path, data.into())?;
        Ok(self.get_node_for_path(&path)?.id)
    }

    /// Create a collection and its missing parents.
    pub fn add_directory(&self, path: &str) -> DavResult<()> {
        let path = path::normalize(path)?;
        let mut entries = self.entries.write();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = path::join(&current, segment);
            match entries.get(&current) {
                Some(Entry {
                    content: Content::Directory,
                    ..
                }) => {}
                Some(_) => return Err(DavError::Conflict(format!("{current} is a file"))),
                None => {
                    let entry = self.new_entry(Content::Directory);
                    entries.insert(current.clone(), entry);
                }
            }
        }
        Ok(())
    }

    /// Replace the permission mask of a node.
    pub fn set_permissions(&self, path: &str, permissions: Permissions) -> DavResult<()> {
        self.update(path, |e| e.permissions = permissions)
    }

    /// Mark a node as shared with the user and/or living on a mount.
    pub fn set_sharing(&self, path: &str, shared: bool, mounted: bool) -> DavResult<()> {
        self.update(path, |e| {
            e.shared = shared;
            e.mounted = mounted;
        })
    }

    /// Every stored path, in order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Whether any storage lock is currently held on `path`.
    pub fn is_locked(&self, path: &str) -> bool {
        self.locks
            .get(path)
            .is_some_and(|s| s.exclusive || s.shared > 0)
    }

    fn new_entry(&self, content: Content) -> Entry {
        Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            permissions: Permissions::all(),
            etag: new_etag(),
            modified: SystemTime::now(),
            owner: self.owner.clone(),
            shared: false,
            mounted: false,
            content,
        }
    }

    fn update<F: FnOnce(&mut Entry)>(&self, path: &str, f: F) -> DavResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| DavError::NotFound(path.to_string()))?;
        f(entry);
        Ok(())
    }

    fn to_node(entries: &BTreeMap<String, Entry>, path: &str, entry: &Entry) -> Node {
        let (size, kind) = match &entry.content {
            Content::File {
                data,
                content_type,
                checksum,
            } => (
                data.len() as u64,
                NodeKind::File {
                    content_type: content_type.clone(),
                    checksum: Some(checksum.clone()),
                },
            ),
            Content::Directory => (subtree_size(entries, path), NodeKind::Directory),
        };
        Node {
            id: entry.id,
            path: path.to_string(),
            permissions: entry.permissions,
            etag: entry.etag.clone(),
            owner: entry.owner.clone(),
            size,
            modified: entry.modified,
            shared: entry.shared,
            mounted: entry.mounted,
            kind,
        }
    }

    fn require_directory(entries: &BTreeMap<String, Entry>, path: &str) -> DavResult<()> {
        match entries.get(path) {
            Some(Entry {
                content: Content::Directory,
                ..
            }) => Ok(()),
            _ => Err(DavError::Conflict(format!("Parent collection {path} does not exist"))),
        }
    }
}

impl Tree for MemoryTree {
    fn get_node_for_path(&self, path: &str) -> DavResult<Node> {
        let entries = self.entries.read();
        let entry = entries
            .get(path)
            .ok_or_else(|| DavError::NotFound(format!("File with name {path} could not be located")))?;
        Ok(Self::to_node(&entries, path, entry))
    }

    fn get_children(&self, path: &str) -> DavResult<Vec<Node>> {
        let entries = self.entries.read();
        match entries.get(path) {
            Some(Entry {
                content: Content::Directory,
                ..
            }) => {}
            Some(_) => return Err(DavError::BadRequest(format!("{path} is not a collection"))),
            None => return Err(DavError::NotFound(path.to_string())),
        }

        Ok(descendants(&entries, path)
            .filter(|(child, _)| !relative(child, path).contains('/'))
            .map(|(child, entry)| Self::to_node(&entries, child, entry))
            .collect())
    }

    fn read(&self, path: &str) -> DavResult<Bytes> {
        match self.entries.read().get(path) {
            Some(Entry {
                content: Content::File { data, .. },
                ..
            }) => Ok(data.clone()),
            Some(_) => Err(DavError::BadRequest(format!("{path} is a collection"))),
            None => Err(DavError::NotFound(path.to_string())),
        }
    }

    fn write(&self, path: &str, data: Bytes) -> DavResult<String> {
        let (parent, name) = path::split(path);
        if name.is_empty() {
            return Err(DavError::Forbidden("cannot write to the root".into()));
        }

        let mut entries = self.entries.write();
        Self::require_directory(&entries, parent)?;

        let etag = new_etag();
        let content = Content::File {
            checksum: format!("SHA256:{}", hex::encode(Sha256::digest(&data))),
            content_type: guess_content_type(name).to_string(),
            data,
        };
        match entries.get_mut(path) {
            Some(Entry {
                content: Content::Directory,
                ..
            }) => return Err(DavError::Conflict(format!("{path} is a collection"))),
            Some(existing) => {
                existing.content = content;
                existing.etag.clone_from(&etag);
                existing.modified = SystemTime::now();
            }
            None => {
                let mut entry = self.new_entry(content);
                entry.etag.clone_from(&etag);
                entries.insert(path.to_string(), entry);
            }
        }
        debug!(path, "Stored file");
        Ok(etag)
    }

    fn create_directory(&self, path: &str) -> DavResult<()> {
        let (parent, _) = path::split(path);
        let mut entries = self.entries.write();
        Self::require_directory(&entries, parent)?;
        if entries.contains_key(path) {
            return Err(DavError::MethodNotAllowed(format!("{path} already exists")));
        }
        let entry = self.new_entry(Content::Directory);
        entries.insert(path.to_string(), entry);
        Ok(())
    }

    fn delete(&self, path: &str) -> DavResult<()> {
        if path.is_empty() {
            return Err(DavError::Forbidden("cannot delete the root".into()));
        }
        let mut entries = self.entries.write();
        if entries.remove(path).is_none() {
            return Err(DavError::NotFound(path.to_string()));
        }
        let below: Vec<String> = descendants(&entries, path).map(|(p, _)| p.clone()).collect();
        for p in below {
            entries.remove(&p);
        }
        Ok(())
    }

    fn move_node(&self, source: &str, destination: &str) -> DavResult<()> {
        if path::is_within(destination, source) {
            return Err(DavError::Conflict("cannot move a node into itself".into()));
        }
        let (parent, _) = path::split(destination);
        let mut entries = self.entries.write();
        Self::require_directory(&entries, parent)?;

        let source_entry = entries
            .get(source)
            .cloned()
            .ok_or_else(|| DavError::NotFound(source.to_string()))?;

        let destination_is_file = entries
            .get(destination)
            .map(|e| matches!(e.content, Content::File { .. }));
        match destination_is_file {
            Some(true) if matches!(source_entry.content, Content::File { .. }) => {
                if let Some(existing) = entries.get_mut(destination) {
                    existing.content = source_entry.content;
                    existing.etag = new_etag();
                    existing.modified = SystemTime::now();
                }
                entries.remove(source);
                return Ok(());
            }
            Some(_) => return Err(DavError::Forbidden(format!("{destination} already exists"))),
            None => {}
        }

        let moved: Vec<String> = std::iter::once(source.to_string())
            .chain(descendants(&entries, source).map(|(p, _)| p.clone()))
            .collect();
        for old in moved {
            if let Some(entry) = entries.remove(&old) {
                let new = format!("{destination}{}", &old[source.len()..]);
                entries.insert(new, entry);
            }
        }
        Ok(())
    }

    fn copy(&self, source: &str, destination: &str) -> DavResult<()> {
        if path::is_within(destination, source) {
            return Err(DavError::Conflict("cannot copy a node into itself".into()));
        }
        let (parent, _) = path::split(destination);
        let mut entries = self.entries.write();
        Self::require_directory(&entries, parent)?;
        if entries.contains_key(destination) {
            return Err(DavError::Forbidden(format!("{destination} already exists")));
        }

        let copies: Vec<(String, Entry)> = entries
            .get(source)
            .map(|e| (source.to_string(), e.clone()))
            .into_iter()
            .chain(descendants(&entries, source).map(|(p, e)| (p.clone(), e.clone())))
            .collect();
        if copies.is_empty() {
            return Err(DavError::NotFound(source.to_string()));
        }
        for (old, mut entry) in copies {
            entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entry.etag = new_etag();
            entries.insert(format!("{destination}{}", &old[source.len()..]), entry);
        }
        Ok(())
    }

    fn touch(&self, path: &str, mtime: i64) -> DavResult<()> {
        let secs = u64::try_from(mtime).unwrap_or(0);
        self.update(path, |e| e.modified = SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    fn set_etag(&self, path: &str, etag: &str) -> DavResult<()> {
        self.update(path, |e| e.etag = etag.trim_matches('"').to_string())
    }

    fn acquire_lock(&self, path: &str, kind: LockKind) -> DavResult<()> {
        let mut state = self.locks.entry(path.to_string()).or_default();
        let available = match kind {
            LockKind::Shared => !state.exclusive,
            LockKind::Exclusive => !state.exclusive && state.shared == 0,
        };
        if !available {
            return Err(DavError::FileLocked(format!("\"{path}\" is locked")));
        }
        match kind {
            LockKind::Shared => state.shared += 1,
            LockKind::Exclusive => state.exclusive = true,
        }
        Ok(())
    }

    fn release_lock(&self, path: &str, kind: LockKind) {
        if let Some(mut state) = self.locks.get_mut(path) {
            match kind {
                LockKind::Shared => state.shared = state.shared.saturating_sub(1),
                LockKind::Exclusive => state.exclusive = false,
            }
        }
        self.locks
            .remove_if(path, |_, s| !s.exclusive && s.shared == 0);
    }
}

/// Entries strictly below `path`.
fn descendants<'a>(
    entries: &'a BTreeMap<String, Entry>,
    path: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };
    entries
        .range(prefix.clone()..)
        .take_while(move |(p, _)| p.starts_with(&prefix))
        .filter(|(p, _)| !p.is_empty())
}

fn relative<'a>(child: &'a str, parent: &str) -> &'a str {
    if parent.is_empty() {
        child
    } else {
        &child[parent.len() + 1..]
    }
}

fn subtree_size(entries: &BTreeMap<String, Entry>, path: &str) -> u64 {
    descendants(entries, path)
        .map(|(_, e)| match &e.content {
            Content::File { data, .. } => data.len() as u64,
            Content::Directory => 0,
        })
        .sum()
}

fn new_etag() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

fn guess_content_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "md") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("xml") => "application/xml",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
