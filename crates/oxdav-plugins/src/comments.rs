//! Comment counters on files: `oc:comments-count`, `oc:comments-unread` and
//! `oc:comments-href`.

use std::collections::HashMap;
use std::sync::Arc;

use oxdav_core::{
    DEFAULT_PRIORITY, DavResult, Depth, FileId, Flow, Node, PropFind, PropValue, Server,
    ServerPlugin,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

pub const COMMENTS_COUNT: &str = "{http://owncloud.org/ns}comments-count";
pub const COMMENTS_UNREAD: &str = "{http://owncloud.org/ns}comments-unread";
pub const COMMENTS_HREF: &str = "{http://owncloud.org/ns}comments-href";

pub trait CommentsBackend: Send + Sync {
    /// Number of comments per file. Ids without comments may be missing.
    fn counts_for_objects(&self, ids: &[FileId]) -> DavResult<HashMap<FileId, u64>>;

    /// Comments `uid` has not read yet, per file. Ids without unread
    /// comments may be missing.
    fn unread_for_objects(&self, ids: &[FileId], uid: &str) -> DavResult<HashMap<FileId, u64>>;
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub author: String,
    pub message: String,
}

/// Comments held in memory. A user's read marker is the number of comments
/// they had seen on the file.
#[derive(Debug, Default)]
pub struct MemoryComments {
    comments: RwLock<HashMap<FileId, Vec<Comment>>>,
    read_marks: RwLock<HashMap<(String, FileId), usize>>,
}

impl MemoryComments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: FileId, author: &str, message: &str) {
        self.comments.write().entry(id).or_default().push(Comment {
            author: author.to_string(),
            message: message.to_string(),
        });
    }

    /// Mark every current comment on `id` as read by `uid`.
    pub fn mark_read(&self, uid: &str, id: FileId) {
        let seen = self.comments.read().get(&id).map_or(0, Vec::len);
        self.read_marks.write().insert((uid.to_string(), id), seen);
    }
}

impl CommentsBackend for MemoryComments {
    fn counts_for_objects(&self, ids: &[FileId]) -> DavResult<HashMap<FileId, u64>> {
        let comments = self.comments.read();
        Ok(ids
            .iter()
            .filter_map(|id| comments.get(id).map(|c| (*id, c.len() as u64)))
            .collect())
    }

    fn unread_for_objects(&self, ids: &[FileId], uid: &str) -> DavResult<HashMap<FileId, u64>> {
        let comments = self.comments.read();
        let marks = self.read_marks.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let total = comments.get(id)?.len();
                let seen = marks.get(&(uid.to_string(), *id)).copied().unwrap_or(0);
                Some((*id, total.saturating_sub(seen) as u64))
            })
            .collect())
    }
}

pub struct CommentsPlugin {
    backend: Arc<dyn CommentsBackend>,
    count_cache: Mutex<HashMap<FileId, u64>>,
    unread_cache: Mutex<HashMap<FileId, u64>>,
}

impl CommentsPlugin {
    pub fn new(backend: Arc<dyn CommentsBackend>) -> Self {
        Self {
            backend,
            count_cache: Mutex::new(HashMap::new()),
            unread_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Absolute comments collection of a file, when the server is mounted
    /// below `remote.php`.
    pub fn comments_href(base_uri: &str, id: FileId) -> Option<String> {
        let index = base_uri.find("/remote.php/")?;
        let prefix = &base_uri[..index + "/remote.php/".len()];
        Some(format!("{prefix}dav/comments/files/{id}"))
    }

    fn count(&self, id: FileId) -> DavResult<u64> {
        if let Some(count) = self.count_cache.lock().get(&id) {
            return Ok(*count);
        }
        let count = self.backend.counts_for_objects(&[id])?.remove(&id).unwrap_or(0);
        self.count_cache.lock().insert(id, count);
        Ok(count)
    }

    fn unread_count(&self, id: FileId, uid: &str) -> DavResult<u64> {
        if let Some(count) = self.unread_cache.lock().get(&id) {
            return Ok(*count);
        }
        let count = self
            .backend
            .unread_for_objects(&[id], uid)?
            .remove(&id)
            .unwrap_or(0);
        self.unread_cache.lock().insert(id, count);
        Ok(count)
    }

    /// Fetch the requested counters for a folder and its children with one
    /// backend query each.
    fn preload(&self, server: &Server, propfind: &PropFind, node: &Node, user: Option<&str>) -> DavResult<()> {
        let mut ids = vec![node.id];
        ids.extend(server.tree().get_children(&node.path)?.iter().map(|c| c.id));
        debug!(path = %node.path, count = ids.len(), "Preloading comment counters");

        if propfind.is_requested(COMMENTS_COUNT) {
            let mut found = self.backend.counts_for_objects(&ids)?;
            let mut cache = self.count_cache.lock();
            for id in &ids {
                cache.insert(*id, found.remove(id).unwrap_or(0));
            }
        }
        if let Some(uid) = user
            && propfind.is_requested(COMMENTS_UNREAD)
        {
            let mut found = self.backend.unread_for_objects(&ids, uid)?;
            let mut cache = self.unread_cache.lock();
            for id in &ids {
                cache.insert(*id, found.remove(id).unwrap_or(0));
            }
        }
        Ok(())
    }

    fn handle_get_properties(&self, server: &Server, propfind: &mut PropFind, node: &Node) -> DavResult<()> {
        let user = server.current_user();
        if node.is_directory()
            && propfind.depth() != Depth::Zero
            && (propfind.is_requested(COMMENTS_COUNT) || propfind.is_requested(COMMENTS_UNREAD))
        {
            self.preload(server, propfind, node, user.as_deref())?;
        }

        propfind.try_handle_with(COMMENTS_COUNT, || Ok(Some(PropValue::from(self.count(node.id)?))))?;
        propfind.handle_with(COMMENTS_HREF, || {
            Self::comments_href(server.base_uri(), node.id).map(PropValue::Href)
        });
        propfind.try_handle_with(COMMENTS_UNREAD, || match &user {
            Some(uid) => Ok(Some(PropValue::from(self.unread_count(node.id, uid)?))),
            None => Ok(None),
        })
    }
}

impl ServerPlugin for CommentsPlugin {
    fn name(&self) -> &'static str {
        "comments"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        server.on("propFind", DEFAULT_PRIORITY, move |server, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                self.handle_get_properties(server, propfind, node)?;
            }
            Ok(Flow::Continue)
        });
    }
}
