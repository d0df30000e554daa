//! `oc:share-types`: the kinds of shares that exist on a node.

use std::collections::HashMap;
use std::sync::Arc;

use oxdav_core::{
    DEFAULT_PRIORITY, DavResult, Depth, FileId, Flow, Node, PropFind, PropValue, Server,
    ServerPlugin,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SHARE_TYPES: &str = "{http://owncloud.org/ns}share-types";
pub const SHARE_TYPE: &str = "{http://owncloud.org/ns}share-type";

/// Share kinds with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    User,
    Group,
    Link,
    Email,
    Remote,
    Circle,
    Room,
}

impl ShareType {
    pub fn code(self) -> u8 {
        match self {
            ShareType::User => 0,
            ShareType::Group => 1,
            ShareType::Link => 3,
            ShareType::Email => 4,
            ShareType::Remote => 6,
            ShareType::Circle => 7,
            ShareType::Room => 10,
        }
    }
}

/// Lookup of share types by file id.
pub trait ShareBackend: Send + Sync {
    /// Share types per id. Ids without shares may be missing.
    fn share_types_for_objects(&self, ids: &[FileId]) -> DavResult<HashMap<FileId, Vec<ShareType>>>;
}

#[derive(Debug, Default)]
pub struct MemoryShares {
    shares: RwLock<HashMap<FileId, Vec<ShareType>>>,
}

impl MemoryShares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share(&self, id: FileId, kind: ShareType) {
        let mut shares = self.shares.write();
        let entry = shares.entry(id).or_default();
        if !entry.contains(&kind) {
            entry.push(kind);
        }
    }
}

impl ShareBackend for MemoryShares {
    fn share_types_for_objects(&self, ids: &[FileId]) -> DavResult<HashMap<FileId, Vec<ShareType>>> {
        let shares = self.shares.read();
        Ok(ids
            .iter()
            .filter_map(|id| shares.get(id).map(|s| (*id, s.clone())))
            .collect())
    }
}

pub struct SharesPlugin {
    backend: Arc<dyn ShareBackend>,
    cache: Mutex<HashMap<FileId, Vec<ShareType>>>,
}

impl SharesPlugin {
    pub fn new(backend: Arc<dyn ShareBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn share_types(&self, node: &Node) -> DavResult<Vec<ShareType>> {
        if let Some(types) = self.cache.lock().get(&node.id) {
            return Ok(types.clone());
        }
        let types = self
            .backend
            .share_types_for_objects(&[node.id])?
            .remove(&node.id)
            .unwrap_or_default();
        self.cache.lock().insert(node.id, types.clone());
        Ok(types)
    }

    fn preload(&self, server: &Server, node: &Node) -> DavResult<()> {
        let mut ids = vec![node.id];
        ids.extend(server.tree().get_children(&node.path)?.iter().map(|c| c.id));
        debug!(path = %node.path, count = ids.len(), "Preloading share types");

        let mut found = self.backend.share_types_for_objects(&ids)?;
        let mut cache = self.cache.lock();
        for id in ids {
            cache.insert(id, found.remove(&id).unwrap_or_default());
        }
        Ok(())
    }

    fn handle_get_properties(&self, server: &Server, propfind: &mut PropFind, node: &Node) -> DavResult<()> {
        if !propfind.is_requested(SHARE_TYPES) {
            return Ok(());
        }
        if node.is_directory() && propfind.depth() != Depth::Zero {
            self.preload(server, node)?;
        }
        propfind.try_handle_with(SHARE_TYPES, || {
            let mut types = self.share_types(node)?;
            types.sort();
            let items = types.iter().map(|t| t.code().to_string()).collect();
            Ok(Some(PropValue::list(SHARE_TYPE, items)))
        })
    }
}

impl ServerPlugin for SharesPlugin {
    fn name(&self) -> &'static str {
        "shares"
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
