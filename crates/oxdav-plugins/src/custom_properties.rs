//! Dead properties: arbitrary client-defined properties stored per user and
//! path.
//!
//! Runs after the plugins serving live properties so that it only fills in
//! what is still missing, and claims every PROPPATCH mutation nobody else
//! wanted. Stored properties follow their resource on MOVE and disappear
//! with it on DELETE.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use oxdav_core::{
    DavResult, Depth, Event, Flow, Mutation, Node, PatchOutcome, PropFind, PropPatch, PropValue,
    Server, ServerPlugin, path,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Live properties that are never read from the store even when a client
/// managed to write them.
pub const IGNORED_PROPERTIES: &[&str] = &[
    "{DAV:}getcontentlength",
    "{DAV:}getcontenttype",
    "{DAV:}getetag",
    "{DAV:}quota-used-bytes",
    "{DAV:}quota-available-bytes",
    "{http://owncloud.org/ns}permissions",
    "{http://owncloud.org/ns}downloadURL",
    "{http://owncloud.org/ns}dDC",
    "{http://owncloud.org/ns}size",
    "{http://nextcloud.org/ns}is-encrypted",
];

pub type StoredProperties = Vec<(String, PropValue)>;

/// Persistence of dead properties.
pub trait PropertyStore: Send + Sync {
    fn properties(&self, user: &str, path: &str) -> DavResult<StoredProperties>;

    /// Properties of `path` and its direct children, keyed by path.
    fn properties_below(&self, user: &str, path: &str) -> DavResult<HashMap<String, StoredProperties>>;

    /// Apply mutations: `Some` sets, `None` removes.
    fn update(&self, user: &str, path: &str, mutations: &[Mutation]) -> DavResult<()>;

    /// Forget `path` and everything below it.
    fn delete_path(&self, user: &str, path: &str) -> DavResult<()>;

    /// Re-key `source` and everything below it to `destination`.
    fn move_path(&self, user: &str, source: &str, destination: &str) -> DavResult<()>;
}

/// Property store held in memory: user -> path -> properties.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    users: RwLock<HashMap<String, BTreeMap<String, StoredProperties>>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn properties(&self, user: &str, path: &str) -> DavResult<StoredProperties> {
        Ok(self
            .users
            .read()
            .get(user)
            .and_then(|paths| paths.get(path))
            .cloned()
            .unwrap_or_default())
    }

    fn properties_below(&self, user: &str, path: &str) -> DavResult<HashMap<String, StoredProperties>> {
        let users = self.users.read();
        let Some(paths) = users.get(user) else {
            return Ok(HashMap::new());
        };
        Ok(paths
            .iter()
            .filter(|(p, _)| p.as_str() == path || (!p.is_empty() && path::split(p).0 == path))
            .map(|(p, props)| (p.clone(), props.clone()))
            .collect())
    }

    fn update(&self, user: &str, path: &str, mutations: &[Mutation]) -> DavResult<()> {
        let mut users = self.users.write();
        let props = users
            .entry(user.to_string())
            .or_default()
            .entry(path.to_string())
            .or_default();
        for (name, value) in mutations {
            match value {
                Some(value) => match props.iter_mut().find(|(n, _)| n == name) {
                    Some(entry) => entry.1 = value.clone(),
                    None => props.push((name.clone(), value.clone())),
                },
                None => props.retain(|(n, _)| n != name),
            }
        }
        Ok(())
    }

    fn delete_path(&self, user: &str, path: &str) -> DavResult<()> {
        if let Some(paths) = self.users.write().get_mut(user) {
            paths.retain(|p, _| !path::is_within(p, path));
        }
        Ok(())
    }

    fn move_path(&self, user: &str, source: &str, destination: &str) -> DavResult<()> {
        let mut users = self.users.write();
        let Some(paths) = users.get_mut(user) else {
            return Ok(());
        };
        let moved: Vec<String> = paths
            .keys()
            .filter(|p| path::is_within(p, source))
            .cloned()
            .collect();
        for old in moved {
            if let Some(props) = paths.remove(&old) {
                let new = format!("{destination}{}", &old[source.len()..]);
                paths.insert(new, props);
            }
        }
        Ok(())
    }
}

pub struct CustomPropertiesPlugin {
    store: Arc<dyn PropertyStore>,
    cache: Mutex<HashMap<String, StoredProperties>>,
}

impl CustomPropertiesPlugin {
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn user(server: &Server) -> String {
        server.current_user().unwrap_or_default()
    }

    fn stored(&self, user: &str, path: &str) -> DavResult<StoredProperties> {
        if let Some(props) = self.cache.lock().get(path) {
            return Ok(props.clone());
        }
        self.store.properties(user, path)
    }

    fn handle_get_properties(&self, server: &Server, propfind: &mut PropFind, node: &Node) -> DavResult<()> {
        if !propfind.is_all_props() {
            let wanted = propfind
                .get_404_properties()
                .into_iter()
                .any(|name| !IGNORED_PROPERTIES.contains(&name.as_str()));
            if !wanted {
                return Ok(());
            }
        }

        let user = Self::user(server);
        if node.is_directory() && propfind.depth() != Depth::Zero {
            let mut below = self.store.properties_below(&user, &node.path)?;
            let children = server.tree().get_children(&node.path)?;
            let mut cache = self.cache.lock();
            for child in children {
                let props = below.remove(&child.path).unwrap_or_default();
                cache.insert(child.path, props);
            }
            cache.insert(node.path.clone(), below.remove(&node.path).unwrap_or_default());
        }

        for (name, value) in self.stored(&user, &node.path)? {
            if IGNORED_PROPERTIES.contains(&name.as_str()) {
                continue;
            }
            propfind.handle(&name, value);
        }
        Ok(())
    }

    fn handle_update_properties(&self, server: &Server, path: &str, proppatch: &mut PropPatch) {
        let store = Arc::clone(&self.store);
        let user = Self::user(server);
        let path = path.to_string();
        self.cache.lock().remove(&path);
        proppatch.handle_remaining(move |mutations| {
            debug!(path = %path, count = mutations.len(), "Storing dead properties");
            store.update(&user, &path, mutations)?;
            Ok(PatchOutcome::Success)
        });
    }
}

impl ServerPlugin for CustomPropertiesPlugin {
    fn name(&self) -> &'static str {
        "custom-properties"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        let plugin = Arc::clone(&self);
        server.on("propFind", 130, move |server, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                plugin.handle_get_properties(server, propfind, node)?;
            }
            Ok(Flow::Continue)
        });

        let plugin = Arc::clone(&self);
        server.on("propPatch", 300, move |server, event| {
            if let Some((path, proppatch)) = event.proppatch_parts() {
                plugin.handle_update_properties(server, path, proppatch);
            }
            Ok(Flow::Continue)
        });

        let plugin = Arc::clone(&self);
        server.on("afterUnbind", oxdav_core::DEFAULT_PRIORITY, move |server, event| {
            if let Some(path) = event.path() {
                plugin.cache.lock().remove(path);
                plugin.store.delete_path(&Self::user(server), path)?;
            }
            Ok(Flow::Continue)
        });

        server.on("afterMove", oxdav_core::DEFAULT_PRIORITY, move |server, event| {
            if let Event::Move {
                source,
                destination,
            } = event
            {
                self.cache.lock().clear();
                self.store.move_path(&Self::user(server), source, destination)?;
            }
            Ok(Flow::Continue)
        });
    }
}
