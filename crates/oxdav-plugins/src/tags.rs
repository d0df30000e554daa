//! `oc:tags` and `oc:favorite` properties.
//!
//! Favorites are stored as the reserved tag [`TAG_FAVORITE`] and never show
//! up in the tag list. A depth > 0 PROPFIND on a collection loads the tags
//! of the collection and its children with a single backend query.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use http::StatusCode;
use oxdav_core::{
    DEFAULT_PRIORITY, DavResult, Depth, Event, FileId, Flow, Mutation, Node, PatchOutcome,
    PropFind, PropPatch, PropValue, Server, ServerPlugin,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

pub const TAGS: &str = "{http://owncloud.org/ns}tags";
pub const TAG: &str = "{http://owncloud.org/ns}tag";
pub const FAVORITE: &str = "{http://owncloud.org/ns}favorite";

/// Reserved tag marking a favorite.
pub const TAG_FAVORITE: &str = "_$!<Favorite>!$_";

/// Tag storage keyed by file id.
pub trait TagBackend: Send + Sync {
    /// Tags of every id in `ids`. Ids without tags may be missing from the
    /// map.
    fn tags_for_objects(&self, ids: &[FileId]) -> DavResult<HashMap<FileId, Vec<String>>>;

    fn tag_as(&self, id: FileId, tag: &str) -> DavResult<()>;

    fn untag(&self, id: FileId, tag: &str) -> DavResult<()>;
}

/// Tags held in memory. Counts queries so preloading can be observed.
#[derive(Debug, Default)]
pub struct MemoryTags {
    tags: RwLock<HashMap<FileId, Vec<String>>>,
    queries: AtomicUsize,
}

impl MemoryTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`TagBackend::tags_for_objects`] calls so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl TagBackend for MemoryTags {
    fn tags_for_objects(&self, ids: &[FileId]) -> DavResult<HashMap<FileId, Vec<String>>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let tags = self.tags.read();
        Ok(ids
            .iter()
            .filter_map(|id| tags.get(id).map(|t| (*id, t.clone())))
            .collect())
    }

    fn tag_as(&self, id: FileId, tag: &str) -> DavResult<()> {
        let mut tags = self.tags.write();
        let entry = tags.entry(id).or_default();
        if !entry.iter().any(|t| t == tag) {
            entry.push(tag.to_string());
        }
        Ok(())
    }

    fn untag(&self, id: FileId, tag: &str) -> DavResult<()> {
        if let Some(entry) = self.tags.write().get_mut(&id) {
            entry.retain(|t| t != tag);
        }
        Ok(())
    }
}

/// Serves and updates tags and the favorite flag.
pub struct TagsPlugin {
    backend: Arc<dyn TagBackend>,
    cache: Mutex<HashMap<FileId, Vec<String>>>,
}

impl TagsPlugin {
    pub fn new(backend: Arc<dyn TagBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn tags_for(&self, id: FileId) -> DavResult<Vec<String>> {
        if let Some(tags) = self.cache.lock().get(&id) {
            return Ok(tags.clone());
        }
        let tags = self
            .backend
            .tags_for_objects(&[id])?
            .remove(&id)
            .unwrap_or_default();
        self.cache.lock().insert(id, tags.clone());
        Ok(tags)
    }

    fn preload(&self, server: &Server, node: &Node) -> DavResult<()> {
        let mut ids = vec![node.id];
        ids.extend(server.tree().get_children(&node.path)?.iter().map(|c| c.id));
        debug!(path = %node.path, count = ids.len(), "Preloading tags");

        let mut found = self.backend.tags_for_objects(&ids)?;
        let mut cache = self.cache.lock();
        for id in ids {
            cache.insert(id, found.remove(&id).unwrap_or_default());
        }
        Ok(())
    }

    fn handle_get_properties(&self, server: &Server, propfind: &mut PropFind, node: &Node) -> DavResult<()> {
        if !propfind.is_requested(TAGS) && !propfind.is_requested(FAVORITE) {
            return Ok(());
        }
        if node.is_directory() && propfind.depth() != Depth::Zero {
            self.preload(server, node)?;
        }

        propfind.try_handle_with(TAGS, || {
            let tags = self
                .tags_for(node.id)?
                .into_iter()
                .filter(|t| t != TAG_FAVORITE)
                .collect();
            Ok(Some(PropValue::list(TAG, tags)))
        })?;
        propfind.try_handle_with(FAVORITE, || {
            let favorite = self.tags_for(node.id)?.iter().any(|t| t == TAG_FAVORITE);
            Ok(Some(PropValue::from(favorite)))
        })
    }

    fn handle_update_properties(self: &Arc<Self>, server: &Server, path: &str, proppatch: &mut PropPatch) -> DavResult<()> {
        let touched = proppatch
            .mutations()
            .iter()
            .any(|(name, _)| name == TAGS || name == FAVORITE);
        if !touched {
            return Ok(());
        }
        let id = server.tree().get_node_for_path(path)?.id;

        let plugin = Arc::clone(self);
        proppatch.handle(&[TAGS], move |mutations| {
            let wanted = requested_tags(find_value(mutations, TAGS));
            plugin.update_tags(id, &wanted)?;
            Ok(PatchOutcome::Success)
        });

        let plugin = Arc::clone(self);
        proppatch.handle(&[FAVORITE], move |mutations| {
            let value = find_value(mutations, FAVORITE);
            let favorite = value
                .and_then(PropValue::as_text)
                .is_some_and(|v| matches!(v.trim(), "1" | "true"));
            if favorite {
                plugin.backend.tag_as(id, TAG_FAVORITE)?;
            } else {
                plugin.backend.untag(id, TAG_FAVORITE)?;
            }
            if value.is_none() {
                return Ok(PatchOutcome::Code(StatusCode::NO_CONTENT));
            }
            Ok(PatchOutcome::Success)
        });
        Ok(())
    }

    /// Replace the tags of `id` with `wanted`, leaving the favorite alone.
    fn update_tags(&self, id: FileId, wanted: &[String]) -> DavResult<()> {
        let current: Vec<String> = self
            .tags_for(id)?
            .into_iter()
            .filter(|t| t != TAG_FAVORITE)
            .collect();

        for tag in wanted.iter().filter(|t| !current.contains(t)) {
            self.backend.tag_as(id, tag)?;
        }
        for tag in current.iter().filter(|t| !wanted.contains(t)) {
            self.backend.untag(id, tag)?;
        }
        self.cache.lock().remove(&id);
        Ok(())
    }
}

fn find_value<'a>(mutations: &'a [Mutation], name: &str) -> Option<&'a PropValue> {
    mutations
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, value)| value.as_ref())
}

fn requested_tags(value: Option<&PropValue>) -> Vec<String> {
    match value {
        Some(PropValue::List { items, .. }) => items.clone(),
        Some(PropValue::Text(text)) if !text.trim().is_empty() => vec![text.trim().to_string()],
        _ => Vec::new(),
    }
    .into_iter()
    .filter(|t| t != TAG_FAVORITE)
    .collect()
}

impl ServerPlugin for TagsPlugin {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        let plugin = Arc::clone(&self);
        server.on("propFind", DEFAULT_PRIORITY, move |server, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                plugin.handle_get_properties(server, propfind, node)?;
            }
            Ok(Flow::Continue)
        });

        server.on("propPatch", DEFAULT_PRIORITY, move |server, event: &mut Event<'_>| {
            if let Some((path, proppatch)) = event.proppatch_parts() {
                self.handle_update_properties(server, path, proppatch)?;
            }
            Ok(Flow::Continue)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxdav_core::{MemoryTree, PropFindKind};

    fn setup() -> (Arc<MemoryTree>, Arc<MemoryTags>, Server) {
        let tree = Arc::new(MemoryTree::new());
        tree.add_file("docs/a.txt", "a").unwrap();
        tree.add_file("docs/b.txt", "b").unwrap();
        tree.add_file("docs/c.txt", "c").unwrap();
        let tags = Arc::new(MemoryTags::new());
        let mut server = Server::new(tree.clone());
        server.add_plugin(Arc::new(TagsPlugin::new(tags.clone())));
        (tree, tags, server)
    }

    fn id_of(tree: &MemoryTree, path: &str) -> FileId {
        use oxdav_core::Tree;
        tree.get_node_for_path(path).unwrap().id
    }

    #[test]
    fn test_tags_exclude_favorite() {
        let (tree, tags, server) = setup();
        let id = id_of(&tree, "docs/a.txt");
        tags.tag_as(id, "work").unwrap();
        tags.tag_as(id, TAG_FAVORITE).unwrap();

        let props = server
            .get_properties("docs/a.txt", &[TAGS.to_string(), FAVORITE.to_string()])
            .unwrap();
        assert_eq!(props[0], (TAGS.to_string(), PropValue::list(TAG, vec!["work".into()])));
        assert_eq!(props[1], (FAVORITE.to_string(), PropValue::Integer(1)));
    }

    #[test]
    fn test_depth_one_preloads_in_one_query() {
        let (_tree, tags, server) = setup();
        let responses = server
            .get_properties_for_path("docs", PropFindKind::Named, &[TAGS.to_string()], Depth::One)
            .unwrap();
        assert_eq!(responses.len(), 4);
        assert_eq!(tags.query_count(), 1);
    }

    #[test]
    fn test_unrequested_tags_cost_nothing() {
        let (_tree, tags, server) = setup();
        server
            .get_properties_for_path("docs", PropFindKind::Named, &["{DAV:}getetag".to_string()], Depth::One)
            .unwrap();
        assert_eq!(tags.query_count(), 0);
    }

    #[test]
    fn test_update_tags_is_a_diff() {
        let (tree, tags, server) = setup();
        let id = id_of(&tree, "docs/a.txt");
        tags.tag_as(id, "old").unwrap();
        tags.tag_as(id, "keep").unwrap();
        tags.tag_as(id, TAG_FAVORITE).unwrap();

        let result = server
            .update_properties(
                "docs/a.txt",
                vec![(
                    TAGS.to_string(),
                    Some(PropValue::list(TAG, vec!["keep".into(), "new".into()])),
                )],
            )
            .unwrap();
        assert_eq!(result, vec![(TAGS.to_string(), StatusCode::OK)]);

        let stored = tags.tags_for_objects(&[id]).unwrap().remove(&id).unwrap();
        assert!(stored.contains(&"keep".to_string()));
        assert!(stored.contains(&"new".to_string()));
        assert!(!stored.contains(&"old".to_string()));
        assert!(stored.contains(&TAG_FAVORITE.to_string()));
    }

    #[test]
    fn test_favorite_set_and_remove() {
        let (tree, tags, server) = setup();
        let id = id_of(&tree, "docs/b.txt");

        let result = server
            .update_properties("docs/b.txt", vec![(FAVORITE.to_string(), Some(PropValue::from("1")))])
            .unwrap();
        assert_eq!(result, vec![(FAVORITE.to_string(), StatusCode::OK)]);
        assert!(tags.tags_for_objects(&[id]).unwrap()[&id].contains(&TAG_FAVORITE.to_string()));

        let result = server
            .update_properties("docs/b.txt", vec![(FAVORITE.to_string(), None)])
            .unwrap();
        assert_eq!(result, vec![(FAVORITE.to_string(), StatusCode::NO_CONTENT)]);
        assert!(!tags.tags_for_objects(&[id]).unwrap()[&id].contains(&TAG_FAVORITE.to_string()));
    }
}
