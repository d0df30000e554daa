//! File metadata properties and response headers used by sync clients.

use std::sync::{Arc, LazyLock};

use chrono::DateTime;
use oxdav_core::{
    DEFAULT_PRIORITY, DavError, DavResult, Event, Flow, Node, PatchOutcome, PropFind, PropPatch,
    PropValue, Request, Response, Server, ServerPlugin, Tree, UserDirectory, path,
};
use regex::Regex;
use tracing::debug;

pub const ID: &str = "{http://owncloud.org/ns}id";
pub const FILEID: &str = "{http://owncloud.org/ns}fileid";
pub const PERMISSIONS: &str = "{http://owncloud.org/ns}permissions";
pub const SIZE: &str = "{http://owncloud.org/ns}size";
pub const OWNER_ID: &str = "{http://owncloud.org/ns}owner-id";
pub const OWNER_DISPLAY_NAME: &str = "{http://owncloud.org/ns}owner-display-name";
pub const CHECKSUMS: &str = "{http://owncloud.org/ns}checksums";
pub const CHECKSUM: &str = "{http://owncloud.org/ns}checksum";
pub const DOWNLOAD_URL: &str = "{http://owncloud.org/ns}downloadURL";
pub const HAS_PREVIEW: &str = "{http://nextcloud.org/ns}has-preview";
pub const LAST_MODIFIED: &str = "{DAV:}lastmodified";
pub const GETETAG: &str = "{DAV:}getetag";

/// User agents that cannot parse RFC 5987 `filename*` parameters.
static LEGACY_DISPOSITION_AGENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(MSIE)|(Trident)|(Android.*Chrome/[.0-9]*)|(^Mozilla/5\.0$)")
        .expect("valid regex literal")
});

pub struct FilesPlugin {
    users: Arc<dyn UserDirectory>,
    instance_id: String,
    download_base: Option<String>,
}

impl FilesPlugin {
    pub fn new(users: Arc<dyn UserDirectory>, instance_id: &str) -> Self {
        Self {
            users,
            instance_id: instance_id.to_string(),
            download_base: None,
        }
    }

    /// Serve `oc:downloadURL` as `<base><path>`.
    #[must_use]
    pub fn with_download_base(mut self, base: &str) -> Self {
        self.download_base = Some(base.to_string());
        self
    }

    /// Instance-qualified id: zero-padded file id followed by the instance id.
    pub fn qualified_id(&self, node: &Node) -> String {
        format!("{:08}{}", node.id, self.instance_id)
    }

    fn handle_get_properties(&self, propfind: &mut PropFind, node: &Node) -> DavResult<()> {
        if !node.is_readable() {
            return Err(DavError::NotFound(format!("{} is not readable", node.path)));
        }

        propfind.handle_with(ID, || Some(PropValue::Text(self.qualified_id(node))));
        propfind.handle(FILEID, node.id);
        propfind.handle(PERMISSIONS, node.dav_permissions());
        if let Some(owner) = &node.owner {
            propfind.handle(OWNER_ID, owner.as_str());
            propfind.handle_with(OWNER_DISPLAY_NAME, || {
                self.users.display_name(owner).map(PropValue::Text)
            });
        }

        if node.is_directory() {
            propfind.handle(SIZE, node.size);
            return Ok(());
        }

        propfind.handle_with(CHECKSUMS, || {
            node.checksum()
                .map(|c| PropValue::list(CHECKSUM, vec![c.to_string()]))
        });
        propfind.handle_with(DOWNLOAD_URL, || {
            self.download_base
                .as_ref()
                .map(|base| PropValue::Href(format!("{base}{}", node.path)))
        });
        propfind.handle_with(HAS_PREVIEW, || {
            let previewable = node
                .content_type()
                .is_some_and(|t| t.starts_with("image/") || t == "text/plain");
            Some(PropValue::from(if previewable { "true" } else { "false" }))
        });
        Ok(())
    }

    fn handle_update_properties(server: &Server, path: &str, proppatch: &mut PropPatch) {
        let tree = server.shared_tree();
        let target = path.to_string();
        proppatch.handle(&[LAST_MODIFIED], move |mutations| {
            let Some(mtime) = mutations.first().and_then(|(_, v)| v.as_ref()).and_then(parse_mtime) else {
                return Ok(PatchOutcome::Failure);
            };
            tree.touch(&target, mtime)?;
            Ok(PatchOutcome::Success)
        });

        let tree = server.shared_tree();
        let target = path.to_string();
        proppatch.handle(&[GETETAG], move |mutations| {
            let etag = mutations
                .first()
                .and_then(|(_, v)| v.as_ref())
                .and_then(PropValue::as_text)
                .map(|e| e.trim().trim_matches('"'))
                .unwrap_or_default();
            if etag.is_empty() {
                return Ok(PatchOutcome::Failure);
            }
            tree.set_etag(&target, etag)?;
            Ok(PatchOutcome::Success)
        });
    }

    fn check_move(server: &Server, source: &str, destination: &str) -> DavResult<()> {
        if path::split(source).0 == path::split(destination).0 {
            return Ok(());
        }
        let node = server.tree().get_node_for_path(source)?;
        if !node.is_deletable() {
            return Err(DavError::Forbidden(format!("{source} cannot be deleted")));
        }
        Ok(())
    }

    fn download_headers(&self, server: &Server, request: &Request, response: &mut Response) -> DavResult<()> {
        let node = match server.tree().get_node_for_path(request.path()) {
            Ok(node) if node.is_file() => node,
            Ok(_) | Err(DavError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if response.header("Content-Disposition").is_none() {
            let legacy = request
                .header("User-Agent")
                .is_some_and(|ua| LEGACY_DISPOSITION_AGENTS.is_match(ua));
            response.set_header("Content-Disposition", &content_disposition(node.name(), legacy));
        }
        if let Some(checksum) = node.checksum().filter(|c| !c.is_empty()) {
            response.set_header("OC-Checksum", checksum);
        }
        response.set_header("OC-Etag", &node.quoted_etag());
        if let Some(owner) = &node.owner {
            response.set_header("X-NC-OwnerId", owner);
        }
        response.set_header("X-NC-Permissions", &node.dav_permissions());
        Ok(())
    }

    fn upload_headers(&self, server: &Server, request: &Request, response: &mut Response) -> DavResult<()> {
        let path = request.path();
        if !response.status().is_some_and(|s| s.is_success()) {
            return Ok(());
        }

        if let Some(mtime) = request
            .header("X-OC-MTime")
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            server.tree().touch(path, mtime)?;
            response.set_header("X-OC-MTime", "accepted");
        }

        let node = server.tree().get_node_for_path(path)?;
        response.set_header("OC-FileId", &self.qualified_id(&node));
        response.set_header("OC-Etag", &node.quoted_etag());
        Ok(())
    }
}

/// Modification time from a PROPPATCH value: epoch seconds or an RFC 2822
/// date.
fn parse_mtime(value: &PropValue) -> Option<i64> {
    match value {
        PropValue::Integer(n) => Some(*n),
        other => {
            let text = other.as_text()?.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| DateTime::parse_from_rfc2822(text).ok().map(|d| d.timestamp()))
        }
    }
}

fn content_disposition(name: &str, legacy: bool) -> String {
    let encoded = urlencoding::encode(name);
    if legacy {
        format!("attachment; filename=\"{encoded}\"")
    } else {
        format!("attachment; filename*=UTF-8''{encoded}; filename=\"{encoded}\"")
    }
}

impl ServerPlugin for FilesPlugin {
    fn name(&self) -> &'static str {
        "files"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        let plugin = Arc::clone(&self);
        server.on("propFind", DEFAULT_PRIORITY, move |_, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                plugin.handle_get_properties(propfind, node)?;
            }
            Ok(Flow::Continue)
        });

        server.on("propPatch", DEFAULT_PRIORITY, |server, event| {
            if let Some((path, proppatch)) = event.proppatch_parts() {
                Self::handle_update_properties(server, path, proppatch);
            }
            Ok(Flow::Continue)
        });

        server.on("beforeMove", DEFAULT_PRIORITY, |server, event| {
            if let Event::Move {
                source,
                destination,
            } = event
            {
                Self::check_move(server, source, destination)?;
            }
            Ok(Flow::Continue)
        });

        for method in ["GET", "HEAD"] {
            let plugin = Arc::clone(&self);
            server.on(format!("afterMethod:{method}"), DEFAULT_PRIORITY, move |server, event| {
                if let Some((request, response)) = event.method_parts() {
                    plugin.download_headers(server, request, response)?;
                }
                Ok(Flow::Continue)
            });
        }

        server.on("afterMethod:PUT", DEFAULT_PRIORITY, move |server, event| {
            if let Some((request, response)) = event.method_parts() {
                debug!(path = request.path(), "Adding upload headers");
                self.upload_headers(server, request, response)?;
            }
            Ok(Flow::Continue)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Account, Accounts};
    use http::{Method, StatusCode};
    use oxdav_core::{Depth, MemoryTree, Permissions, PropFindKind};

    fn setup() -> (Arc<MemoryTree>, Server) {
        let tree = Arc::new(MemoryTree::with_owner(Some("alice".into())));
        tree.add_file("docs/report final.pdf", "pdf").unwrap();
        tree.add_file("docs/photo.png", "png").unwrap();
        let accounts = Arc::new(Accounts::from_accounts([
            Account::new("alice", "pw").with_display_name("Alice Liddell"),
        ]));
        let mut server = Server::new(tree.clone());
        server.add_plugin(Arc::new(
            FilesPlugin::new(accounts, "ocinstance").with_download_base("https://cdn.example.com/"),
        ));
        (tree, server)
    }

    fn get(server: &Server, path: &str, agent: Option<&str>) -> Response {
        let mut request = Request::new(Method::GET, path).unwrap();
        if let Some(agent) = agent {
            request = request.with_header("User-Agent", agent);
        }
        server.handle(request)
    }

    #[test]
    fn test_file_properties() {
        let (tree, server) = setup();
        let node = tree.get_node_for_path("docs/photo.png").unwrap();
        let names = [ID, FILEID, OWNER_ID, OWNER_DISPLAY_NAME, HAS_PREVIEW, DOWNLOAD_URL].map(String::from);
        let props = server.get_properties("docs/photo.png", &names).unwrap();
        assert_eq!(
            props,
            vec![
                (ID.to_string(), PropValue::Text(format!("{:08}ocinstance", node.id))),
                (FILEID.to_string(), PropValue::from(node.id)),
                (OWNER_ID.to_string(), PropValue::from("alice")),
                (OWNER_DISPLAY_NAME.to_string(), PropValue::from("Alice Liddell")),
                (HAS_PREVIEW.to_string(), PropValue::from("true")),
                (
                    DOWNLOAD_URL.to_string(),
                    PropValue::Href("https://cdn.example.com/docs/photo.png".into())
                ),
            ]
        );
    }

    #[test]
    fn test_unreadable_node_is_not_found() {
        let (tree, server) = setup();
        tree.set_permissions("docs/photo.png", Permissions::UPDATE).unwrap();
        let err = server
            .get_properties("docs/photo.png", &[FILEID.to_string()])
            .unwrap_err();
        assert!(matches!(err, DavError::NotFound(_)));
    }

    #[test]
    fn test_unreadable_child_is_left_out_of_listing() {
        let (tree, server) = setup();
        tree.add_file("docs/secret.txt", "hidden").unwrap();
        tree.set_permissions("docs/secret.txt", Permissions::UPDATE).unwrap();

        let responses = server
            .get_properties_for_path("docs", PropFindKind::Named, &[FILEID.to_string()], Depth::One)
            .unwrap();
        let paths: Vec<_> = responses.iter().map(|r| r.path.as_str()).collect();
        assert!(paths.contains(&"docs"));
        assert!(paths.contains(&"docs/photo.png"));
        assert!(!paths.contains(&"docs/secret.txt"));

        let body = r#"<?xml version="1.0"?><d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns"><d:prop><oc:fileid/></d:prop></d:propfind>"#;
        let request = Request::new(Method::from_bytes(b"PROPFIND").unwrap(), "docs")
            .unwrap()
            .with_header("Depth", "1")
            .with_body(body);
        let response = server.handle(request);
        assert_eq!(response.status(), Some(StatusCode::MULTI_STATUS));
        let text = String::from_utf8_lossy(response.body()).into_owned();
        assert!(text.contains("photo.png"));
        assert!(!text.contains("secret.txt"));
    }

    #[test]
    fn test_download_headers() {
        let (tree, server) = setup();
        let node = tree.get_node_for_path("docs/report final.pdf").unwrap();
        let response = get(&server, "docs/report final.pdf", Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/130.0"));
        assert_eq!(response.status(), Some(StatusCode::OK));
        assert_eq!(
            response.header("Content-Disposition"),
            Some("attachment; filename*=UTF-8''report%20final.pdf; filename=\"report%20final.pdf\"")
        );
        assert_eq!(response.header("OC-Etag"), Some(node.quoted_etag().as_str()));
        assert_eq!(response.header("X-NC-OwnerId"), Some("alice"));
        assert_eq!(response.header("X-NC-Permissions"), Some(node.dav_permissions().as_str()));
        assert!(response.header("OC-Checksum").is_some_and(|c| c.starts_with("SHA256:")));
    }

    #[test]
    fn test_legacy_agent_gets_plain_filename() {
        let (_tree, server) = setup();
        let response = get(&server, "docs/photo.png", Some("Mozilla/5.0 (Windows NT 10.0; Trident/7.0; rv:11.0)"));
        assert_eq!(
            response.header("Content-Disposition"),
            Some("attachment; filename=\"photo.png\"")
        );
    }

    #[test]
    fn test_put_headers_and_mtime() {
        let (tree, server) = setup();
        let request = Request::new(Method::PUT, "docs/new.txt")
            .unwrap()
            .with_header("X-OC-MTime", "1700000000")
            .with_body("hello");
        let response = server.handle(request);
        assert_eq!(response.status(), Some(StatusCode::CREATED));
        assert_eq!(response.header("X-OC-MTime"), Some("accepted"));

        let node = tree.get_node_for_path("docs/new.txt").unwrap();
        assert_eq!(response.header("OC-FileId"), Some(format!("{:08}ocinstance", node.id).as_str()));
        assert_eq!(
            node.modified,
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn test_proppatch_lastmodified_and_etag() {
        let (tree, server) = setup();
        let result = server
            .update_properties(
                "docs/photo.png",
                vec![
                    (LAST_MODIFIED.to_string(), Some(PropValue::from("Tue, 14 Nov 2023 22:13:20 +0000"))),
                    (GETETAG.to_string(), Some(PropValue::from("\"custom-etag\""))),
                ],
            )
            .unwrap();
        assert_eq!(
            result,
            vec![
                (LAST_MODIFIED.to_string(), StatusCode::OK),
                (GETETAG.to_string(), StatusCode::OK),
            ]
        );
        let node = tree.get_node_for_path("docs/photo.png").unwrap();
        assert_eq!(node.etag, "custom-etag");
        assert_eq!(
            node.modified,
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn test_proppatch_empty_etag_fails() {
        let (_tree, server) = setup();
        let result = server
            .update_properties("docs/photo.png", vec![(GETETAG.to_string(), Some(PropValue::from("  ")))])
            .unwrap();
        assert_eq!(result, vec![(GETETAG.to_string(), StatusCode::FORBIDDEN)]);
    }

    #[test]
    fn test_move_of_undeletable_node_across_directories() {
        let (tree, server) = setup();
        tree.add_directory("archive").unwrap();
        tree.set_permissions("docs/photo.png", Permissions::READ | Permissions::UPDATE)
            .unwrap();

        let rename = Request::new(Method::from_bytes(b"MOVE").unwrap(), "docs/photo.png")
            .unwrap()
            .with_header("Destination", "/docs/picture.png");
        assert_eq!(server.handle(rename).status(), Some(StatusCode::CREATED));

        let relocate = Request::new(Method::from_bytes(b"MOVE").unwrap(), "docs/picture.png")
            .unwrap()
            .with_header("Destination", "/archive/picture.png");
        assert_eq!(server.handle(relocate).status(), Some(StatusCode::FORBIDDEN));
        assert!(tree.node_exists("docs/picture.png"));
    }
}
