//! Protocol-level locking for clients that refuse to write without a lock.
//!
//! No lock is ever stored. LOCK answers with a synthesized exclusive lock
//! whose token is derived from the path, UNLOCK always succeeds, and every
//! `opaquelocktoken:` token in an `If:` header is accepted.

use std::sync::Arc;

use http::{Method, StatusCode};
use oxdav_core::{
    DEFAULT_PRIORITY, DavResult, Event, Flow, PropValue, Request, Response, Server, ServerPlugin,
    XmlElement, xml,
};
use tracing::debug;

pub const TOKEN_PREFIX: &str = "opaquelocktoken:";
pub const LOCK_TIMEOUT_SECS: u64 = 1800;

const SUPPORTED_LOCK: &str = "{DAV:}supportedlock";
const LOCK_DISCOVERY: &str = "{DAV:}lockdiscovery";

#[derive(Debug, Default)]
pub struct FakeLockPlugin;

impl FakeLockPlugin {
    pub fn new() -> Self {
        Self
    }

    /// Lock token for `path`; the same path always yields the same token.
    pub fn token_for(path: &str) -> String {
        format!("{TOKEN_PREFIX}{:x}", md5::compute(path.as_bytes()))
    }

    fn lock(server: &Server, request: &Request, response: &mut Response) -> DavResult<Flow> {
        let path = request.path();
        let token = Self::token_for(path);
        let is_collection = server.tree().get_node_for_path(path).is_ok_and(|n| n.is_directory());
        let root = xml::href(server.base_uri(), path, is_collection);

        let active = XmlElement::new("{DAV:}activelock")
            .with_child(scope("{DAV:}lockscope", "{DAV:}exclusive"))
            .with_child(scope("{DAV:}locktype", "{DAV:}write"))
            .with_child(XmlElement::new("{DAV:}lockroot").with_child(href(&root)))
            .with_child(XmlElement::new("{DAV:}depth").with_text("infinity"))
            .with_child(XmlElement::new("{DAV:}timeout").with_text(format!("Second-{LOCK_TIMEOUT_SECS}")))
            .with_child(XmlElement::new("{DAV:}locktoken").with_child(href(&token)));

        debug!(path, token = %token, "Answering LOCK with a synthesized lock");
        let body = xml::prop_document(LOCK_DISCOVERY, &PropValue::Xml(vec![active]))?;
        response.set_header("Lock-Token", &format!("<{token}>"));
        response.set_xml_body(body);
        response.set_status(StatusCode::OK);
        Ok(Flow::Stop)
    }

    fn unlock(response: &mut Response) -> Flow {
        response.set_header("Content-Length", "0");
        response.set_status(StatusCode::NO_CONTENT);
        Flow::Stop
    }
}

fn href(target: &str) -> XmlElement {
    XmlElement::new("{DAV:}href").with_text(target)
}

fn scope(outer: &str, inner: &str) -> XmlElement {
    XmlElement::new(outer).with_child(XmlElement::new(inner))
}

fn lock_entry(kind: &str) -> XmlElement {
    XmlElement::new("{DAV:}lockentry")
        .with_child(scope("{DAV:}lockscope", kind))
        .with_child(scope("{DAV:}locktype", "{DAV:}write"))
}

impl ServerPlugin for FakeLockPlugin {
    fn name(&self) -> &'static str {
        "fake-lock"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        server.on("method:LOCK", 1, |server, event| match event.method_parts() {
            Some((request, response)) => Self::lock(server, request, response),
            None => Ok(Flow::Continue),
        });
        server.on("method:UNLOCK", 1, |_, event| {
            Ok(event
                .method_parts()
                .map_or(Flow::Continue, |(_, response)| Self::unlock(response)))
        });

        server.on("propFind", DEFAULT_PRIORITY, |_, event| {
            if let Some((propfind, _)) = event.propfind_parts() {
                propfind.handle_with(SUPPORTED_LOCK, || {
                    Some(PropValue::Xml(vec![
                        lock_entry("{DAV:}exclusive"),
                        lock_entry("{DAV:}shared"),
                    ]))
                });
                propfind.handle(LOCK_DISCOVERY, PropValue::Xml(Vec::new()));
            }
            Ok(Flow::Continue)
        });

        server.on("validateTokens", DEFAULT_PRIORITY, |_, event| {
            if let Event::ValidateTokens { conditions, .. } = event {
                for token in conditions.iter_mut().flat_map(|c| c.tokens.iter_mut()) {
                    if token.token.starts_with(TOKEN_PREFIX) {
                        token.valid = true;
                    }
                }
            }
            Ok(Flow::Continue)
        });
    }

    fn http_methods(&self, _path: &str) -> Vec<Method> {
        ["LOCK", "UNLOCK"]
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
            .collect()
    }

    fn features(&self) -> Vec<&'static str> {
        vec!["2"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxdav_core::MemoryTree;

    fn server() -> Server {
        let tree = MemoryTree::new();
        tree.add_file("docs/a.txt", "a").unwrap();
        let mut server = Server::new(Arc::new(tree)).with_base_uri("/remote.php/webdav");
        server.add_plugin(Arc::new(FakeLockPlugin::new()));
        server
    }

    fn method(name: &str, path: &str) -> Request {
        Request::new(Method::from_bytes(name.as_bytes()).unwrap(), path).unwrap()
    }

    #[test]
    fn test_lock_token_is_deterministic() {
        let server = server();
        let first = server.handle(method("LOCK", "docs/a.txt"));
        let second = server.handle(method("LOCK", "docs/a.txt"));
        assert_eq!(first.status(), Some(StatusCode::OK));
        assert_eq!(first.header("Lock-Token"), second.header("Lock-Token"));
        assert_eq!(first.body(), second.body());

        let other = server.handle(method("LOCK", "docs"));
        assert_ne!(first.header("Lock-Token"), other.header("Lock-Token"));
    }

    #[test]
    fn test_lock_body() {
        let response = server().handle(method("LOCK", "docs/a.txt"));
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("<d:exclusive"));
        assert!(body.contains("<d:depth>infinity</d:depth>"));
        assert!(body.contains("<d:timeout>Second-1800</d:timeout>"));
        assert!(body.contains("/remote.php/webdav/docs/a.txt"));
        assert!(body.contains(&FakeLockPlugin::token_for("docs/a.txt")));
    }

    #[test]
    fn test_unlock_always_succeeds() {
        let request = method("UNLOCK", "docs/a.txt").with_header("Lock-Token", "<opaquelocktoken:bogus>");
        let response = server().handle(request);
        assert_eq!(response.status(), Some(StatusCode::NO_CONTENT));
        assert!(response.body().is_empty());
    }

    #[test]
    fn test_write_with_fake_token_passes_if_header() {
        let server = server();
        let token = FakeLockPlugin::token_for("docs/a.txt");
        let request = method("PUT", "docs/a.txt")
            .with_header("If", &format!("(<{token}>)"))
            .with_body("new");
        assert_eq!(server.handle(request).status(), Some(StatusCode::NO_CONTENT));

        let request = method("PUT", "docs/a.txt")
            .with_header("If", "(<urn:uuid:not-a-fake-lock>)")
            .with_body("newer");
        assert_eq!(server.handle(request).status(), Some(StatusCode::PRECONDITION_FAILED));
    }

    #[test]
    fn test_advertises_class_two_and_lock_methods() {
        let response = server().handle(method("OPTIONS", "docs/a.txt"));
        assert_eq!(response.header("DAV"), Some("1, 3, 2"));
        let allow = response.header("Allow").unwrap();
        assert!(allow.contains("LOCK"));
        assert!(allow.contains("UNLOCK"));
    }
}
