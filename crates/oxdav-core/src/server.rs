//! The per-request DAV server.
//!
//! A [`Server`] owns an [`EventBus`], a handle to the shared [`Tree`] and the
//! registered plugins. It is cheap to build and is meant to be constructed
//! for every request by a factory, which keeps the property coordinators and
//! every plugin preload cache request-scoped.
//!
//! # Method lifecycle
//!
//! [`Server::handle`] drives one request through:
//!
//! 1. `beforeMethod:<M>` (wildcard listeners on `beforeMethod:*` included);
//!    a listener answering [`Flow::Stop`] ends processing.
//! 2. Conditional headers (`If-Match`, `If-None-Match`, `If-Modified-Since`,
//!    `If-Unmodified-Since` and the WebDAV `If:` header, validated through
//!    `validateTokens`).
//! 3. `method:<M>`; nobody claiming the method is `NotImplemented`.
//! 4. `afterMethod:<M>`.
//! 5. `afterResponse` on success, `exception` on failure.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, instrument, warn};

use crate::core_plugin::CorePlugin;
use crate::error::{DavError, DavResult};
use crate::event::{Event, EventBus, HandlerResult, Priority};
use crate::node::Node;
use crate::path;
use crate::plugin::ServerPlugin;
use crate::propfind::{Depth, PropFind, PropFindKind, PropFindResponse, PropValue};
use crate::proppatch::{Mutation, PropPatch};
use crate::request::{self, Request, Response};
use crate::tree::{LockGuard, LockKind, Tree};
use crate::xml;

/// Principal URI prefix of regular users.
pub const PRINCIPAL_PREFIX: &str = "principals/users/";

/// Result of [`Server::create_file`] and [`Server::update_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A `before*` listener stopped the write.
    Aborted,
    /// Content was stored. `etag` is `None` when a listener rewrote the body,
    /// since the stored content then differs from what the client sent.
    Written { etag: Option<String> },
}

/// Destination of a COPY or MOVE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyMoveInfo {
    pub destination: String,
    pub destination_exists: bool,
}

/// DAV server for one request.
pub struct Server {
    tree: Arc<dyn Tree>,
    events: EventBus<Server>,
    plugins: Vec<Arc<dyn ServerPlugin>>,
    base_uri: String,
    depth_infinity: bool,
    http_request: RwLock<Option<Arc<Request>>>,
    principal: Mutex<Option<String>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("base_uri", &self.base_uri)
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server over `tree` with the core method handlers installed.
    pub fn new(tree: Arc<dyn Tree>) -> Self {
        let mut server = Self {
            tree,
            events: EventBus::new(),
            plugins: Vec::new(),
            base_uri: "/".to_string(),
            depth_infinity: false,
            http_request: RwLock::new(None),
            principal: Mutex::new(None),
        };
        server.add_plugin(Arc::new(CorePlugin));
        server
    }

    /// Set the URI prefix the tree is served under.
    #[must_use]
    pub fn with_base_uri(mut self, base_uri: &str) -> Self {
        let trimmed = base_uri.trim_matches('/');
        self.base_uri = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        self
    }

    /// Allow `Depth: infinity` on PROPFIND. Off by default.
    #[must_use]
    pub fn with_depth_infinity(mut self, enabled: bool) -> Self {
        self.depth_infinity = enabled;
        self
    }

    /// Register a plugin and let it subscribe to events.
    pub fn add_plugin(&mut self, plugin: Arc<dyn ServerPlugin>) {
        debug!(plugin = plugin.name(), "Adding plugin");
        self.plugins.push(Arc::clone(&plugin));
        plugin.initialize(self);
    }

    pub fn plugins(&self) -> &[Arc<dyn ServerPlugin>] {
        &self.plugins
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<dyn ServerPlugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    /// Subscribe to `name`. See [`EventBus::on`].
    pub fn on<F>(&self, name: impl Into<String>, priority: Priority, callback: F)
    where
        F: Fn(&Server, &mut Event<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.events.on(name, priority, callback);
    }

    /// Emit `name` with this server as context. See [`EventBus::emit`].
    pub fn emit(&self, name: &str, event: &mut Event<'_>) -> DavResult<bool> {
        self.events.emit(self, name, event)
    }

    pub fn events(&self) -> &EventBus<Server> {
        &self.events
    }

    pub fn tree(&self) -> &dyn Tree {
        self.tree.as_ref()
    }

    /// Owned handle to the tree, for deferred work such as PROPPATCH
    /// handlers that outlive the listener call.
    pub fn shared_tree(&self) -> Arc<dyn Tree> {
        Arc::clone(&self.tree)
    }

    /// Base URI with leading and trailing slash.
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Request currently being dispatched.
    pub fn http_request(&self) -> Option<Arc<Request>> {
        self.http_request.read().clone()
    }

    /// Principal URI of the authenticated user, e.g. `principals/users/alice`.
    pub fn current_principal(&self) -> Option<String> {
        self.principal.lock().clone()
    }

    pub fn set_current_principal(&self, principal: Option<String>) {
        *self.principal.lock() = principal;
    }

    /// User id of the authenticated user.
    pub fn current_user(&self) -> Option<String> {
        self.current_principal()
            .and_then(|p| p.strip_prefix(PRINCIPAL_PREFIX).map(ToString::to_string))
    }

    /// Run one request through the pipeline. Errors are rendered into the
    /// returned response.
    #[instrument(level = "debug", skip_all, fields(method = %request.method(), path = %request.path()))]
    pub fn handle(&self, request: Request) -> Response {
        let request = Arc::new(request);
        *self.http_request.write() = Some(Arc::clone(&request));

        let mut response = Response::new();
        match self.invoke_method(&request, &mut response) {
            Ok(()) => {
                let mut event = Event::Method {
                    request: request.as_ref(),
                    response: &mut response,
                };
                if let Err(e) = self.emit("afterResponse", &mut event) {
                    warn!(error = %e, "afterResponse listener failed");
                }
            }
            Err(e) => self.render_error(&e, &mut response),
        }
        response
    }

    /// Emit the method events for `request` into `response`.
    pub fn invoke_method(&self, request: &Request, response: &mut Response) -> DavResult<()> {
        let method = request.method().as_str();

        let mut event = Event::Method {
            request,
            response: &mut *response,
        };
        if !self.emit(&format!("beforeMethod:{method}"), &mut event)? {
            return Ok(());
        }

        if !self.check_preconditions(request, response)? {
            return Ok(());
        }

        let mut event = Event::Method {
            request,
            response: &mut *response,
        };
        if self.emit(&format!("method:{method}"), &mut event)? {
            return Err(DavError::NotImplemented(format!(
                "There was no plugin in the system that was willing to handle this {method} method."
            )));
        }

        let mut event = Event::Method {
            request,
            response: &mut *response,
        };
        if !self.emit(&format!("afterMethod:{method}"), &mut event)? {
            return Ok(());
        }

        if response.status().is_none() {
            return Err(DavError::Internal(
                "No subsystem set a valid HTTP status code. Something must have interrupted the request without providing further detail.".into(),
            ));
        }
        Ok(())
    }

    fn render_error(&self, error: &DavError, response: &mut Response) {
        let mut event = Event::Exception { error };
        if let Err(e) = self.emit("exception", &mut event) {
            warn!(error = %e, "exception listener failed");
        }

        response.set_status(error.status());
        match xml::error_document(error) {
            Ok(body) => response.set_xml_body(body),
            Err(e) => {
                error!(error = %e, "Failed to render error body");
                response.set_header("Content-Length", "0");
                response.set_body(Bytes::new());
            }
        }
    }

    /// Evaluate conditional request headers.
    ///
    /// Returns `Ok(false)` when the response is already final (304).
    pub fn check_preconditions(&self, request: &Request, response: &mut Response) -> DavResult<bool> {
        let path = request.path();
        let node = self.tree.get_node_for_path(path).ok();
        let is_read = matches!(*request.method(), Method::GET | Method::HEAD);

        if let Some(if_match) = request.header("If-Match") {
            let Some(node) = &node else {
                return Err(DavError::PreconditionFailed(
                    "An If-Match header was specified and the resource did not exist".into(),
                ));
            };
            if if_match.trim() != "*" && !etag_list_contains(if_match, &node.quoted_etag()) {
                return Err(DavError::PreconditionFailed(
                    "An If-Match header was specified, but none of the specified ETags matched.".into(),
                ));
            }
        }

        if let (Some(if_none_match), Some(node)) = (request.header("If-None-Match"), &node) {
            let matched = if_none_match.trim() == "*" || etag_list_contains(if_none_match, &node.quoted_etag());
            if matched {
                if is_read {
                    response.set_status(StatusCode::NOT_MODIFIED);
                    response.set_header("ETag", &node.quoted_etag());
                    return Ok(false);
                }
                return Err(DavError::PreconditionFailed(
                    "An If-None-Match header was specified, but the ETag matched (or * was specified).".into(),
                ));
            }
        }

        if let Some(node) = &node {
            let modified = DateTime::<Utc>::from(node.modified).timestamp();
            if is_read
                && !request.has_header("If-None-Match")
                && let Some(since) = request.header("If-Modified-Since").and_then(parse_http_date)
                && modified <= since
            {
                response.set_status(StatusCode::NOT_MODIFIED);
                response.set_header("Last-Modified", &http_date(node.modified));
                return Ok(false);
            }
            if let Some(since) = request.header("If-Unmodified-Since").and_then(parse_http_date)
                && modified > since
            {
                return Err(DavError::PreconditionFailed(format!(
                    "An If-Unmodified-Since header was specified, but the entity has been changed since {since}."
                )));
            }
        }

        self.check_if_header(request)?;
        Ok(true)
    }

    /// Every `If:` condition must hold; a condition holds when one of its
    /// token/etag combinations does.
    fn check_if_header(&self, request: &Request) -> DavResult<()> {
        let mut conditions = request.if_conditions(|uri| self.calculate_uri(uri))?;
        if conditions.is_empty() {
            return Ok(());
        }

        let mut event = Event::ValidateTokens {
            request,
            conditions: &mut conditions,
        };
        self.emit("validateTokens", &mut event)?;

        for condition in &conditions {
            let satisfied = condition.tokens.iter().any(|token| {
                let token_valid = token.valid || token.token.is_empty();
                let etag_valid = if token.etag.is_empty() {
                    true
                } else {
                    token_valid
                        && self
                            .tree
                            .get_node_for_path(&condition.uri)
                            .is_ok_and(|n| n.is_file() && n.quoted_etag() == token.etag)
                };
                (token_valid && etag_valid) ^ token.negate
            });
            if !satisfied {
                return Err(DavError::PreconditionFailed(format!(
                    "Failed to find a valid token/etag combination for {}",
                    condition.uri
                )));
            }
        }
        Ok(())
    }

    /// Resolve an absolute URL or absolute path to a tree path.
    pub fn calculate_uri(&self, uri: &str) -> DavResult<String> {
        let uri_path = match uri.split_once("://") {
            Some((_, rest)) if !uri.starts_with('/') => rest.find('/').map_or("/", |i| &rest[i..]),
            _ => uri,
        };
        request::resolve_uri_path(uri_path, &self.base_uri)
    }

    /// Validate the `Destination` and `Overwrite` headers of a COPY or MOVE.
    pub fn copy_move_info(&self, request: &Request) -> DavResult<CopyMoveInfo> {
        let destination = request
            .header("Destination")
            .ok_or_else(|| DavError::BadRequest("The destination header was not supplied".into()))?;
        let destination = self.calculate_uri(destination)?;
        let overwrite = request.overwrite()?;

        let (parent, _) = path::split(&destination);
        match self.tree.get_node_for_path(parent) {
            Ok(node) if node.is_directory() => {}
            Ok(_) => {
                return Err(DavError::UnsupportedMediaType(
                    "The destination node is not a collection".into(),
                ));
            }
            Err(DavError::NotFound(_)) => {
                return Err(DavError::Conflict("The destination node is not found".into()));
            }
            Err(e) => return Err(e),
        }

        let destination_exists = self.tree.node_exists(&destination);
        if destination_exists && !overwrite {
            return Err(DavError::PreconditionFailed(
                "The destination node already exists, and the overwrite header is set to false".into(),
            ));
        }

        let source = request.path();
        if destination == source {
            return Err(DavError::Forbidden("Source and destination uri are identical.".into()));
        }
        if path::is_within(&destination, source) {
            return Err(DavError::Conflict(
                "The destination may not be part of the same subtree as the source path.".into(),
            ));
        }

        Ok(CopyMoveInfo {
            destination,
            destination_exists,
        })
    }

    /// Methods allowed on `path`, in advertisement order.
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let mut methods = vec![
            Method::OPTIONS,
            Method::GET,
            Method::HEAD,
            Method::DELETE,
            dav_method("PROPFIND"),
            Method::PUT,
            dav_method("PROPPATCH"),
            dav_method("COPY"),
            dav_method("MOVE"),
            dav_method("REPORT"),
        ];
        if !self.tree.node_exists(path) {
            methods.push(dav_method("MKCOL"));
        }
        for plugin in &self.plugins {
            for method in plugin.http_methods(path) {
                if !methods.contains(&method) {
                    methods.push(method);
                }
            }
        }
        methods
    }

    /// Compliance classes for the `DAV` header.
    pub fn features(&self) -> Vec<&'static str> {
        let mut features = vec!["1", "3"];
        for plugin in &self.plugins {
            for feature in plugin.features() {
                if !features.contains(&feature) {
                    features.push(feature);
                }
            }
        }
        features
    }

    /// PROPFIND depth for `request`. Infinity is downgraded to one level
    /// unless enabled.
    pub fn propfind_depth(&self, request: &Request) -> Depth {
        match request.depth(Depth::One) {
            Depth::Infinity if !self.depth_infinity => Depth::One,
            depth => depth,
        }
    }

    /// Collect properties for `path` and, depending on `depth`, its
    /// descendants. Nodes are visited in pre-order.
    pub fn get_properties_for_path(
        &self,
        path: &str,
        kind: PropFindKind,
        names: &[String],
        depth: Depth,
    ) -> DavResult<Vec<PropFindResponse>> {
        let node = self.tree.get_node_for_path(path)?;
        let mut responses = Vec::new();
        self.collect_properties(node, kind, names, depth, &mut responses)?;
        Ok(responses)
    }

    /// A descendant whose `propFind` fails with `NotFound` is left out of
    /// the listing together with its subtree; the requested node itself
    /// propagates the error.
    fn collect_properties(
        &self,
        node: Node,
        kind: PropFindKind,
        names: &[String],
        depth: Depth,
        responses: &mut Vec<PropFindResponse>,
    ) -> DavResult<()> {
        let mut propfind = PropFind::new(node.path.clone(), kind, names.to_vec(), depth);
        let mut event = Event::PropFind {
            propfind: &mut propfind,
            node: &node,
        };
        if self.emit("propFind", &mut event)? {
            responses.push(PropFindResponse {
                path: node.path.clone(),
                is_collection: node.is_directory(),
                propstats: propfind.into_propstats(),
            });
        }

        if node.is_directory() && depth != Depth::Zero {
            for child in self.tree.get_children(&node.path)? {
                match self.collect_properties(child, kind, names, depth.child(), responses) {
                    Err(DavError::NotFound(reason)) => {
                        debug!(parent = %node.path, %reason, "Skipping child in PROPFIND listing");
                    }
                    result => result?,
                }
            }
        }
        Ok(())
    }

    /// Resolved (200) values of `names` on a single node.
    pub fn get_properties(&self, path: &str, names: &[String]) -> DavResult<Vec<(String, PropValue)>> {
        let responses = self.get_properties_for_path(path, PropFindKind::Named, names, Depth::Zero)?;
        Ok(responses
            .into_iter()
            .flat_map(|r| r.propstats)
            .filter(|p| p.status == StatusCode::OK)
            .flat_map(|p| p.properties)
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect())
    }

    /// Apply property mutations through the `propPatch` listeners.
    pub fn update_properties(&self, path: &str, mutations: Vec<Mutation>) -> DavResult<Vec<(String, StatusCode)>> {
        let mut proppatch = PropPatch::new(mutations);
        let mut event = Event::PropPatch {
            path,
            proppatch: &mut proppatch,
        };
        self.emit("propPatch", &mut event)?;
        proppatch.commit()?;
        Ok(proppatch.result())
    }

    /// Create a new file at `path`.
    pub fn create_file(&self, path: &str, mut data: Bytes) -> DavResult<WriteOutcome> {
        let (dir, _) = path::split(path);

        if !self.emit("beforeBind", &mut Event::Path { path })? {
            return Ok(WriteOutcome::Aborted);
        }

        let parent = match self.tree.get_node_for_path(dir) {
            Ok(parent) if parent.is_directory() => parent,
            Ok(_) => {
                return Err(DavError::Conflict(
                    "Files can only be created as children of collections".into(),
                ));
            }
            Err(DavError::NotFound(_)) => {
                return Err(DavError::Conflict(format!("Parent collection /{dir} does not exist")));
            }
            Err(e) => return Err(e),
        };

        let mut modified = false;
        let mut event = Event::CreateFile {
            path,
            data: &mut data,
            parent: &parent,
            modified: &mut modified,
        };
        if !self.emit("beforeCreateFile", &mut event)? {
            return Ok(WriteOutcome::Aborted);
        }

        let etag = self.store(path, data, !modified)?;

        self.emit("afterBind", &mut Event::Path { path })?;
        self.emit("afterCreateFile", &mut Event::Path { path })?;
        Ok(WriteOutcome::Written {
            etag: (!modified).then_some(etag),
        })
    }

    /// Replace the content of the existing file at `path`.
    pub fn update_file(&self, path: &str, mut data: Bytes) -> DavResult<WriteOutcome> {
        let node = self.tree.get_node_for_path(path)?;

        let mut modified = false;
        let mut event = Event::WriteContent {
            path,
            node: &node,
            data: &mut data,
            modified: &mut modified,
        };
        if !self.emit("beforeWriteContent", &mut event)? {
            return Ok(WriteOutcome::Aborted);
        }

        let etag = self.store(path, data, !modified)?;

        self.emit("afterWriteContent", &mut Event::Path { path })?;
        Ok(WriteOutcome::Written {
            etag: (!modified).then_some(etag),
        })
    }

    /// Create a collection. Returns `false` when a listener stopped it.
    pub fn create_directory(&self, path: &str) -> DavResult<bool> {
        let (dir, _) = path::split(path);
        match self.tree.get_node_for_path(dir) {
            Ok(parent) if parent.is_directory() => {}
            Ok(_) => return Err(DavError::Conflict("Parent node is not a collection".into())),
            Err(DavError::NotFound(_)) => {
                return Err(DavError::Conflict("Parent node does not exist".into()));
            }
            Err(e) => return Err(e),
        }
        if self.tree.node_exists(path) {
            return Err(DavError::MethodNotAllowed(
                "The resource you tried to create already exists".into(),
            ));
        }

        if !self.emit("beforeBind", &mut Event::Path { path })? {
            return Ok(false);
        }
        self.tree.create_directory(path)?;
        self.emit("afterBind", &mut Event::Path { path })?;
        self.emit("afterCreateCollection", &mut Event::Path { path })?;
        Ok(true)
    }

    /// Write `data` to a hidden part file next to `path` and move it into
    /// place. The part file never survives a failure.
    fn store(&self, path: &str, data: Bytes, verify_length: bool) -> DavResult<String> {
        let (dir, name) = path::split(path);
        let part_path = path::join(
            dir,
            &format!(".{name}.ocTransferId{}.part", rand::random::<u32>()),
        );
        let mut part = PartFile::new(self.tree.as_ref(), part_path);

        {
            let _lock = LockGuard::acquire(self.tree.as_ref(), path, LockKind::Shared)?;
            let written = data.len() as u64;
            self.tree.write(part.path(), data)?;
            if verify_length {
                self.verify_content_length(written)?;
            }
        }

        let _lock = LockGuard::acquire(self.tree.as_ref(), path, LockKind::Exclusive)?;
        self.tree.move_node(part.path(), path)?;
        part.keep();
        debug!(path, "Stored upload");

        Ok(self.tree.get_node_for_path(path)?.etag)
    }

    fn verify_content_length(&self, written: u64) -> DavResult<()> {
        let Some(request) = self.http_request() else {
            return Ok(());
        };
        if *request.method() != Method::PUT {
            return Ok(());
        }
        let expected = request
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        match expected {
            Some(expected) if expected != written => Err(DavError::BadRequest(format!(
                "Expected filesize of {expected} bytes but read and wrote {written} bytes. Could either be a network problem on the sending side or a problem writing to the storage on the server side."
            ))),
            _ => Ok(()),
        }
    }
}

/// Part file removed on drop unless kept.
struct PartFile<'a> {
    tree: &'a dyn Tree,
    path: String,
    kept: bool,
}

impl<'a> PartFile<'a> {
    fn new(tree: &'a dyn Tree, path: String) -> Self {
        Self {
            tree,
            path,
            kept: false,
        }
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn keep(&mut self) {
        self.kept = true;
    }
}

impl Drop for PartFile<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match self.tree.delete(&self.path) {
            Ok(()) | Err(DavError::NotFound(_)) => {}
            Err(e) => warn!(path = %self.path, error = %e, "Failed to remove part file"),
        }
    }
}

/// Extension methods are always valid tokens.
fn dav_method(name: &str) -> Method {
    Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
}

fn etag_list_contains(header: &str, quoted_etag: &str) -> bool {
    header.split(',').any(|tag| {
        let tag = tag.trim();
        tag.strip_prefix("W/").unwrap_or(tag) == quoted_etag
    })
}

/// RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.timestamp())
}
