//! Per-request server composition.
//!
//! Backends, the tree and configuration are shared by every request; the
//! [`Server`], its plugins, their preload caches and the client's session
//! are created fresh by [`ServerFactory::create_server`].

use std::sync::Arc;

use oxdav_core::{Config, Request, Response, Server, StaticConfig, Tree};
use tracing::debug;

use crate::auth::{AuthBackend, AuthPlugin, BearerAuth, PasswordAuth};
use crate::comments::{CommentsBackend, CommentsPlugin, MemoryComments};
use crate::compression::CompressionPlugin;
use crate::cors::CorsPlugin;
use crate::custom_properties::{CustomPropertiesPlugin, MemoryPropertyStore, PropertyStore};
use crate::exception_logger::ExceptionLoggerPlugin;
use crate::fake_lock::FakeLockPlugin;
use crate::files::FilesPlugin;
use crate::quota::{QuotaPlugin, QuotaSource, TreeQuota};
use crate::session::{Accounts, MemorySession, MemoryUserSession};
use crate::shares::{MemoryShares, ShareBackend, SharesPlugin};
use crate::tags::{MemoryTags, TagBackend, TagsPlugin};

pub struct ServerFactory {
    tree: Arc<dyn Tree>,
    accounts: Arc<Accounts>,
    config: Arc<dyn Config>,
    tags: Arc<dyn TagBackend>,
    shares: Arc<dyn ShareBackend>,
    comments: Arc<dyn CommentsBackend>,
    properties: Arc<dyn PropertyStore>,
    quota: Arc<dyn QuotaSource>,
    base_uri: String,
    depth_infinity: bool,
    public: bool,
    realm: String,
    instance_id: String,
    compression: bool,
}

impl ServerFactory {
    /// Factory with in-memory backends, no quota limit and an empty
    /// configuration.
    pub fn new(tree: Arc<dyn Tree>, accounts: Arc<Accounts>) -> Self {
        Self {
            quota: Arc::new(TreeQuota::new(Arc::clone(&tree), None)),
            tree,
            accounts,
            config: Arc::new(StaticConfig::new()),
            tags: Arc::new(MemoryTags::new()),
            shares: Arc::new(MemoryShares::new()),
            comments: Arc::new(MemoryComments::new()),
            properties: Arc::new(MemoryPropertyStore::new()),
            base_uri: "/".to_string(),
            depth_infinity: false,
            public: false,
            realm: "oxdav".to_string(),
            instance_id: "oxdav".to_string(),
            compression: true,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Arc<dyn Config>) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Arc<dyn TagBackend>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_shares(mut self, shares: Arc<dyn ShareBackend>) -> Self {
        self.shares = shares;
        self
    }

    #[must_use]
    pub fn with_comments(mut self, comments: Arc<dyn CommentsBackend>) -> Self {
        self.comments = comments;
        self
    }

    #[must_use]
    pub fn with_property_store(mut self, properties: Arc<dyn PropertyStore>) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_quota(mut self, quota: Arc<dyn QuotaSource>) -> Self {
        self.quota = quota;
        self
    }

    #[must_use]
    pub fn with_base_uri(mut self, base_uri: &str) -> Self {
        self.base_uri = base_uri.to_string();
        self
    }

    #[must_use]
    pub fn with_depth_infinity(mut self, enabled: bool) -> Self {
        self.depth_infinity = enabled;
        self
    }

    /// Serve the anonymous public surface: no authentication, wildcard CORS.
    #[must_use]
    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    #[must_use]
    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = realm.to_string();
        self
    }

    #[must_use]
    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn tree(&self) -> &Arc<dyn Tree> {
        &self.tree
    }

    pub fn accounts(&self) -> &Arc<Accounts> {
        &self.accounts
    }

    /// URI prefix the tree is served under.
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Build the server for one request.
    pub fn create_server(&self) -> Server {
        let session = Arc::new(MemorySession::new());
        let user_session = Arc::new(MemoryUserSession::new(Arc::clone(&self.accounts)));

        let mut server = Server::new(Arc::clone(&self.tree))
            .with_base_uri(&self.base_uri)
            .with_depth_infinity(self.depth_infinity);

        server.add_plugin(Arc::new(ExceptionLoggerPlugin::new("webdav")));
        server.add_plugin(Arc::new(
            CorsPlugin::new(user_session.clone(), Arc::clone(&self.config)).public(self.public),
        ));
        if !self.public {
            let password: Arc<dyn AuthBackend> = Arc::new(
                PasswordAuth::new(session.clone(), user_session.clone()).with_realm(&self.realm),
            );
            let bearer: Arc<dyn AuthBackend> = Arc::new(BearerAuth::new(session, user_session));
            server.add_plugin(Arc::new(AuthPlugin::new(vec![password, bearer])));
        }
        server.add_plugin(Arc::new(FakeLockPlugin::new()));
        server.add_plugin(Arc::new(QuotaPlugin::new(Arc::clone(&self.quota))));
        server.add_plugin(Arc::new(FilesPlugin::new(
            self.accounts.clone(),
            &self.instance_id,
        )));
        server.add_plugin(Arc::new(TagsPlugin::new(Arc::clone(&self.tags))));
        server.add_plugin(Arc::new(SharesPlugin::new(Arc::clone(&self.shares))));
        server.add_plugin(Arc::new(CommentsPlugin::new(Arc::clone(&self.comments))));
        server.add_plugin(Arc::new(CustomPropertiesPlugin::new(Arc::clone(&self.properties))));
        if self.compression {
            server.add_plugin(Arc::new(CompressionPlugin::new()));
        }
        debug!(plugins = server.plugins().len(), "Created request server");
        server
    }

    /// Run one request through a fresh server.
    pub fn handle(&self, request: Request) -> Response {
        self.create_server().handle(request)
    }
}
