//! TOML server configuration.
//!
//! ```toml
//! port = 8080
//! base_uri = "/remote.php/webdav"
//!
//! [[users]]
//! uid = "alice"
//! password = "secret"
//! app_tokens = ["sync-token"]
//!
//! [[files]]
//! path = "welcome.txt"
//! content = "Hello"
//!
//! [system]
//! "cors.allowed-domains" = ["https://app.example.com"]
//!
//! [user_values.alice.core]
//! domains = '["https://other.example.com"]'
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use oxdav_core::{DavError, MemoryTree, StaticConfig, Tree};
use oxdav_plugins::{Account, Accounts, ServerFactory, TreeQuota};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to seed demo file {path}: {source}")]
    Seed {
        path: String,
        #[source]
        source: DavError,
    },
}

/// A file placed in the in-memory tree at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

/// Configuration for the WebDAV server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_address: IpAddr,
    /// Port to bind to (0 = auto-assign).
    pub port: u16,
    /// URI prefix the tree is served under.
    pub base_uri: String,
    /// Allow `Depth: infinity` on PROPFIND.
    pub depth_infinity: bool,
    /// Serve without authentication.
    pub public: bool,
    pub compression: bool,
    pub realm: String,
    /// Total bytes the tree may hold. Unlimited when absent.
    pub quota_bytes: Option<u64>,
    pub users: Vec<Account>,
    pub files: Vec<SeedFile>,
    /// System configuration values, such as `cors.allowed-domains`.
    pub system: BTreeMap<String, serde_json::Value>,
    /// Per-user values: uid, then app, then key.
    pub user_values: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            base_uri: "/".to_string(),
            depth_infinity: false,
            public: false,
            compression: true,
            realm: "oxdav".to_string(),
            quota_bytes: None,
            users: Vec::new(),
            files: Vec::new(),
            system: BTreeMap::new(),
            user_values: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load a configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), users = config.users.len(), "Loaded config");
        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Collaborator configuration seen by the plugins.
    pub fn static_config(&self) -> StaticConfig {
        let mut config = StaticConfig::new();
        for (key, value) in &self.system {
            config = config.with_system_value(key, value.clone());
        }
        for (uid, apps) in &self.user_values {
            for (app, values) in apps {
                for (key, value) in values {
                    config = config.with_user_value(uid, app, key, value);
                }
            }
        }
        config
    }

    /// Build a factory over an in-memory tree seeded with the configured
    /// files. The first configured user owns the tree.
    pub fn build_factory(&self) -> Result<ServerFactory, ConfigError> {
        let owner = self.users.first().map(|u| u.uid.clone());
        let tree = MemoryTree::with_owner(owner);
        for file in &self.files {
            let seeded = if file.path.ends_with('/') {
                tree.add_directory(&file.path)
            } else {
                tree.add_file(&file.path, file.content.clone()).map(|_| ())
            };
            seeded.map_err(|source| ConfigError::Seed {
                path: file.path.clone(),
                source,
            })?;
        }

        let tree: Arc<dyn Tree> = Arc::new(tree);
        let accounts = Arc::new(Accounts::from_accounts(self.users.iter().cloned()));
        Ok(ServerFactory::new(Arc::clone(&tree), accounts)
            .with_quota(Arc::new(TreeQuota::new(tree, self.quota_bytes)))
            .with_config(Arc::new(self.static_config()))
            .with_base_uri(&self.base_uri)
            .with_depth_infinity(self.depth_infinity)
            .public(self.public)
            .with_realm(&self.realm)
            .with_compression(self.compression))
    }
}
