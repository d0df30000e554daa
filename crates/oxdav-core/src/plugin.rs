//! Plugin contract.

use std::sync::Arc;

use http::Method;

use crate::server::Server;

/// A unit of middleware attached to a [`Server`].
///
/// Plugins subscribe to events in [`initialize`](ServerPlugin::initialize).
/// Listeners receive the server as their first argument, so a plugin never
/// needs to store a reference to it.
pub trait ServerPlugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &'static str;

    /// Register listeners. Called exactly once, when the plugin is added.
    fn initialize(self: Arc<Self>, server: &Server);

    /// Extra HTTP methods this plugin handles on `path`.
    fn http_methods(&self, _path: &str) -> Vec<Method> {
        Vec::new()
    }

    /// Compliance classes advertised in the `DAV` header.
    fn features(&self) -> Vec<&'static str> {
        Vec::new()
    }
}
