//! Cross-origin resource sharing for browser clients on other domains.
//!
//! Allowed origins are the system list `cors.allowed-domains` plus the
//! logged-in user's own list (user value `core`/`domains`, a JSON array).
//! A disallowed origin gets no CORS headers at all and the request proceeds
//! as a plain DAV request. An allowed preflight (`OPTIONS`) is answered
//! here and never reaches authentication.
//!
//! The `beforeMethod` check runs ahead of authentication and only sees a
//! session login. Requests authenticated by the auth plugin itself (Basic
//! or bearer) get their user's allow-list applied in `afterMethod`.

use std::sync::Arc;

use http::{Method, StatusCode};
use oxdav_core::{Config, DEFAULT_PRIORITY, DavResult, Flow, Request, Response, Server, ServerPlugin, UserSession};
use tracing::debug;

/// Methods always offered to cross-origin callers.
const BASELINE_METHODS: &[&str] = &[
    "GET", "OPTIONS", "POST", "PUT", "DELETE", "MKCOL", "PROPFIND", "PATCH", "PROPPATCH", "REPORT",
];

/// Methods that modify data; never offered to anonymous callers.
const AUTHENTICATED_METHODS: &[&str] = &[
    "PUT", "DELETE", "MKCOL", "PROPPATCH", "MOVE", "COPY", "LOCK", "UNLOCK", "POST", "PATCH",
];

const BASELINE_HEADERS: &[&str] = &[
    "authorization",
    "OCS-APIREQUEST",
    "Origin",
    "X-Requested-With",
    "Content-Type",
    "Access-Control-Allow-Origin",
    "X-Request-ID",
    "X-OC-Mtime",
    "OC-Checksum",
    "OC-Total-Length",
    "Depth",
    "Destination",
    "Overwrite",
    "If",
    "If-Match",
    "If-None-Match",
    "Range",
    "requesttoken",
];

const EXPOSED_HEADERS: &[&str] = &[
    "Content-Location",
    "DAV",
    "ETag",
    "Link",
    "Lock-Token",
    "OC-ETag",
    "OC-Checksum",
    "OC-FileId",
    "Webdav-Location",
    "X-Sabre-Status",
    "X-OC-MTime",
    "X-NC-OwnerId",
    "X-NC-Permissions",
];

/// Whether an `Origin` value is exempt from CORS handling altogether.
pub fn is_ignored_origin(origin: Option<&str>) -> bool {
    match origin {
        None | Some("" | "null") => true,
        Some(origin) => origin.starts_with("moz-extension:") || origin.starts_with("chrome-extension:"),
    }
}

pub struct CorsPlugin {
    user_session: Arc<dyn UserSession>,
    config: Arc<dyn Config>,
    /// Serving the anonymous public surface: anonymous callers get `*`.
    public: bool,
}

impl CorsPlugin {
    pub fn new(user_session: Arc<dyn UserSession>, config: Arc<dyn Config>) -> Self {
        Self {
            user_session,
            config,
            public: false,
        }
    }

    #[must_use]
    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Origins `user` may call from, system-wide entries first.
    pub fn allowed_origins(&self, user: Option<&str>) -> Vec<String> {
        let mut origins = self.config.system_list("cors.allowed-domains");
        if let Some(uid) = user
            && let Some(raw) = self.config.user_value(uid, "core", "domains")
        {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(domains) => origins.extend(domains),
                Err(e) => debug!(uid, error = %e, "Ignoring malformed CORS domain list"),
            }
        }
        origins
    }

    fn allow_methods(&self, server: &Server, path: &str, anonymous: bool) -> String {
        let mut methods: Vec<String> = server
            .allowed_methods(path)
            .iter()
            .map(|m| m.as_str().to_string())
            .collect();
        for method in BASELINE_METHODS {
            if !methods.iter().any(|m| m == method) {
                methods.push((*method).to_string());
            }
        }
        if anonymous {
            methods.retain(|m| !AUTHENTICATED_METHODS.contains(&m.as_str()));
        }
        methods.join(",")
    }

    fn allow_headers(&self) -> String {
        let mut headers = self.config.system_list("cors.allowed-headers");
        headers.extend(BASELINE_HEADERS.iter().map(ToString::to_string));
        headers.join(",")
    }

    /// `Access-Control-Allow-Origin` value for `origin`, or `None` when the
    /// origin is not allowed.
    fn allow_origin(&self, origin: &str, user: Option<&str>) -> Option<String> {
        if user.is_none() && self.public {
            return Some("*".to_string());
        }
        if self.allowed_origins(user).iter().any(|o| o == origin) {
            return Some(origin.to_string());
        }
        debug!(origin, "Origin not allowed");
        None
    }

    fn set_origin_headers(response: &mut Response, allow_origin: &str) {
        response.set_header("Access-Control-Allow-Origin", allow_origin);
        response.set_header("Access-Control-Expose-Headers", &EXPOSED_HEADERS.join(","));
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }

    fn handle(&self, server: &Server, request: &Request, response: &mut Response) -> DavResult<Flow> {
        let origin = request.header("Origin");
        if is_ignored_origin(origin) {
            return Ok(Flow::Continue);
        }
        let Some(origin) = origin else {
            return Ok(Flow::Continue);
        };

        let user = self.user_session.user();
        let anonymous = user.is_none();
        let Some(allow_origin) = self.allow_origin(origin, user.as_deref()) else {
            return Ok(Flow::Continue);
        };
        Self::set_origin_headers(response, &allow_origin);

        if *request.method() != Method::OPTIONS {
            return Ok(Flow::Continue);
        }
        response.set_header(
            "Access-Control-Allow-Methods",
            &self.allow_methods(server, request.path(), anonymous),
        );
        response.set_header("Access-Control-Allow-Headers", &self.allow_headers());
        response.set_header("Access-Control-Max-Age", "1728000");
        response.set_header("Content-Length", "0");
        response.set_status(StatusCode::OK);
        Ok(Flow::Stop)
    }

    /// Re-check the origin once the authenticated principal is known.
    fn handle_after(&self, server: &Server, request: &Request, response: &mut Response) {
        if response.header("Access-Control-Allow-Origin").is_some() {
            return;
        }
        let Some(origin) = request.header("Origin").filter(|o| !is_ignored_origin(Some(o))) else {
            return;
        };
        let Some(user) = server.current_user() else {
            return;
        };
        if let Some(allow_origin) = self.allow_origin(origin, Some(&user)) {
            Self::set_origin_headers(response, &allow_origin);
        }
    }
}

impl ServerPlugin for CorsPlugin {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        let plugin = Arc::clone(&self);
        server.on("beforeMethod:*", 5, move |server, event| match event.method_parts() {
            Some((request, response)) => plugin.handle(server, request, response),
            None => Ok(Flow::Continue),
        });
        server.on("afterMethod:*", DEFAULT_PRIORITY, move |server, event| {
            if let Some((request, response)) = event.method_parts() {
                self.handle_after(server, request, response);
            }
            Ok(Flow::Continue)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Account, Accounts, MemoryUserSession};
    use oxdav_core::{MemoryTree, StaticConfig};
    use serde_json::json;

    const ORIGIN: &str = "https://requesterdomain.tld";

    fn server(config: StaticConfig, logged_in: bool, public: bool) -> Server {
        let accounts = Arc::new(Accounts::from_accounts([Account::new("alice", "pw")]));
        let session: Arc<dyn UserSession> = if logged_in {
            Arc::new(MemoryUserSession::logged_in(accounts, "alice"))
        } else {
            Arc::new(MemoryUserSession::new(accounts))
        };
        let mut server = Server::new(Arc::new(MemoryTree::new()));
        server.add_plugin(Arc::new(CorsPlugin::new(session, Arc::new(config)).public(public)));
        server
    }

    fn options(origin: &str) -> Request {
        Request::new(Method::OPTIONS, "")
            .unwrap()
            .with_header("Origin", origin)
    }

    #[test]
    fn test_user_allow_list_echoes_origin() {
        let config = StaticConfig::new().with_user_value("alice", "core", "domains", &json!([ORIGIN]).to_string());
        let response = server(config, true, false).handle(options(ORIGIN));
        assert_eq!(response.status(), Some(StatusCode::OK));
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some(ORIGIN));
        let methods = response.header("Access-Control-Allow-Methods").unwrap();
        assert!(methods.contains("PROPFIND"));
        assert!(methods.contains("PUT"));
        // The preflight never reached the core OPTIONS handler.
        assert_eq!(response.header("DAV"), None);
    }

    #[test]
    fn test_empty_allow_list_falls_through_to_dav() {
        let response = server(StaticConfig::new(), true, false).handle(options(ORIGIN));
        assert_eq!(response.status(), Some(StatusCode::OK));
        assert_eq!(response.header("Access-Control-Allow-Origin"), None);
        assert_eq!(response.header("Access-Control-Allow-Methods"), None);
        assert!(response.header("DAV").is_some());
    }

    #[test]
    fn test_system_list_and_extra_headers() {
        let config = StaticConfig::new()
            .with_system_value("cors.allowed-domains", json!([ORIGIN]))
            .with_system_value("cors.allowed-headers", json!(["X-Custom"]));
        let response = server(config, true, false).handle(options(ORIGIN));
        let headers = response.header("Access-Control-Allow-Headers").unwrap();
        assert!(headers.starts_with("X-Custom,"));
        assert!(headers.contains("Depth"));
    }

    #[test]
    fn test_anonymous_public_surface_gets_wildcard_and_read_methods() {
        let response = server(StaticConfig::new(), false, true).handle(options(ORIGIN));
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
        let methods: Vec<&str> = response
            .header("Access-Control-Allow-Methods")
            .unwrap()
            .split(',')
            .collect();
        assert!(methods.contains(&"GET"));
        assert!(methods.contains(&"PROPFIND"));
        for method in AUTHENTICATED_METHODS {
            assert!(!methods.contains(method), "{method} offered anonymously");
        }
    }

    #[test]
    fn test_ignored_origins() {
        for origin in [None, Some(""), Some("null"), Some("moz-extension://abc"), Some("chrome-extension://abc")] {
            assert!(is_ignored_origin(origin), "{origin:?}");
        }
        assert!(!is_ignored_origin(Some(ORIGIN)));

        let config = StaticConfig::new().with_system_value("cors.allowed-domains", json!(["null"]));
        let response = server(config, true, false).handle(options("null"));
        assert_eq!(response.header("Access-Control-Allow-Origin"), None);
    }

    #[test]
    fn test_user_allow_list_applies_after_header_authentication() {
        let config = StaticConfig::new().with_user_value("alice", "core", "domains", &json!([ORIGIN]).to_string());
        let server = server(config, false, false);
        server.on("beforeMethod:*", 10, |server, _| {
            server.set_current_principal(Some("principals/users/alice".into()));
            Ok(Flow::Continue)
        });

        let request = Request::new(Method::from_bytes(b"PROPFIND").unwrap(), "")
            .unwrap()
            .with_header("Origin", ORIGIN);
        let response = server.handle(request);
        assert_eq!(response.status(), Some(StatusCode::MULTI_STATUS));
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some(ORIGIN));
        assert_eq!(response.header_values("Vary").iter().filter(|v| **v == "Origin").count(), 1);
    }

    #[test]
    fn test_non_preflight_request_gets_origin_and_continues() {
        let config = StaticConfig::new().with_system_value("cors.allowed-domains", json!([ORIGIN]));
        let request = Request::new(Method::from_bytes(b"PROPFIND").unwrap(), "")
            .unwrap()
            .with_header("Origin", ORIGIN);
        let response = server(config, true, false).handle(request);
        assert_eq!(response.status(), Some(StatusCode::MULTI_STATUS));
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some(ORIGIN));
        assert!(response.header("Access-Control-Allow-Methods").is_none());
    }
}
