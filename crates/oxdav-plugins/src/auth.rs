//! Authentication.
//!
//! [`AuthPlugin`] runs on every method at priority 10 and asks its backends
//! in turn; the first one that authenticates sets the server's current
//! principal. When all of them reject the request, every backend writes its
//! challenge and the request fails with `NotAuthenticated`, carrying the
//! joined rejection reasons.
//!
//! Backends report a wrong password as [`AuthResult::Rejected`]. An account
//! that may not use passwords at all is an error
//! ([`DavError::PasswordLoginForbidden`]) and propagates unchanged.

use std::sync::{Arc, LazyLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::Method;
use oxdav_core::{
    DavError, DavResult, Flow, PRINCIPAL_PREFIX, Request, Response, Server, ServerPlugin, Session,
    UserSession,
};
use regex::Regex;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Session key marking a session that authenticated against the DAV
/// backend. Holds the user id.
pub const DAV_AUTHENTICATED: &str = "AUTHENTICATED_TO_DAV_BACKEND";

/// Session key of the CSRF token issued to browser sessions.
pub const CSRF_TOKEN: &str = "requesttoken";

/// Outcome of one backend's check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authenticated as this principal URI.
    Authenticated(String),
    /// Not authenticated, with a reason for the client.
    Rejected(String),
}

/// One way of authenticating a request.
pub trait AuthBackend: Send + Sync {
    fn check(&self, request: &Request, response: &mut Response) -> DavResult<AuthResult>;

    /// Write the challenge for this scheme into a 401 response.
    fn challenge(&self, request: &Request, response: &mut Response);
}

/// Aggregates [`AuthBackend`]s.
pub struct AuthPlugin {
    backends: Vec<Arc<dyn AuthBackend>>,
}

impl AuthPlugin {
    pub fn new(backends: Vec<Arc<dyn AuthBackend>>) -> Self {
        Self { backends }
    }

    fn before_method(&self, server: &Server, request: &Request, response: &mut Response) -> DavResult<()> {
        if server.current_principal().is_some() {
            return Ok(());
        }

        let mut reasons = Vec::new();
        for backend in &self.backends {
            match backend.check(request, response)? {
                AuthResult::Authenticated(principal) => {
                    debug!(principal = %principal, "Authenticated");
                    server.set_current_principal(Some(principal));
                    return Ok(());
                }
                AuthResult::Rejected(reason) => reasons.push(reason),
            }
        }

        for backend in &self.backends {
            backend.challenge(request, response);
        }
        Err(DavError::NotAuthenticated(reasons.join(", ")))
    }
}

impl ServerPlugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        server.on("beforeMethod:*", 10, move |server, event| {
            if let Some((request, response)) = event.method_parts() {
                self.before_method(server, request, response)?;
            }
            Ok(Flow::Continue)
        });
    }
}

/// Official sync clients, which never carry a CSRF token.
static SYNC_CLIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Mozilla/5\.0 \((?:[A-Za-z ]+\) (?:mirall|csyncoC)/|Android\) (?:ownCloud|Nextcloud)-android|iOS\) (?:ownCloud|Nextcloud)-iOS)",
    )
    .expect("valid regex literal")
});

/// `Authorization: Basic` credentials.
fn basic_credentials(request: &Request) -> Option<(String, String)> {
    let header = request.header("Authorization")?;
    let (scheme, encoded) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Session-aware Basic authentication.
pub struct PasswordAuth {
    session: Arc<dyn Session>,
    user_session: Arc<dyn UserSession>,
    realm: String,
}

impl PasswordAuth {
    pub fn new(session: Arc<dyn Session>, user_session: Arc<dyn UserSession>) -> Self {
        Self {
            session,
            user_session,
            realm: "oxdav".to_string(),
        }
    }

    #[must_use]
    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = realm.to_string();
        self
    }

    /// Whether the session already authenticated against the DAV backend as
    /// `uid`.
    pub fn is_dav_authenticated(&self, uid: &str) -> bool {
        self.session
            .get(DAV_AUTHENTICATED)
            .is_some_and(|marker| marker == uid)
    }

    /// Check credentials, reusing a DAV-authenticated session.
    pub fn validate_user_pass(&self, uid: &str, password: &str) -> DavResult<bool> {
        if let Some(current) = self.user_session.user()
            && self.is_dav_authenticated(&current)
        {
            self.session.close();
            return Ok(true);
        }

        let result = self.user_session.login(uid, password);
        if let Ok(true) = result
            && let Some(user) = self.user_session.user()
        {
            self.session.set(DAV_AUTHENTICATED, &user);
        }
        self.session.close();
        result
    }

    fn passes_csrf_check(&self, request: &Request) -> bool {
        match (request.header(CSRF_TOKEN), self.session.get(CSRF_TOKEN)) {
            (Some(sent), Some(expected)) => bool::from(sent.as_bytes().ct_eq(expected.as_bytes())),
            _ => false,
        }
    }

    fn requires_csrf_check(&self, request: &Request) -> bool {
        if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
            return false;
        }
        if request
            .header("User-Agent")
            .is_some_and(|ua| SYNC_CLIENT.is_match(ua))
        {
            return false;
        }
        let Some(uid) = self.user_session.user() else {
            return false;
        };
        if *request.method() == Method::POST {
            return true;
        }
        !self.is_dav_authenticated(&uid)
    }

    fn principal_for_current_user(&self) -> DavResult<String> {
        self.user_session
            .user()
            .map(|uid| format!("{PRINCIPAL_PREFIX}{uid}"))
            .ok_or_else(|| DavError::Internal("login succeeded without a user".into()))
    }
}

impl AuthBackend for PasswordAuth {
    fn check(&self, request: &Request, response: &mut Response) -> DavResult<AuthResult> {
        let mut forced_logout = false;
        if self.requires_csrf_check(request) && !self.passes_csrf_check(request) {
            if *request.method() != Method::POST {
                return Err(DavError::NotAuthenticated("CSRF check not passed.".into()));
            }
            forced_logout = true;
        }

        if forced_logout {
            debug!("CSRF check failed on POST, re-checking credentials");
            self.user_session.logout();
        } else if let Some(uid) = self.user_session.user() {
            if self.user_session.needs_second_factor(&uid) {
                return Err(DavError::NotAuthenticated("2FA challenge not passed.".into()));
            }
            let marker = self.session.get(DAV_AUTHENTICATED);
            let cookie_only = marker.as_deref() == Some(uid.as_str()) && !request.has_header("Authorization");
            if marker.is_none() || cookie_only {
                self.session.close();
                return Ok(AuthResult::Authenticated(format!("{PRINCIPAL_PREFIX}{uid}")));
            }
        }

        let is_ajax = request
            .header("X-Requested-With")
            .is_some_and(|v| v.split(',').any(|p| p.trim() == "XMLHttpRequest"));
        if !self.user_session.is_logged_in() && !request.has_header("Authorization") && is_ajax {
            response.add_header(
                "WWW-Authenticate",
                &format!("DummyBasic realm=\"{}\"", self.realm),
            );
            return Err(DavError::NotAuthenticated(
                "Cannot authenticate over ajax calls".into(),
            ));
        }

        let Some((uid, password)) = basic_credentials(request) else {
            return Ok(AuthResult::Rejected(
                "No 'Authorization: Basic' header found. Either the client didn't send one, or the server is misconfigured".into(),
            ));
        };
        if !self.validate_user_pass(&uid, &password)? {
            return Ok(AuthResult::Rejected("Username or password was incorrect".into()));
        }
        // The login backend may resolve an alias (email) to the real uid.
        Ok(AuthResult::Authenticated(self.principal_for_current_user()?))
    }

    fn challenge(&self, _request: &Request, response: &mut Response) {
        response.add_header(
            "WWW-Authenticate",
            &format!("Basic realm=\"{}\", charset=\"UTF-8\"", self.realm),
        );
    }
}

/// Bearer authentication against an established external session.
pub struct BearerAuth {
    session: Arc<dyn Session>,
    user_session: Arc<dyn UserSession>,
}

impl BearerAuth {
    pub fn new(session: Arc<dyn Session>, user_session: Arc<dyn UserSession>) -> Self {
        Self {
            session,
            user_session,
        }
    }

    /// Principal for the request's bearer token, trying a token login when
    /// nobody is logged in yet.
    pub fn validate_bearer_token(&self, request: &Request) -> Option<String> {
        if !self.user_session.is_logged_in() {
            self.user_session.try_token_login(request);
        }
        let uid = self.user_session.user()?;
        self.session.close();
        Some(format!("{PRINCIPAL_PREFIX}{uid}"))
    }
}

impl AuthBackend for BearerAuth {
    fn check(&self, request: &Request, _response: &mut Response) -> DavResult<AuthResult> {
        let has_bearer = request
            .header("Authorization")
            .and_then(|h| h.split_once(' '))
            .is_some_and(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"));
        if !has_bearer {
            return Ok(AuthResult::Rejected(
                "No 'Authorization: Bearer' header found. Either the client didn't send one, or the server is mis-configured".into(),
            ));
        }
        Ok(match self.validate_bearer_token(request) {
            Some(principal) => AuthResult::Authenticated(principal),
            None => AuthResult::Rejected("Bearer token was incorrect".into()),
        })
    }

    fn challenge(&self, _request: &Request, _response: &mut Response) {}
}
