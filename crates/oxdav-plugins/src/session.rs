//! In-memory session, account and login collaborators.
//!
//! These back the demo server and the test suites. A deployment plugs its
//! own [`Session`] / [`UserSession`] implementations into the factory
//! instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use oxdav_core::{DavError, DavResult, Request, Session, UserDirectory, UserSession};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Session store for one client.
#[derive(Debug, Default)]
pub struct MemorySession {
    values: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`Session::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Session for MemorySession {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A user known to [`Accounts`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub uid: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Password logins fail with `PasswordLoginForbidden`; only app tokens work.
    #[serde(default)]
    pub password_login_disabled: bool,
    /// Tokens accepted as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub app_tokens: Vec<String>,
    /// The user has a second factor configured and has not passed it yet.
    #[serde(default)]
    pub second_factor_pending: bool,
}

impl Account {
    pub fn new(uid: &str, password: &str) -> Self {
        Self {
            uid: uid.to_string(),
            password: password.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn with_app_token(mut self, token: &str) -> Self {
        self.app_tokens.push(token.to_string());
        self
    }
}

/// Account registry shared by every request.
#[derive(Debug, Default)]
pub struct Accounts {
    accounts: RwLock<HashMap<String, Account>>,
}

impl Accounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let registry = Self::new();
        for account in accounts {
            registry.add(account);
        }
        registry
    }

    pub fn add(&self, account: Account) {
        self.accounts.write().insert(account.uid.clone(), account);
    }

    pub fn get(&self, uid: &str) -> Option<Account> {
        self.accounts.read().get(uid).cloned()
    }

    /// Check a password. Unknown users and wrong passwords are `Ok(false)`.
    pub fn verify_password(&self, uid: &str, password: &str) -> DavResult<bool> {
        let accounts = self.accounts.read();
        let Some(account) = accounts.get(uid) else {
            return Ok(false);
        };
        if account.password_login_disabled {
            return Err(DavError::PasswordLoginForbidden);
        }
        Ok(bool::from(
            account.password.as_bytes().ct_eq(password.as_bytes()),
        ))
    }

    /// Owner of an app token.
    pub fn uid_for_token(&self, token: &str) -> Option<String> {
        self.accounts
            .read()
            .values()
            .find(|account| {
                account
                    .app_tokens
                    .iter()
                    .any(|t| bool::from(t.as_bytes().ct_eq(token.as_bytes())))
            })
            .map(|account| account.uid.clone())
    }

    pub fn set_second_factor_pending(&self, uid: &str, pending: bool) {
        if let Some(account) = self.accounts.write().get_mut(uid) {
            account.second_factor_pending = pending;
        }
    }
}

impl UserDirectory for Accounts {
    fn display_name(&self, uid: &str) -> Option<String> {
        let accounts = self.accounts.read();
        let account = accounts.get(uid)?;
        Some(account.display_name.clone().unwrap_or_else(|| uid.to_string()))
    }
}

/// Login state of one client, backed by [`Accounts`].
#[derive(Debug)]
pub struct MemoryUserSession {
    accounts: Arc<Accounts>,
    current: Mutex<Option<String>>,
}

impl MemoryUserSession {
    /// Logged-out session.
    pub fn new(accounts: Arc<Accounts>) -> Self {
        Self {
            accounts,
            current: Mutex::new(None),
        }
    }

    /// Session already logged in as `uid`, as after a cookie login.
    pub fn logged_in(accounts: Arc<Accounts>, uid: &str) -> Self {
        Self {
            accounts,
            current: Mutex::new(Some(uid.to_string())),
        }
    }
}

impl UserSession for MemoryUserSession {
    fn login(&self, uid: &str, password: &str) -> DavResult<bool> {
        let ok = self.accounts.verify_password(uid, password)?;
        if ok {
            debug!(uid, "Password login");
            *self.current.lock() = Some(uid.to_string());
        }
        Ok(ok)
    }

    fn is_logged_in(&self) -> bool {
        self.current.lock().is_some()
    }

    fn user(&self) -> Option<String> {
        self.current.lock().clone()
    }

    fn logout(&self) {
        *self.current.lock() = None;
    }

    fn try_token_login(&self, request: &Request) -> bool {
        let token = request
            .header("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim);
        let Some(uid) = token.and_then(|t| self.accounts.uid_for_token(t)) else {
            return false;
        };
        debug!(uid = %uid, "Token login");
        *self.current.lock() = Some(uid);
        true
    }

    fn needs_second_factor(&self, uid: &str) -> bool {
        self.accounts
            .get(uid)
            .is_some_and(|a| a.second_factor_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn accounts() -> Arc<Accounts> {
        Arc::new(Accounts::from_accounts([
            Account::new("alice", "secret").with_display_name("Alice A."),
            Account {
                password_login_disabled: true,
                ..Account::new("svc", "pw").with_app_token("tok-123")
            },
        ]))
    }

    #[test]
    fn test_verify_password() {
        let accounts = accounts();
        assert!(accounts.verify_password("alice", "secret").unwrap());
        assert!(!accounts.verify_password("alice", "wrong").unwrap());
        assert!(!accounts.verify_password("nobody", "secret").unwrap());
        assert!(matches!(
            accounts.verify_password("svc", "pw"),
            Err(DavError::PasswordLoginForbidden)
        ));
    }

    #[test]
    fn test_display_name_falls_back_to_uid() {
        let accounts = accounts();
        assert_eq!(accounts.display_name("alice").as_deref(), Some("Alice A."));
        assert_eq!(accounts.display_name("svc").as_deref(), Some("svc"));
        assert_eq!(accounts.display_name("nobody"), None);
    }

    #[test]
    fn test_user_session_login_logout() {
        let session = MemoryUserSession::new(accounts());
        assert!(!session.is_logged_in());
        assert!(!session.login("alice", "wrong").unwrap());
        assert!(session.login("alice", "secret").unwrap());
        assert_eq!(session.user().as_deref(), Some("alice"));
        session.logout();
        assert!(!session.is_logged_in());
    }

    #[test]
    fn test_token_login() {
        let session = MemoryUserSession::new(accounts());
        let request = Request::new(Method::GET, "")
            .unwrap()
            .with_header("Authorization", "Bearer tok-123");
        assert!(session.try_token_login(&request));
        assert_eq!(session.user().as_deref(), Some("svc"));

        let session = MemoryUserSession::new(accounts());
        let request = Request::new(Method::GET, "")
            .unwrap()
            .with_header("Authorization", "Bearer nope");
        assert!(!session.try_token_login(&request));
    }

    #[test]
    fn test_memory_session_close() {
        let session = MemorySession::new();
        session.set("k", "v");
        assert_eq!(session.get("k").as_deref(), Some("v"));
        session.remove("k");
        assert_eq!(session.get("k"), None);
        assert!(!session.is_closed());
        session.close();
        assert!(session.is_closed());
    }
}
