//! Explicit context objects handed to plugins at construction.
//!
//! Sessions, the logged-in user and configuration are external
//! collaborators. Plugins receive them as trait objects instead of reaching
//! for process-wide state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DavResult;
use crate::request::Request;

/// Key/value session store of the requesting client.
pub trait Session: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    /// Flush and release the session for this request.
    fn close(&self);
}

/// Login state of the requesting client.
pub trait UserSession: Send + Sync {
    /// Verify credentials and log in.
    ///
    /// Wrong credentials are `Ok(false)`; an account that may not log in with
    /// a password at all fails with [`crate::DavError::PasswordLoginForbidden`].
    fn login(&self, uid: &str, password: &str) -> DavResult<bool>;

    fn is_logged_in(&self) -> bool;

    /// User id of the logged-in user.
    fn user(&self) -> Option<String>;

    fn logout(&self);

    /// Log in from an app token or bearer token carried by the request.
    fn try_token_login(&self, request: &Request) -> bool;

    /// Whether `uid` still owes a second authentication factor.
    fn needs_second_factor(&self, uid: &str) -> bool;
}

/// Lookup of user attributes by id.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, uid: &str) -> Option<String>;
}

/// System-wide and per-user configuration values.
pub trait Config: Send + Sync {
    fn system_value(&self, key: &str) -> Option<Value>;

    fn user_value(&self, uid: &str, app: &str, key: &str) -> Option<String>;

    /// System value read as a list of strings. Missing or non-list values are
    /// an empty list.
    fn system_list(&self, key: &str) -> Vec<String> {
        match self.system_value(key) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Configuration held in memory, loadable from any serde format.
///
/// ```toml
/// [system]
/// "cors.allowed-domains" = ["https://app.example.com"]
///
/// [users.alice.core]
/// domains = '["https://alice.example.com"]'
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub system: HashMap<String, Value>,
    /// uid -> app -> key -> value.
    #[serde(default)]
    pub users: HashMap<String, HashMap<String, HashMap<String, String>>>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_system_value(mut self, key: &str, value: Value) -> Self {
        self.system.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_user_value(mut self, uid: &str, app: &str, key: &str, value: &str) -> Self {
        self.users
            .entry(uid.to_string())
            .or_default()
            .entry(app.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl Config for StaticConfig {
    fn system_value(&self, key: &str) -> Option<Value> {
        self.system.get(key).cloned()
    }

    fn user_value(&self, uid: &str, app: &str, key: &str) -> Option<String> {
        self.users.get(uid)?.get(app)?.get(key).cloned()
    }
}
