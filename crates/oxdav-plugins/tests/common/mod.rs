//! Shared fixtures for plugin integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::Method;
use oxdav_core::{MemoryTree, Request, Response};
use oxdav_plugins::{Account, Accounts, ServerFactory};

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";
pub const APP_TOKEN: &str = "app-token-0123";

pub fn accounts() -> Arc<Accounts> {
    Arc::new(Accounts::from_accounts([
        Account::new(USER, PASSWORD)
            .with_display_name("Alice")
            .with_app_token(APP_TOKEN),
        Account::new("bob", "hunter2"),
    ]))
}

/// Tree owned by alice with a small document folder.
pub fn tree() -> Arc<MemoryTree> {
    let tree = MemoryTree::with_owner(Some(USER.to_string()));
    tree.add_file("docs/a.txt", "alpha").expect("add file");
    tree.add_file("docs/b.txt", "bravo").expect("add file");
    tree.add_directory("docs/sub").expect("add directory");
    tree.add_file("notes.md", "# notes").expect("add file");
    Arc::new(tree)
}

pub fn factory(tree: &Arc<MemoryTree>) -> ServerFactory {
    ServerFactory::new(Arc::clone(tree) as Arc<dyn oxdav_core::Tree>, accounts())
}

pub fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

pub fn request(method: &str, path: &str) -> Request {
    Request::new(Method::from_bytes(method.as_bytes()).expect("method"), path).expect("request")
}

/// Request carrying alice's Basic credentials.
pub fn authed(method: &str, path: &str) -> Request {
    request(method, path).with_header("Authorization", &basic(USER, PASSWORD))
}

pub fn body_text(response: &Response) -> String {
    String::from_utf8(response.body().to_vec()).expect("utf-8 body")
}

pub fn propfind_body(props: &[&str]) -> String {
    let props: String = props.iter().map(|p| format!("<{p}/>")).collect();
    format!(
        r#"<?xml version="1.0"?><d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns" xmlns:nc="http://nextcloud.org/ns"><d:prop>{props}</d:prop></d:propfind>"#
    )
}
