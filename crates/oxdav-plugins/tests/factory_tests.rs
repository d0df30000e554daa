//! End-to-end tests running requests through the fully wired plugin stack.

mod common;

use std::io::Read as _;
use std::sync::Arc;

use common::*;
use flate2::read::GzDecoder;
use http::StatusCode;
use oxdav_core::{StaticConfig, Tree};
use oxdav_plugins::{FakeLockPlugin, MemoryPropertyStore, MemoryTags, PropertyStore, TagBackend, TreeQuota};
use serde_json::json;

// ============================================================================
// Authentication
// ============================================================================

#[test]
fn test_anonymous_request_is_challenged() {
    let tree = tree();
    let response = factory(&tree).handle(request("GET", "notes.md"));
    assert_eq!(response.status(), Some(StatusCode::UNAUTHORIZED));
    let challenge = response.header("WWW-Authenticate").unwrap();
    assert!(challenge.starts_with("Basic realm=\"oxdav\""));
}

#[test]
fn test_basic_login_reads_file() {
    let tree = tree();
    let response = factory(&tree).handle(authed("GET", "notes.md"));
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(body_text(&response), "# notes");
    assert_eq!(response.header("X-NC-OwnerId"), Some(USER));
}

#[test]
fn test_wrong_password_is_challenged() {
    let tree = tree();
    let request = request("GET", "notes.md").with_header("Authorization", &basic(USER, "wrong"));
    let response = factory(&tree).handle(request);
    assert_eq!(response.status(), Some(StatusCode::UNAUTHORIZED));
}

#[test]
fn test_bearer_token_login() {
    let tree = tree();
    let request = request("GET", "notes.md").with_header("Authorization", &format!("Bearer {APP_TOKEN}"));
    let response = factory(&tree).handle(request);
    assert_eq!(response.status(), Some(StatusCode::OK));
}

#[test]
fn test_sessions_do_not_leak_between_requests() {
    let tree = tree();
    let factory = factory(&tree);
    assert_eq!(factory.handle(authed("GET", "notes.md")).status(), Some(StatusCode::OK));
    assert_eq!(
        factory.handle(request("GET", "notes.md")).status(),
        Some(StatusCode::UNAUTHORIZED)
    );
}

#[test]
fn test_public_factory_skips_authentication() {
    let tree = tree();
    let response = factory(&tree).public(true).handle(request("GET", "notes.md"));
    assert_eq!(response.status(), Some(StatusCode::OK));
}

// ============================================================================
// CORS
// ============================================================================

#[test]
fn test_preflight_is_answered_before_authentication() {
    let tree = tree();
    let origin = "https://app.example.com";
    let config = StaticConfig::new().with_system_value("cors.allowed-domains", json!([origin]));
    let factory = factory(&tree).with_config(Arc::new(config));

    let response = factory.handle(request("OPTIONS", "docs").with_header("Origin", origin));
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some(origin));
    assert!(response.header("Access-Control-Allow-Methods").is_some());
    assert_eq!(response.header("WWW-Authenticate"), None);
}

// ============================================================================
// PROPFIND with plugin properties
// ============================================================================

#[test]
fn test_depth_one_propfind_preloads_tags_once() {
    let tree = tree();
    let tags = Arc::new(MemoryTags::new());
    let id = tree.get_node_for_path("docs/a.txt").unwrap().id;
    tags.tag_as(id, "work").unwrap();
    let factory = factory(&tree).with_tags(tags.clone());

    let body = propfind_body(&["oc:tags", "oc:fileid"]);
    let response = factory.handle(authed("PROPFIND", "docs").with_header("Depth", "1").with_body(body));
    assert_eq!(response.status(), Some(StatusCode::MULTI_STATUS));
    assert_eq!(tags.query_count(), 1);

    let text = body_text(&response);
    assert!(text.contains(">work<"));
    assert!(text.contains(&id.to_string()));
    assert!(text.contains("/docs/sub/"));
}

#[test]
fn test_propfind_without_credentials_is_rejected() {
    let tree = tree();
    let response = factory(&tree).handle(request("PROPFIND", "docs").with_header("Depth", "1"));
    assert_eq!(response.status(), Some(StatusCode::UNAUTHORIZED));
}

// ============================================================================
// Quota
// ============================================================================

#[test]
fn test_upload_over_quota_is_refused() {
    let tree = tree();
    // 17 bytes are used, so 3 remain.
    let quota = Arc::new(TreeQuota::new(Arc::clone(&tree) as Arc<dyn Tree>, Some(20)));
    let factory = factory(&tree).with_quota(quota);

    let response = factory.handle(
        authed("PUT", "docs/big.txt")
            .with_header("Content-Length", "10")
            .with_body("0123456789"),
    );
    assert_eq!(response.status(), Some(StatusCode::INSUFFICIENT_STORAGE));
    assert!(!tree.node_exists("docs/big.txt"));
    assert!(!tree.paths().iter().any(|p| p.ends_with(".part")));

    let response = factory.handle(
        authed("PUT", "docs/small.txt")
            .with_header("Content-Length", "3")
            .with_body("abc"),
    );
    assert_eq!(response.status(), Some(StatusCode::CREATED));
}

// ============================================================================
// Locks
// ============================================================================

#[test]
fn test_lock_then_write_with_token() {
    let tree = tree();
    let factory = factory(&tree);

    let response = factory.handle(authed("LOCK", "notes.md"));
    assert_eq!(response.status(), Some(StatusCode::OK));
    let token = FakeLockPlugin::token_for("notes.md");
    assert_eq!(response.header("Lock-Token"), Some(format!("<{token}>").as_str()));

    let response = factory.handle(
        authed("PUT", "notes.md")
            .with_header("If", &format!("(<{token}>)"))
            .with_body("# changed"),
    );
    assert_eq!(response.status(), Some(StatusCode::NO_CONTENT));
    assert_eq!(tree.read("notes.md").unwrap().as_ref(), b"# changed");

    let response = factory.handle(authed("UNLOCK", "notes.md").with_header("Lock-Token", &format!("<{token}>")));
    assert_eq!(response.status(), Some(StatusCode::NO_CONTENT));
}

// ============================================================================
// Dead properties
// ============================================================================

#[test]
fn test_dead_property_follows_move_and_delete() {
    let tree = tree();
    let store = Arc::new(MemoryPropertyStore::new());
    let factory = factory(&tree).with_property_store(store.clone());

    let patch = r#"<?xml version="1.0"?><d:propertyupdate xmlns:d="DAV:" xmlns:x="http://example.com/ns"><d:set><d:prop><x:color>blue</x:color></d:prop></d:set></d:propertyupdate>"#;
    let response = factory.handle(authed("PROPPATCH", "notes.md").with_body(patch));
    assert_eq!(response.status(), Some(StatusCode::MULTI_STATUS));
    assert!(body_text(&response).contains("200 OK"));

    let find = r#"<?xml version="1.0"?><d:propfind xmlns:d="DAV:" xmlns:x="http://example.com/ns"><d:prop><x:color/></d:prop></d:propfind>"#;
    let response = factory.handle(authed("PROPFIND", "notes.md").with_header("Depth", "0").with_body(find));
    assert!(body_text(&response).contains("blue"));

    let response = factory.handle(authed("MOVE", "notes.md").with_header("Destination", "/renamed.md"));
    assert_eq!(response.status(), Some(StatusCode::CREATED));
    let response = factory.handle(authed("PROPFIND", "renamed.md").with_header("Depth", "0").with_body(find));
    assert!(body_text(&response).contains("blue"));
    assert!(store.properties(USER, "notes.md").unwrap().is_empty());

    let response = factory.handle(authed("DELETE", "renamed.md"));
    assert_eq!(response.status(), Some(StatusCode::NO_CONTENT));
    assert!(store.properties(USER, "renamed.md").unwrap().is_empty());
}

// ============================================================================
// Compression
// ============================================================================

#[test]
fn test_large_bodies_are_gzipped() {
    let tree = tree();
    let content = "0123456789abcdef".repeat(256);
    tree.add_file("big.txt", content.clone()).unwrap();

    let response = factory(&tree).handle(authed("GET", "big.txt").with_header("Accept-Encoding", "gzip"));
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.header("Content-Encoding"), Some("gzip"));

    let mut decoded = String::new();
    GzDecoder::new(response.body().as_ref())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, content);

    let response = factory(&tree)
        .with_compression(false)
        .handle(authed("GET", "big.txt").with_header("Accept-Encoding", "gzip"));
    assert_eq!(response.header("Content-Encoding"), None);
}
