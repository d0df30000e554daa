//! HTTP tests against a live server on a random port.

mod common;

use common::{PASSWORD, TestServer, USER, test_config};
use oxdav_server::ServerConfig;
use reqwest::StatusCode;

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_anonymous_request_is_challenged() {
    let server = TestServer::start().await;
    let response = TestServer::send(server.anonymous("GET", "/docs/a.txt")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()["www-authenticate"].to_str().unwrap();
    assert!(challenge.starts_with("Basic realm="));
    let body = response.text().await.unwrap();
    assert!(body.contains("NotAuthenticated"));
}

#[tokio::test]
async fn test_basic_credentials_are_accepted() {
    let server = TestServer::start().await;
    let (status, body) = server.get_text("/docs/a.txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "alpha");

    let response = TestServer::send(
        server
            .anonymous("GET", "/docs/a.txt")
            .basic_auth(USER, Some(format!("{PASSWORD}x"))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_public_server_needs_no_credentials() {
    let server = TestServer::with_config(ServerConfig {
        public: true,
        ..test_config()
    })
    .await;
    let response = TestServer::send(server.anonymous("GET", "/docs/a.txt")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// File operations
// ============================================================================

#[tokio::test]
async fn test_put_get_delete_cycle() {
    let server = TestServer::start().await;

    let response = TestServer::send(server.authed("PUT", "/docs/new.txt").body("fresh")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key("etag"));
    assert!(response.headers().contains_key("oc-fileid"));

    let (status, body) = server.get_text("/docs/new.txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "fresh");

    let response = TestServer::send(server.authed("DELETE", "/docs/new.txt")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let (status, _) = server.get_text("/docs/new.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mkcol_and_move() {
    let server = TestServer::start().await;

    let response = TestServer::send(server.authed("MKCOL", "/archive")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = TestServer::send(
        server
            .authed("MOVE", "/docs/a.txt")
            .header("Destination", server.url("/docs/renamed.txt")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let (status, body) = server.get_text("/docs/renamed.txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "alpha");
}

#[tokio::test]
async fn test_propfind_depth_one() {
    let server = TestServer::start().await;
    let body = r#"<?xml version="1.0"?><d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns"><d:prop><d:getetag/><oc:fileid/><oc:permissions/></d:prop></d:propfind>"#;
    let response = TestServer::send(
        server
            .authed("PROPFIND", "/docs")
            .header("Depth", "1")
            .body(body),
    )
    .await;
    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let text = response.text().await.unwrap();
    assert!(text.contains("/docs/a.txt"));
    assert!(text.contains("/docs/b.txt"));
    assert!(text.contains("fileid"));
}

#[tokio::test]
async fn test_options_advertises_dav_classes() {
    let server = TestServer::start().await;
    let response = TestServer::send(server.authed("OPTIONS", "/docs")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let dav = response.headers()["dav"].to_str().unwrap();
    assert!(dav.contains('1'));
    assert!(dav.contains('2'));
    let allow = response.headers()["allow"].to_str().unwrap();
    assert!(allow.contains("PROPFIND"));
    assert!(allow.contains("LOCK"));
}

// ============================================================================
// Base URI
// ============================================================================

#[tokio::test]
async fn test_base_uri_prefix() {
    let server = TestServer::with_config(ServerConfig {
        base_uri: "/remote.php/webdav".into(),
        ..test_config()
    })
    .await;
    assert!(server.base_url.ends_with("/remote.php/webdav"));

    let (status, body) = server.get_text("/docs/a.txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "alpha");

    let outside = server.base_url.replace("/remote.php/webdav", "/elsewhere/docs/a.txt");
    let response = reqwest::Client::new()
        .get(outside)
        .basic_auth(USER, Some(PASSWORD))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ============================================================================
// Quota and lifecycle
// ============================================================================

#[tokio::test]
async fn test_quota_rejects_large_upload() {
    let server = TestServer::with_config(ServerConfig {
        quota_bytes: Some(16),
        ..test_config()
    })
    .await;
    let response = TestServer::send(server.authed("PUT", "/docs/big.txt").body("x".repeat(64))).await;
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    let (status, _) = server.get_text("/docs/big.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_closes_listener() {
    let server = TestServer::start().await;
    let url = server.url("/docs/a.txt");
    server.stop().await;

    let result = reqwest::Client::new()
        .get(url)
        .basic_auth(USER, Some(PASSWORD))
        .send()
        .await;
    assert!(result.is_err());
}
