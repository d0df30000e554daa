//! Test server harness for HTTP integration tests.

#![allow(dead_code)]

use std::time::Duration;

use oxdav_plugins::Account;
use oxdav_server::{SeedFile, ServerConfig, WebDavServer};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

/// Config with alice and a small tree, bound to an OS-assigned port.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        users: vec![Account::new(USER, PASSWORD).with_display_name("Alice")],
        files: vec![
            SeedFile {
                path: "docs/a.txt".into(),
                content: "alpha".into(),
            },
            SeedFile {
                path: "docs/b.txt".into(),
                content: "bravo".into(),
            },
        ],
        ..ServerConfig::default()
    }
}

/// Running server with an HTTP client.
pub struct TestServer {
    server: Option<WebDavServer>,
    client: Client,
    /// URL of the tree root, without a trailing slash.
    pub base_url: String,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let factory = config.build_factory().expect("Failed to build factory");
        let server = WebDavServer::start(&config, factory)
            .await
            .expect("Failed to start WebDAV server");
        let base_url = server.url();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            server: Some(server),
            client,
            base_url,
        }
    }

    /// Build a full URL from a tree path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request without credentials.
    pub fn anonymous(&self, method: &str, path: &str) -> RequestBuilder {
        let method = Method::from_bytes(method.as_bytes()).expect("valid method");
        self.client.request(method, self.url(path))
    }

    /// Request with alice's Basic credentials.
    pub fn authed(&self, method: &str, path: &str) -> RequestBuilder {
        self.anonymous(method, path).basic_auth(USER, Some(PASSWORD))
    }

    pub async fn send(builder: RequestBuilder) -> Response {
        builder.send().await.expect("request failed")
    }

    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let response = Self::send(self.authed("GET", path)).await;
        let status = response.status();
        (status, response.text().await.unwrap_or_default())
    }

    pub async fn stop(mut self) {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
    }
}
