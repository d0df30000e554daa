//! Gzip response bodies for clients that accept it.

use std::io::Write as _;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use http::{Method, StatusCode};
use oxdav_core::{DavResult, Flow, Request, Response, Server, ServerPlugin};
use tracing::trace;

/// Bodies smaller than this are sent as is.
pub const DEFAULT_MIN_SIZE: usize = 1024;

/// Runs after every other `afterMethod` listener so it sees the final body.
pub const COMPRESSION_PRIORITY: oxdav_core::Priority = 1000;

pub struct CompressionPlugin {
    min_size: usize,
    level: Compression,
}

impl Default for CompressionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionPlugin {
    pub fn new() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            level: Compression::default(),
        }
    }

    #[must_use]
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    fn accepts_gzip(request: &Request) -> bool {
        request.header("Accept-Encoding").is_some_and(|value| {
            value.split(',').any(|coding| {
                let mut parts = coding.split(';');
                let name = parts.next().unwrap_or_default().trim();
                let refused = parts.any(|p| matches!(p.trim(), "q=0" | "q=0.0" | "q=0.00" | "q=0.000"));
                name.eq_ignore_ascii_case("gzip") && !refused
            })
        })
    }

    fn should_compress(&self, request: &Request, response: &Response) -> bool {
        if *request.method() == Method::HEAD
            || response.body().len() < self.min_size
            || response.header("Content-Encoding").is_some()
        {
            return false;
        }
        let skipped = matches!(
            response.status(),
            Some(StatusCode::PARTIAL_CONTENT | StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
        );
        !skipped && Self::accepts_gzip(request)
    }

    fn compress(&self, request: &Request, response: &mut Response) -> DavResult<()> {
        if !self.should_compress(request, response) {
            return Ok(());
        }
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(response.body())?;
        let compressed = encoder.finish()?;
        trace!(
            original = response.body().len(),
            compressed = compressed.len(),
            "Compressed response body"
        );

        // The encoded body is no longer byte-identical to the entity.
        if let Some(etag) = response.header("ETag").filter(|e| !e.starts_with("W/")) {
            let weak = format!("W/{etag}");
            response.set_header("ETag", &weak);
        }
        response.set_header("Content-Length", &compressed.len().to_string());
        response.set_header("Content-Encoding", "gzip");
        response.add_header("Vary", "Accept-Encoding");
        response.set_body(compressed);
        Ok(())
    }
}

impl ServerPlugin for CompressionPlugin {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        server.on("afterMethod:*", COMPRESSION_PRIORITY, move |_, event| {
            if let Some((request, response)) = event.method_parts() {
                self.compress(request, response)?;
            }
            Ok(Flow::Continue)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use oxdav_core::MemoryTree;
    use std::io::Read as _;

    fn server(content: &str) -> Server {
        let tree = MemoryTree::new();
        tree.add_file("big.txt", content.to_string()).unwrap();
        let mut server = Server::new(Arc::new(tree));
        server.add_plugin(Arc::new(CompressionPlugin::new().with_min_size(64)));
        server
    }

    fn get(encoding: Option<&str>) -> Request {
        let request = Request::new(Method::GET, "big.txt").unwrap();
        match encoding {
            Some(e) => request.with_header("Accept-Encoding", e),
            None => request,
        }
    }

    #[test]
    fn test_gzip_when_accepted() {
        let content = "lorem ipsum ".repeat(100);
        let response = server(&content).handle(get(Some("deflate, gzip;q=0.8")));
        assert_eq!(response.header("Content-Encoding"), Some("gzip"));
        assert_eq!(response.header("Vary"), Some("Accept-Encoding"));
        assert_eq!(
            response.header("Content-Length"),
            Some(response.body().len().to_string().as_str())
        );

        let mut decoded = String::new();
        GzDecoder::new(response.body().as_ref())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_gzip_weakens_etag() {
        let content = "lorem ipsum ".repeat(100);
        let server = server(&content);

        let plain = server.handle(get(None));
        let strong = plain.header("ETag").unwrap().to_string();
        assert!(strong.starts_with('"'));

        let gzipped = server.handle(get(Some("gzip")));
        assert_eq!(gzipped.header("Content-Encoding"), Some("gzip"));
        assert_eq!(gzipped.header("ETag"), Some(format!("W/{strong}").as_str()));
    }

    #[test]
    fn test_plain_when_not_accepted_or_small() {
        let content = "lorem ipsum ".repeat(100);
        let response = server(&content).handle(get(None));
        assert_eq!(response.header("Content-Encoding"), None);

        let response = server(&content).handle(get(Some("gzip;q=0")));
        assert_eq!(response.header("Content-Encoding"), None);

        let response = server("tiny").handle(get(Some("gzip")));
        assert_eq!(response.header("Content-Encoding"), None);
        assert_eq!(response.body().as_ref(), b"tiny");
    }

    #[test]
    fn test_range_responses_are_left_alone() {
        let content = "lorem ipsum ".repeat(100);
        let request = get(Some("gzip")).with_header("Range", "bytes=0-499");
        let response = server(&content).handle(request);
        assert_eq!(response.status(), Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(response.header("Content-Encoding"), None);
    }
}
