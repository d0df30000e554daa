//! Upload quota enforcement.
//!
//! Before a file is created or overwritten the expected upload length is
//! compared against the free space of the target. The length comes from
//! the request headers:
//!
//! | `OC-Total-Length` | `X-Expected-Entity-Length` | `Content-Length` | length |
//! |---|---|---|---|
//! | - | - | - | unknown |
//! | - | 1024 | - | 1024 |
//! | - | - | 512 | 512 |
//! | 2048 | - | 1024 | 2048 |
//! | 2048 | 4096 | - | 4096 |
//! | - | A | - | unknown |
//! | A | - | 1024 | 1024 |
//! | 2048 | A | - | unknown |
//!
//! `X-Expected-Entity-Length` wins over `Content-Length` when numeric;
//! `OC-Total-Length` only raises a known length, it never stands alone.

use std::sync::{Arc, LazyLock};

use oxdav_core::{
    DavError, DavResult, Event, Flow, Node, PropValue, Server, ServerPlugin, Tree, path,
};
use regex::Regex;
use tracing::{debug, warn};

/// Free space reported by a [`QuotaSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpace {
    Bytes(u64),
    /// The storage cannot tell; uploads are not limited.
    Unknown,
    Unlimited,
}

impl FreeSpace {
    /// Value of `{DAV:}quota-available-bytes`; sentinels are negative.
    pub fn as_property(self) -> i64 {
        match self {
            FreeSpace::Bytes(n) => i64::try_from(n).unwrap_or(i64::MAX),
            FreeSpace::Unknown => -2,
            FreeSpace::Unlimited => -3,
        }
    }
}

/// Space accounting of the storage behind the tree.
pub trait QuotaSource: Send + Sync {
    /// Free space for writes at `path`. A failure means the storage is
    /// unavailable.
    fn free_space(&self, path: &str) -> DavResult<FreeSpace>;

    /// Bytes used below `path`.
    fn used_space(&self, path: &str) -> DavResult<u64>;
}

/// One chunk of a legacy chunked upload, decoded from its file name
/// `<name>-chunking-<transfer id>-<chunk count>-<index>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Name of the assembled file.
    pub name: String,
    pub transfer_id: String,
    pub chunk_count: u32,
    pub index: u32,
}

impl ChunkInfo {
    pub fn decode(file_name: &str) -> Option<Self> {
        static CHUNK: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^(?P<name>.+)-chunking-(?P<transfer>\d+)-(?P<count>\d+)-(?P<index>\d+)$")
                .expect("valid regex literal")
        });
        let caps = CHUNK.captures(file_name)?;
        Some(Self {
            name: caps["name"].to_string(),
            transfer_id: caps["transfer"].to_string(),
            chunk_count: caps["count"].parse().ok()?,
            index: caps["index"].parse().ok()?,
        })
    }
}

/// Storage of chunks received so far.
pub trait ChunkStore: Send + Sync {
    /// Bytes already received for the upload `chunk` belongs to.
    fn current_size(&self, chunk: &ChunkInfo) -> u64;

    /// Drop every stored chunk of the upload.
    fn cleanup(&self, chunk: &ChunkInfo);
}

fn numeric_header(server: &Server, name: &str) -> Option<u64> {
    let request = server.http_request()?;
    request.header(name)?.trim().parse().ok()
}

/// Declared length of the upload in the current request.
pub fn expected_length(server: &Server) -> Option<u64> {
    let length = numeric_header(server, "X-Expected-Entity-Length")
        .or_else(|| numeric_header(server, "Content-Length"))?;
    match numeric_header(server, "OC-Total-Length") {
        Some(total) => Some(length.max(total)),
        None => Some(length),
    }
}

/// Rejects uploads that do not fit and serves the quota properties.
pub struct QuotaPlugin {
    source: Arc<dyn QuotaSource>,
    chunks: Option<Arc<dyn ChunkStore>>,
}

impl QuotaPlugin {
    pub fn new(source: Arc<dyn QuotaSource>) -> Self {
        Self {
            source,
            chunks: None,
        }
    }

    #[must_use]
    pub fn with_chunk_store(mut self, chunks: Arc<dyn ChunkStore>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    /// Check that an upload of `length` bytes (the request's expected
    /// length when `None`) fits at `path`.
    pub fn check_quota(&self, server: &Server, path: &str, length: Option<u64>) -> DavResult<()> {
        let Some(mut length) = length.or_else(|| expected_length(server)) else {
            return Ok(());
        };

        let (parent, name) = path::split(path);
        let mut target = path.to_string();
        let chunk = ChunkInfo::decode(name);
        if let Some(chunk) = &chunk {
            if let Some(store) = &self.chunks {
                length = length.saturating_sub(store.current_size(chunk));
            }
            target = path::join(parent, &chunk.name);
        }

        let free = self.free_space(&target)?;
        if let FreeSpace::Bytes(free) = free
            && length > free
        {
            if let (Some(chunk), Some(store)) = (&chunk, &self.chunks) {
                debug!(transfer = %chunk.transfer_id, "Dropping chunks of rejected upload");
                store.cleanup(chunk);
            }
            return Err(DavError::InsufficientStorage(format!(
                "Insufficient space in {target}, {length} required, {free} available"
            )));
        }
        Ok(())
    }

    fn free_space(&self, path: &str) -> DavResult<FreeSpace> {
        self.source.free_space(path).map_err(|e| match e {
            DavError::ServiceUnavailable(_) => e,
            other => DavError::ServiceUnavailable(other.to_string()),
        })
    }

    fn quota_properties(&self, propfind: &mut oxdav_core::PropFind, node: &Node) {
        if !node.is_directory() {
            return;
        }
        if let Err(e) = propfind.try_handle_with("{DAV:}quota-used-bytes", || {
            Ok(Some(PropValue::from(self.source.used_space(&node.path)?)))
        }) {
            warn!(path = %node.path, error = %e, "Failed to read used space");
        }
        if let Err(e) = propfind.try_handle_with("{DAV:}quota-available-bytes", || {
            Ok(Some(PropValue::Integer(self.source.free_space(&node.path)?.as_property())))
        }) {
            warn!(path = %node.path, error = %e, "Failed to read free space");
        }
    }
}

impl ServerPlugin for QuotaPlugin {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        let plugin = Arc::clone(&self);
        server.on("beforeWriteContent", 10, move |server, event| {
            if let Event::WriteContent { node, .. } = event {
                plugin.check_quota(server, &node.path, None)?;
            }
            Ok(Flow::Continue)
        });

        let plugin = Arc::clone(&self);
        server.on("beforeCreateFile", 10, move |server, event| {
            if let Event::CreateFile { path, parent, .. } = event {
                let (_, name) = path::split(path);
                plugin.check_quota(server, &path::join(&parent.path, name), None)?;
            }
            Ok(Flow::Continue)
        });

        server.on("propFind", oxdav_core::DEFAULT_PRIORITY, move |_, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                self.quota_properties(propfind, node);
            }
            Ok(Flow::Continue)
        });
    }
}

/// Quota computed from the tree itself: one limit for the whole tree.
pub struct TreeQuota {
    tree: Arc<dyn Tree>,
    limit: Option<u64>,
}

impl TreeQuota {
    /// `None` means unlimited.
    pub fn new(tree: Arc<dyn Tree>, limit: Option<u64>) -> Self {
        Self { tree, limit }
    }
}

impl QuotaSource for TreeQuota {
    fn free_space(&self, _path: &str) -> DavResult<FreeSpace> {
        let Some(limit) = self.limit else {
            return Ok(FreeSpace::Unlimited);
        };
        let used = self.tree.get_node_for_path("")?.size;
        Ok(FreeSpace::Bytes(limit.saturating_sub(used)))
    }

    fn used_space(&self, path: &str) -> DavResult<u64> {
        Ok(self.tree.get_node_for_path(path)?.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use oxdav_core::{MemoryTree, Request};
    use parking_lot::Mutex;

    struct FixedQuota(DavResult<FreeSpace>);

    impl QuotaSource for FixedQuota {
        fn free_space(&self, _path: &str) -> DavResult<FreeSpace> {
            match &self.0 {
                Ok(space) => Ok(*space),
                Err(e) => Err(DavError::Internal(e.to_string())),
            }
        }

        fn used_space(&self, _path: &str) -> DavResult<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct Chunks {
        received: u64,
        cleaned: Mutex<Vec<String>>,
    }

    impl ChunkStore for Chunks {
        fn current_size(&self, _chunk: &ChunkInfo) -> u64 {
            self.received
        }

        fn cleanup(&self, chunk: &ChunkInfo) {
            self.cleaned.lock().push(chunk.transfer_id.clone());
        }
    }

    fn server_with_headers(headers: &[(&str, &str)]) -> Server {
        let server = Server::new(Arc::new(MemoryTree::new()));
        let mut request = Request::new(Method::GET, "file.txt").unwrap();
        for (name, value) in headers {
            request = request.with_header(name, value);
        }
        // Dispatching records the request on the server; the 404 is irrelevant.
        server.handle(request);
        server
    }

    #[test]
    fn test_expected_length_table() {
        let cases: &[(Option<u64>, &[(&str, &str)])] = &[
            (None, &[]),
            (Some(1024), &[("X-Expected-Entity-Length", "1024")]),
            (Some(512), &[("Content-Length", "512")]),
            (Some(2048), &[("OC-Total-Length", "2048"), ("Content-Length", "1024")]),
            (Some(4096), &[("OC-Total-Length", "2048"), ("X-Expected-Entity-Length", "4096")]),
            (None, &[("X-Expected-Entity-Length", "A")]),
            (None, &[("Content-Length", "A")]),
            (Some(1024), &[("OC-Total-Length", "A"), ("Content-Length", "1024")]),
            (Some(1024), &[("OC-Total-Length", "A"), ("X-Expected-Entity-Length", "1024")]),
            (None, &[("OC-Total-Length", "2048"), ("X-Expected-Entity-Length", "A")]),
            (None, &[("OC-Total-Length", "2048"), ("Content-Length", "A")]),
        ];
        for (expected, headers) in cases {
            let server = server_with_headers(headers);
            assert_eq!(expected_length(&server), *expected, "headers: {headers:?}");
        }
    }

    #[test]
    fn test_check_quota_passes_and_fails() {
        let headers = [("OC-Total-Length", "1024"), ("Content-Length", "512")];
        let server = server_with_headers(&headers);

        let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Ok(FreeSpace::Bytes(1024)))));
        assert!(plugin.check_quota(&server, "file.txt", None).is_ok());

        let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Ok(FreeSpace::Bytes(1023)))));
        assert!(matches!(
            plugin.check_quota(&server, "file.txt", None),
            Err(DavError::InsufficientStorage(_))
        ));
    }

    #[test]
    fn test_sentinels_always_pass() {
        let server = server_with_headers(&[("Content-Length", "999999")]);
        for space in [FreeSpace::Unknown, FreeSpace::Unlimited] {
            let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Ok(space))));
            assert!(plugin.check_quota(&server, "file.txt", None).is_ok());
        }
    }

    #[test]
    fn test_unknown_length_is_not_enforced() {
        let server = server_with_headers(&[]);
        let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Ok(FreeSpace::Bytes(0)))));
        assert!(plugin.check_quota(&server, "file.txt", None).is_ok());
    }

    #[test]
    fn test_storage_failure_is_service_unavailable() {
        let server = server_with_headers(&[("Content-Length", "10")]);
        let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Err(DavError::Internal("down".into())))));
        assert!(matches!(
            plugin.check_quota(&server, "file.txt", None),
            Err(DavError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_chunked_upload_uses_remaining_length() {
        let server = server_with_headers(&[("OC-Total-Length", "1000"), ("Content-Length", "100")]);
        let chunks = Arc::new(Chunks {
            received: 600,
            ..Chunks::default()
        });
        let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Ok(FreeSpace::Bytes(500)))))
            .with_chunk_store(chunks.clone());

        // 1000 declared, 600 already received: 400 still fits into 500.
        assert!(
            plugin
                .check_quota(&server, "docs/big.bin-chunking-42-10-6", None)
                .is_ok()
        );

        let plugin = QuotaPlugin::new(Arc::new(FixedQuota(Ok(FreeSpace::Bytes(399)))))
            .with_chunk_store(chunks.clone());
        let err = plugin
            .check_quota(&server, "docs/big.bin-chunking-42-10-6", None)
            .unwrap_err();
        assert!(err.to_string().contains("docs/big.bin"));
        assert_eq!(*chunks.cleaned.lock(), vec!["42".to_string()]);
    }

    #[test]
    fn test_chunk_name_decoding() {
        let info = ChunkInfo::decode("report.pdf-chunking-1234-5-2").unwrap();
        assert_eq!(info.name, "report.pdf");
        assert_eq!(info.transfer_id, "1234");
        assert_eq!(info.chunk_count, 5);
        assert_eq!(info.index, 2);
        assert_eq!(ChunkInfo::decode("report.pdf"), None);
    }

    #[test]
    fn test_tree_quota() {
        let tree = Arc::new(MemoryTree::new());
        tree.add_file("a.bin", vec![0u8; 300]).unwrap();
        let quota = TreeQuota::new(tree.clone(), Some(1000));
        assert_eq!(quota.free_space("").unwrap(), FreeSpace::Bytes(700));
        assert_eq!(quota.used_space("").unwrap(), 300);
        assert_eq!(
            TreeQuota::new(tree, None).free_space("").unwrap(),
            FreeSpace::Unlimited
        );
    }
}
