//! Middleware plugins for the oxdav pipeline.
//!
//! Each module holds one [`ServerPlugin`](oxdav_core::ServerPlugin) plus the
//! backend trait it consumes and an in-memory implementation of that
//! backend. [`ServerFactory`] wires the full set together per request.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use http::{Method, StatusCode};
//! use oxdav_core::{MemoryTree, Request};
//! use oxdav_plugins::{Account, Accounts, ServerFactory};
//!
//! let tree = MemoryTree::new();
//! tree.add_file("hello.txt", "hi").unwrap();
//! let accounts = Arc::new(Accounts::from_accounts([Account::new("alice", "secret")]));
//! let factory = ServerFactory::new(Arc::new(tree), accounts);
//!
//! // No credentials: 401 with a Basic challenge.
//! let response = factory.handle(Request::new(Method::GET, "hello.txt").unwrap());
//! assert_eq!(response.status(), Some(StatusCode::UNAUTHORIZED));
//!
//! let request = Request::new(Method::GET, "hello.txt")
//!     .unwrap()
//!     .with_header("Authorization", "Basic YWxpY2U6c2VjcmV0");
//! assert_eq!(factory.handle(request).status(), Some(StatusCode::OK));
//! ```

pub mod auth;
pub mod comments;
pub mod compression;
pub mod cors;
pub mod custom_properties;
pub mod exception_logger;
pub mod factory;
pub mod fake_lock;
pub mod files;
pub mod quota;
pub mod session;
pub mod shares;
pub mod tags;

// Public exports
pub use auth::{AuthBackend, AuthPlugin, AuthResult, BearerAuth, PasswordAuth};
pub use comments::{CommentsBackend, CommentsPlugin, MemoryComments};
pub use compression::CompressionPlugin;
pub use cors::CorsPlugin;
pub use custom_properties::{CustomPropertiesPlugin, MemoryPropertyStore, PropertyStore};
pub use exception_logger::ExceptionLoggerPlugin;
pub use factory::ServerFactory;
pub use fake_lock::FakeLockPlugin;
pub use files::FilesPlugin;
pub use quota::{ChunkInfo, ChunkStore, FreeSpace, QuotaPlugin, QuotaSource, TreeQuota};
pub use session::{Account, Accounts, MemorySession, MemoryUserSession};
pub use shares::{MemoryShares, ShareBackend, ShareType, SharesPlugin};
pub use tags::{MemoryTags, TagBackend, TagsPlugin};
