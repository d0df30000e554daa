//! Event-driven WebDAV server pipeline.
//!
//! This crate provides the dispatch core that WebDAV plugins build on:
//!
//! - [`EventBus`]: named events with priority ordering, wildcards and
//!   short-circuiting
//! - [`PropFind`] / [`PropPatch`]: per-node property read and write
//!   coordinators shared by all plugins
//! - [`Tree`] / [`Node`]: the path-addressed storage boundary, with an
//!   in-memory implementation in [`MemoryTree`]
//! - [`Server`]: composes the above and drives one request through
//!   `beforeMethod` / `method` / `afterMethod`
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use http::{Method, StatusCode};
//! use oxdav_core::{MemoryTree, Request, Server};
//!
//! let tree = MemoryTree::new();
//! tree.add_file("notes/todo.txt", "buy milk").unwrap();
//!
//! let server = Server::new(Arc::new(tree));
//! let response = server.handle(Request::new(Method::GET, "notes/todo.txt").unwrap());
//! assert_eq!(response.status(), Some(StatusCode::OK));
//! assert_eq!(response.body().as_ref(), b"buy milk");
//! ```
//!
//! # Writing a plugin
//!
//! Plugins implement [`ServerPlugin`] and subscribe to events in
//! `initialize`. Listeners get the server and the event payload and answer
//! [`Flow::Continue`] or [`Flow::Stop`]; returning an error aborts the
//! request with that error's status.

pub mod context;
mod core_plugin;
pub mod error;
pub mod event;
pub mod memory;
pub mod node;
pub mod path;
pub mod plugin;
pub mod propfind;
pub mod proppatch;
pub mod request;
pub mod server;
pub mod tree;
pub mod xml;

// Public exports
pub use context::{Config, Session, StaticConfig, UserDirectory, UserSession};
pub use core_plugin::CorePlugin;
pub use error::{DavError, DavResult};
pub use event::{DEFAULT_PRIORITY, Event, EventBus, Flow, HandlerResult, Priority};
pub use memory::MemoryTree;
pub use node::{FileId, Node, NodeKind, Permissions};
pub use plugin::ServerPlugin;
pub use propfind::{Depth, PropFind, PropFindKind, PropFindResponse, PropStat, PropValue, XmlElement};
pub use proppatch::{Mutation, PatchOutcome, PropPatch};
pub use request::{IfCondition, IfToken, Request, Response};
pub use server::{CopyMoveInfo, PRINCIPAL_PREFIX, Server, WriteOutcome};
pub use tree::{LockGuard, LockKind, Tree};
