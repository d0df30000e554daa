//! Named-event dispatch with priority ordering and short-circuiting.
//!
//! Listeners are indexed by event name and kept sorted by
//! `(priority, registration sequence)`: a lower priority number runs first and
//! listeners sharing a priority run in the order they were registered.
//!
//! # Wildcards
//!
//! A listener registered on `prefix:*` also receives every `prefix:<name>`
//! emission. Wildcard and exact listeners are merged into one ordering.
//!
//! # Re-entrancy
//!
//! [`EventBus::emit`] snapshots the listener list before calling any handler,
//! so a handler may emit further events or register new listeners without
//! disturbing the emission in progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{DavError, DavResult};
use crate::node::Node;
use crate::propfind::PropFind;
use crate::proppatch::PropPatch;
use crate::request::{IfCondition, Request, Response};

/// Listener priority. Lower runs first.
pub type Priority = i32;

/// Priority used when a plugin has no ordering requirement.
pub const DEFAULT_PRIORITY: Priority = 100;

/// What a handler wants to happen after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep calling the remaining listeners.
    Continue,
    /// Stop the emission; `emit` returns `false`.
    Stop,
}

/// Result type returned by every listener.
pub type HandlerResult = DavResult<Flow>;

/// Payload passed to listeners.
///
/// The variant is determined by the event name; listeners that are
/// registered on a name always receive the matching variant.
pub enum Event<'a> {
    /// `beforeMethod:*`, `method:*`, `afterMethod:*`, `afterResponse`.
    Method {
        request: &'a Request,
        response: &'a mut Response,
    },
    /// `propFind`, once per visited node.
    PropFind {
        propfind: &'a mut PropFind,
        node: &'a Node,
    },
    /// `propPatch`.
    PropPatch {
        path: &'a str,
        proppatch: &'a mut PropPatch,
    },
    /// `beforeBind`, `afterBind`, `beforeUnbind`, `afterUnbind`,
    /// `afterCreateFile`, `afterWriteContent`, `afterCreateCollection`.
    Path { path: &'a str },
    /// `beforeCreateFile`. Listeners may replace the body and must set
    /// `modified` when they do.
    CreateFile {
        path: &'a str,
        data: &'a mut Bytes,
        parent: &'a Node,
        modified: &'a mut bool,
    },
    /// `beforeWriteContent`.
    WriteContent {
        path: &'a str,
        node: &'a Node,
        data: &'a mut Bytes,
        modified: &'a mut bool,
    },
    /// `beforeMove`, `afterMove`, `afterCopy`.
    Move {
        source: &'a str,
        destination: &'a str,
    },
    /// `validateTokens`, emitted with the parsed `If:` header.
    ValidateTokens {
        request: &'a Request,
        conditions: &'a mut Vec<IfCondition>,
    },
    /// `exception`, emitted with the error that aborted the request.
    Exception { error: &'a DavError },
    /// `report`, with the Clark name of the report body's root element.
    Report {
        name: &'a str,
        path: &'a str,
        body: &'a [u8],
        response: &'a mut Response,
    },
}

impl Event<'_> {
    /// Request and response of a method event.
    pub fn method_parts(&mut self) -> Option<(&Request, &mut Response)> {
        match self {
            Event::Method { request, response } => Some((*request, &mut **response)),
            _ => None,
        }
    }

    /// Coordinator and node of a `propFind` event.
    pub fn propfind_parts(&mut self) -> Option<(&mut PropFind, &Node)> {
        match self {
            Event::PropFind { propfind, node } => Some((&mut **propfind, *node)),
            _ => None,
        }
    }

    /// Path and coordinator of a `propPatch` event.
    pub fn proppatch_parts(&mut self) -> Option<(&str, &mut PropPatch)> {
        match self {
            Event::PropPatch { path, proppatch } => Some((*path, &mut **proppatch)),
            _ => None,
        }
    }

    /// Target path of path-carrying events.
    pub fn path(&self) -> Option<&str> {
        match self {
            Event::Path { path }
            | Event::PropPatch { path, .. }
            | Event::CreateFile { path, .. }
            | Event::WriteContent { path, .. }
            | Event::Report { path, .. } => Some(*path),
            Event::Move { source, .. } => Some(*source),
            _ => None,
        }
    }
}

type Callback<C> = dyn Fn(&C, &mut Event<'_>) -> HandlerResult + Send + Sync;

struct Listener<C: 'static> {
    priority: Priority,
    sequence: u64,
    callback: Arc<Callback<C>>,
}

impl<C: 'static> Clone for Listener<C> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            sequence: self.sequence,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Registry of listeners keyed by event name.
///
/// `C` is the context handed to every listener (the owning server).
pub struct EventBus<C: 'static> {
    listeners: RwLock<HashMap<String, Vec<Listener<C>>>>,
    next_sequence: AtomicU64,
}

impl<C: 'static> Default for EventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> EventBus<C> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Register `callback` for `name` at `priority`.
    pub fn on<F>(&self, name: impl Into<String>, priority: Priority, callback: F)
    where
        F: Fn(&C, &mut Event<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        let listener = Listener {
            priority,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        };

        let mut listeners = self.listeners.write();
        let list = listeners.entry(name).or_default();
        let key = (listener.priority, listener.sequence);
        let index = list.partition_point(|l| (l.priority, l.sequence) <= key);
        list.insert(index, listener);
    }

    /// Invoke every listener of `name` in order.
    ///
    /// Returns `Ok(false)` as soon as a listener answers [`Flow::Stop`],
    /// `Ok(true)` when all listeners ran (including when there are none).
    /// A listener error aborts the emission and is returned unchanged.
    pub fn emit(&self, ctx: &C, name: &str, event: &mut Event<'_>) -> DavResult<bool> {
        let snapshot = self.snapshot(name);
        if snapshot.is_empty() {
            return Ok(true);
        }

        trace!(event = name, listeners = snapshot.len(), "Emitting event");
        for listener in &snapshot {
            if (listener.callback)(ctx, event)? == Flow::Stop {
                trace!(event = name, priority = listener.priority, "Emission stopped");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether anything listens on `name` (exact registrations only).
    pub fn has_listeners(&self, name: &str) -> bool {
        self.listeners
            .read()
            .get(name)
            .is_some_and(|list| !list.is_empty())
    }

    /// Number of listeners registered on `name` (exact registrations only).
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map_or(0, Vec::len)
    }

    /// Drop every listener of `name`.
    pub fn remove_all(&self, name: &str) {
        self.listeners.write().remove(name);
    }

    fn snapshot(&self, name: &str) -> Vec<Listener<C>> {
        let listeners = self.listeners.read();
        let exact = listeners.get(name);
        let wildcard = wildcard_for(name).and_then(|w| listeners.get(w.as_str()));

        match (exact, wildcard) {
            (Some(exact), Some(wildcard)) => {
                let mut merged: Vec<_> = exact.iter().chain(wildcard).cloned().collect();
                merged.sort_by_key(|l| (l.priority, l.sequence));
                merged
            }
            (Some(list), None) | (None, Some(list)) => list.clone(),
            (None, None) => Vec::new(),
        }
    }
}

/// `beforeMethod:PUT` -> `beforeMethod:*`.
fn wildcard_for(name: &str) -> Option<String> {
    let (prefix, rest) = name.split_once(':')?;
    (rest != "*").then(|| format!("{prefix}:*"))
}
