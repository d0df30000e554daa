//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use http::Method;
use oxdav_core::{Event, Flow, MemoryTree, Request, Response, Server, ServerPlugin, Tree};
use parking_lot::Mutex;

/// Build a tree from `(path, content)` pairs. Paths ending in `/` become
/// collections.
pub fn tree_with(entries: &[(&str, &str)]) -> Arc<MemoryTree> {
    let tree = MemoryTree::new();
    for (path, content) in entries {
        if path.ends_with('/') {
            tree.add_directory(path).expect("add directory");
        } else {
            tree.add_file(path, content.to_string()).expect("add file");
        }
    }
    Arc::new(tree)
}

pub fn server_for(tree: &Arc<MemoryTree>) -> Server {
    Server::new(Arc::clone(tree) as Arc<dyn Tree>)
}

pub fn request(method: &str, path: &str) -> Request {
    Request::new(Method::from_bytes(method.as_bytes()).expect("method"), path).expect("request")
}

pub fn body_text(response: &Response) -> String {
    String::from_utf8(response.body().to_vec()).expect("utf-8 body")
}

/// Records `"<event> <path>"` for every emission of the watched events.
pub struct EventRecorder {
    events: Vec<&'static str>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl EventRecorder {
    pub fn new(events: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            events: events.to_vec(),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl ServerPlugin for EventRecorder {
    fn name(&self) -> &'static str {
        "event-recorder"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        for name in &self.events {
            let log = Arc::clone(&self.log);
            let name = *name;
            server.on(name, 0, move |_, event: &mut Event<'_>| {
                let entry = match event {
                    Event::Move {
                        source,
                        destination,
                    } => format!("{name} {source}->{destination}"),
                    Event::PropFind { propfind, .. } => format!("{name} {}", propfind.path()),
                    other => format!("{name} {}", other.path().unwrap_or("-")),
                };
                log.lock().push(entry);
                Ok(Flow::Continue)
            });
        }
    }
}
