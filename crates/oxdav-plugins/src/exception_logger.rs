//! Logs the error that aborted a request.

use std::sync::Arc;

use oxdav_core::{Event, Flow, Server, ServerPlugin};
use tracing::{debug, error};

/// Subscribes to `exception`. Errors that are part of normal client
/// behaviour (missing files, auth retries, lock contention) are logged at
/// debug level; everything else is an error.
#[derive(Debug)]
pub struct ExceptionLoggerPlugin {
    app: &'static str,
}

impl ExceptionLoggerPlugin {
    pub fn new(app: &'static str) -> Self {
        Self { app }
    }
}

impl ServerPlugin for ExceptionLoggerPlugin {
    fn name(&self) -> &'static str {
        "exception-logger"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        server.on("exception", oxdav_core::DEFAULT_PRIORITY, move |server, event| {
            let Event::Exception { error: e } = event else {
                return Ok(Flow::Continue);
            };
            let request = server.http_request();
            let method = request.as_ref().map_or("-", |r| r.method().as_str());
            let path = request.as_ref().map_or("-", |r| r.path());

            if e.is_expected() {
                debug!(app = self.app, method, path, kind = e.kind(), error = %e, "Request failed");
            } else {
                error!(
                    app = self.app,
                    method,
                    path,
                    kind = e.kind(),
                    status = e.status().as_u16(),
                    error = %e,
                    "Request failed"
                );
            }
            Ok(Flow::Continue)
        });
    }
}
