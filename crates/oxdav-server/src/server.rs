//! HTTP server lifecycle management.
//!
//! Connections are served by hyper; each request body is collected and the
//! synchronous plugin pipeline runs on the blocking pool.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request as HttpRequest, Response as HttpResponse, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use oxdav_core::{DavError, Request, Response, xml};
use oxdav_plugins::ServerFactory;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;

/// A running WebDAV server instance.
pub struct WebDavServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    base_uri: String,
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle.
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl WebDavServer {
    /// Bind the configured address and start serving `factory`.
    pub async fn start(config: &ServerConfig, factory: ServerFactory) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let actual_addr = listener.local_addr()?;
        let base_uri = factory.base_uri().trim_end_matches('/').to_string();

        info!(addr = %actual_addr, base_uri = %factory.base_uri(), "Starting WebDAV server");

        let factory = Arc::new(factory);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, factory) => {
                    debug!("Server loop ended");
                }
                _ = shutdown_rx => {
                    info!("Received shutdown signal");
                }
            }
        });

        Ok(Self {
            addr: actual_addr,
            base_uri,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// URL of the served tree's root.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.base_uri)
    }

    /// Stop the server.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        info!("WebDAV server stopped");
    }

    /// Stop the server synchronously (for use in Drop).
    fn stop_sync(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for WebDavServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

/// Run the server accept loop.
async fn run_server(listener: TcpListener, factory: Arc<ServerFactory>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let factory = Arc::clone(&factory);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: HttpRequest<Incoming>| {
                        let factory = Arc::clone(&factory);
                        async move { Ok::<_, Infallible>(serve(factory, req).await) }
                    });

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(peer = %peer_addr, error = %e, "HTTP connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

#[instrument(level = "debug", skip_all, fields(method = %req.method(), uri = %req.uri()))]
async fn serve(factory: Arc<ServerFactory>, req: HttpRequest<Incoming>) -> HttpResponse<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return into_http(error_response(&DavError::BadRequest(format!(
                "Failed to read request body: {e}"
            ))));
        }
    };

    let dispatched = tokio::task::spawn_blocking(move || {
        match Request::from_uri(
            parts.method,
            parts.uri.path(),
            factory.base_uri(),
            parts.headers,
            body,
        ) {
            Ok(request) => factory.handle(request),
            Err(e) => {
                debug!(error = %e, "Rejected request uri");
                error_response(&e)
            }
        }
    })
    .await;

    match dispatched {
        Ok(response) => into_http(response),
        Err(e) => {
            error!(error = %e, "Request handler panicked");
            into_http(error_response(&DavError::Internal("Request handler failed".into())))
        }
    }
}

/// Error response for failures outside the pipeline.
fn error_response(error: &DavError) -> Response {
    let mut response = Response::new();
    response.set_status(error.status());
    match xml::error_document(error) {
        Ok(body) => response.set_xml_body(body),
        Err(e) => {
            error!(error = %e, "Failed to render error body");
            response.set_header("Content-Length", "0");
        }
    }
    response
}

fn into_http(response: Response) -> HttpResponse<Full<Bytes>> {
    let (status, headers, body) = response.into_parts();
    let mut out = HttpResponse::new(Full::new(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    if out.status() == StatusCode::NO_CONTENT || out.status() == StatusCode::NOT_MODIFIED {
        out.headers_mut().remove(hyper::header::CONTENT_LENGTH);
    }
    out
}
