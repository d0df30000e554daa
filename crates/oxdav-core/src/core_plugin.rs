//! Built-in method handlers and live properties.
//!
//! Installed by [`Server::new`]. Every handler answers [`Flow::Stop`] once it
//! has produced a response; a handler that does not apply (GET on a
//! collection) answers [`Flow::Continue`] so another plugin may claim it.

use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::debug;

use crate::error::{DavError, DavResult};
use crate::event::{DEFAULT_PRIORITY, Event, Flow, HandlerResult};
use crate::node::Node;
use crate::plugin::ServerPlugin;
use crate::propfind::{COLLECTION, PropFind, PropFindResponse, PropStat, PropValue};
use crate::proppatch::PropPatch;
use crate::request::{Request, Response};
use crate::server::{Server, WriteOutcome, http_date};
use crate::tree::{LockGuard, LockKind};
use crate::xml;

/// Live properties clients may never write.
const PROTECTED_PROPERTIES: &[&str] = &[
    "{DAV:}getcontentlength",
    "{DAV:}getcontenttype",
    "{DAV:}resourcetype",
    "{DAV:}lockdiscovery",
    "{DAV:}supportedlock",
    "{DAV:}quota-available-bytes",
    "{DAV:}quota-used-bytes",
];

/// Core WebDAV method handlers.
#[derive(Debug, Default)]
pub struct CorePlugin;

type MethodHandler = fn(&Server, &Request, &mut Response) -> HandlerResult;

fn on_method(server: &Server, method: &str, handler: MethodHandler) {
    server.on(format!("method:{method}"), DEFAULT_PRIORITY, move |server, event| {
        match event.method_parts() {
            Some((request, response)) => handler(server, request, response),
            None => Ok(Flow::Continue),
        }
    });
}

impl ServerPlugin for CorePlugin {
    fn name(&self) -> &'static str {
        "core"
    }

    fn initialize(self: Arc<Self>, server: &Server) {
        on_method(server, "OPTIONS", http_options);
        on_method(server, "GET", http_get);
        on_method(server, "HEAD", http_get);
        on_method(server, "PUT", http_put);
        on_method(server, "MKCOL", http_mkcol);
        on_method(server, "DELETE", http_delete);
        on_method(server, "PROPFIND", http_propfind);
        on_method(server, "PROPPATCH", http_proppatch);
        on_method(server, "MOVE", http_move);
        on_method(server, "COPY", http_copy);
        on_method(server, "REPORT", http_report);

        server.on("propFind", DEFAULT_PRIORITY, |_, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                live_properties(propfind, node);
            }
            Ok(Flow::Continue)
        });
        server.on("propFind", 200, |_, event| {
            if let Some((propfind, node)) = event.propfind_parts() {
                propfind.handle("{DAV:}displayname", node.name());
            }
            Ok(Flow::Continue)
        });
        server.on("propPatch", 90, |_, event| {
            if let Some((_, proppatch)) = event.proppatch_parts() {
                protect_live_properties(proppatch);
            }
            Ok(Flow::Continue)
        });
    }
}

fn live_properties(propfind: &mut PropFind, node: &Node) {
    propfind.handle("{DAV:}getlastmodified", http_date(node.modified));
    propfind.handle("{DAV:}getetag", node.quoted_etag());
    if let Some(content_type) = node.content_type() {
        propfind.handle("{DAV:}getcontentlength", node.size);
        propfind.handle("{DAV:}getcontenttype", content_type);
    }
    propfind.handle_with("{DAV:}resourcetype", || {
        let types = if node.is_directory() {
            vec![COLLECTION.to_string()]
        } else {
            Vec::new()
        };
        Some(PropValue::ResourceType(types))
    });
}

fn protect_live_properties(proppatch: &mut PropPatch) {
    proppatch.set_result_code(PROTECTED_PROPERTIES, StatusCode::FORBIDDEN);
}

fn http_options(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let allow = server
        .allowed_methods(request.path())
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    response.set_header("Allow", &allow);
    response.set_header("DAV", &server.features().join(", "));
    response.set_header("MS-Author-Via", "DAV");
    response.set_header("Accept-Ranges", "bytes");
    response.set_header("Content-Length", "0");
    response.set_status(StatusCode::OK);
    Ok(Flow::Stop)
}

/// Standard entity headers for a file.
fn entity_headers(response: &mut Response, node: &Node) {
    let content_type = node.content_type().unwrap_or("application/octet-stream");
    response.set_header("Content-Type", content_type);
    response.set_header("ETag", &node.quoted_etag());
    response.set_header("Last-Modified", &http_date(node.modified));
}

/// GET and HEAD on files.
fn http_get(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let path = request.path();
    let node = server.tree().get_node_for_path(path)?;
    if !node.is_file() {
        return Ok(Flow::Continue);
    }

    let body = {
        let _lock = LockGuard::acquire(server.tree(), path, LockKind::Shared)?;
        server.tree().read(path)?
    };
    let len = body.len() as u64;

    entity_headers(response, &node);
    response.set_header("Accept-Ranges", "bytes");

    let body = match request.byte_range(len)? {
        Some((start, end)) => {
            response.set_status(StatusCode::PARTIAL_CONTENT);
            response.set_header("Content-Range", &format!("bytes {start}-{end}/{len}"));
            body.slice(usize::try_from(start).unwrap_or(usize::MAX)..=usize::try_from(end).unwrap_or(usize::MAX))
        }
        None => {
            response.set_status(StatusCode::OK);
            body
        }
    };
    response.set_header("Content-Length", &body.len().to_string());
    if *request.method() != Method::HEAD {
        response.set_body(body);
    }
    Ok(Flow::Stop)
}

fn http_put(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let path = request.path();
    if request.has_header("Content-Range") {
        return Err(DavError::BadRequest(
            "Content-Range on PUT requests are forbidden.".into(),
        ));
    }

    let (outcome, created) = match server.tree().get_node_for_path(path) {
        Ok(node) if node.is_directory() => {
            return Err(DavError::Conflict("PUT is not allowed on non-files.".into()));
        }
        Ok(_) => (server.update_file(path, request.body().clone())?, false),
        Err(DavError::NotFound(_)) => (server.create_file(path, request.body().clone())?, true),
        Err(e) => return Err(e),
    };

    let WriteOutcome::Written { etag } = outcome else {
        debug!(path, "Upload stopped by a listener");
        return Ok(Flow::Stop);
    };
    response.set_header("Content-Length", "0");
    if let Some(etag) = etag {
        response.set_header("ETag", &format!("\"{etag}\""));
    }
    response.set_status(if created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    });
    Ok(Flow::Stop)
}

fn http_mkcol(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    if !request.body().is_empty() {
        return Err(DavError::UnsupportedMediaType(
            "The request body for the MKCOL request is not supported".into(),
        ));
    }
    if server.create_directory(request.path())? {
        response.set_header("Content-Length", "0");
        response.set_status(StatusCode::CREATED);
    }
    Ok(Flow::Stop)
}

fn http_delete(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let path = request.path();
    server.tree().get_node_for_path(path)?;

    if !server.emit("beforeUnbind", &mut Event::Path { path })? {
        return Ok(Flow::Stop);
    }
    server.tree().delete(path)?;
    server.emit("afterUnbind", &mut Event::Path { path })?;

    response.set_header("Content-Length", "0");
    response.set_status(StatusCode::NO_CONTENT);
    Ok(Flow::Stop)
}

fn http_propfind(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let (kind, names) = xml::parse_propfind(request.body())?;
    let depth = server.propfind_depth(request);

    let mut responses = server.get_properties_for_path(request.path(), kind, &names, depth)?;
    if request.prefers_minimal() {
        for r in &mut responses {
            r.propstats.retain(|p| p.status != StatusCode::NOT_FOUND);
        }
    }

    response.set_status(StatusCode::MULTI_STATUS);
    response.set_header("Vary", "Brief,Prefer");
    response.set_header("DAV", &server.features().join(", "));
    response.set_xml_body(xml::multistatus(&responses, server.base_uri())?);
    Ok(Flow::Stop)
}

fn http_proppatch(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let path = request.path();
    let mutations = xml::parse_proppatch(request.body())?;
    let node = server.tree().get_node_for_path(path)?;
    let result = server.update_properties(path, mutations)?;

    response.set_header("Vary", "Brief,Prefer");
    if request.prefers_minimal() && result.iter().all(|(_, s)| s.as_u16() < 300) {
        response.set_status(StatusCode::NO_CONTENT);
        return Ok(Flow::Stop);
    }

    let mut propstats: Vec<PropStat> = Vec::new();
    for (name, status) in result {
        match propstats.iter_mut().find(|p| p.status == status) {
            Some(group) => group.properties.push((name, None)),
            None => propstats.push(PropStat {
                status,
                properties: vec![(name, None)],
            }),
        }
    }
    let multistatus = PropFindResponse {
        path: path.to_string(),
        is_collection: node.is_directory(),
        propstats,
    };
    response.set_status(StatusCode::MULTI_STATUS);
    response.set_xml_body(xml::multistatus(&[multistatus], server.base_uri())?);
    Ok(Flow::Stop)
}

/// Unbind an overwritten destination. Returns `false` when a listener
/// vetoed it.
fn unbind_destination(server: &Server, destination: &str) -> DavResult<bool> {
    if !server.emit("beforeUnbind", &mut Event::Path { path: destination })? {
        return Ok(false);
    }
    server.tree().delete(destination)?;
    server.emit("afterUnbind", &mut Event::Path { path: destination })?;
    Ok(true)
}

fn http_move(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let source = request.path();
    server.tree().get_node_for_path(source)?;
    let info = server.copy_move_info(request)?;
    let destination = info.destination.as_str();

    if info.destination_exists
        && !server.emit("beforeUnbind", &mut Event::Path { path: destination })?
    {
        return Ok(Flow::Stop);
    }
    if !server.emit("beforeUnbind", &mut Event::Path { path: source })?
        || !server.emit("beforeBind", &mut Event::Path { path: destination })?
        || !server.emit(
            "beforeMove",
            &mut Event::Move {
                source,
                destination,
            },
        )?
    {
        return Ok(Flow::Stop);
    }

    if info.destination_exists {
        server.tree().delete(destination)?;
        server.emit("afterUnbind", &mut Event::Path { path: destination })?;
    }
    server.tree().move_node(source, destination)?;

    // afterMove runs before afterUnbind so property stores can relocate
    // before the source path is cleaned up.
    server.emit(
        "afterMove",
        &mut Event::Move {
            source,
            destination,
        },
    )?;
    server.emit("afterUnbind", &mut Event::Path { path: source })?;
    server.emit("afterBind", &mut Event::Path { path: destination })?;

    response.set_header("Content-Length", "0");
    response.set_status(if info.destination_exists {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    });
    Ok(Flow::Stop)
}

fn http_copy(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let source = request.path();
    server.tree().get_node_for_path(source)?;
    let info = server.copy_move_info(request)?;
    let destination = info.destination.as_str();

    if !server.emit("beforeBind", &mut Event::Path { path: destination })? {
        return Ok(Flow::Stop);
    }
    if info.destination_exists && !unbind_destination(server, destination)? {
        return Ok(Flow::Stop);
    }

    server.tree().copy(source, destination)?;
    server.emit("afterBind", &mut Event::Path { path: destination })?;
    server.emit(
        "afterCopy",
        &mut Event::Move {
            source,
            destination,
        },
    )?;

    response.set_header("Content-Length", "0");
    response.set_status(if info.destination_exists {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    });
    Ok(Flow::Stop)
}

fn http_report(server: &Server, request: &Request, response: &mut Response) -> HandlerResult {
    let name = xml::report_name(request.body())?;
    let mut event = Event::Report {
        name: &name,
        path: request.path(),
        body: request.body(),
        response,
    };
    if server.emit("report", &mut event)? {
        return Err(DavError::Forbidden(format!(
            "The {name} report is not supported on this url"
        )));
    }
    Ok(Flow::Stop)
}
