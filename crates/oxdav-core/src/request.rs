//! Transport-independent request and response.
//!
//! The HTTP front end converts its wire types into [`Request`] (method,
//! normalized tree path, headers, fully-read body) and turns the
//! [`Response`] produced by the pipeline back into a wire response.

use std::sync::LazyLock;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use regex::Regex;

use crate::error::{DavError, DavResult};
use crate::path;
use crate::propfind::Depth;

/// An incoming request, already resolved to a tree path.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    /// Build a request for a tree path. The path is normalized.
    pub fn new(method: Method, path: &str) -> DavResult<Self> {
        Ok(Self {
            method,
            path: path::normalize(path)?,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    /// Build a request from a raw (percent-encoded) URI path below `base_uri`.
    pub fn from_uri(
        method: Method,
        uri_path: &str,
        base_uri: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> DavResult<Self> {
        Ok(Self {
            method,
            path: resolve_uri_path(uri_path, base_uri)?,
            headers,
            body,
        })
    }

    /// Add a header, builder style. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Normalized tree path (no leading slash).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name` when it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Parse the `Depth` header.
    ///
    /// Missing or non-numeric values yield `default`; any positive number is
    /// treated as one level.
    pub fn depth(&self, default: Depth) -> Depth {
        match self.header("Depth").map(str::trim) {
            None => default,
            Some(v) if v.eq_ignore_ascii_case("infinity") => Depth::Infinity,
            Some(v) => match v.parse::<u32>() {
                Ok(0) => Depth::Zero,
                Ok(_) => Depth::One,
                Err(_) => default,
            },
        }
    }

    /// `Prefer: return=minimal` (or the legacy `Brief: t`).
    pub fn prefers_minimal(&self) -> bool {
        let prefer = self
            .header("Prefer")
            .is_some_and(|p| p.split(',').any(|part| part.trim() == "return=minimal"));
        prefer || self.header("Brief").is_some_and(|b| b.eq_ignore_ascii_case("t"))
    }

    /// Parse the `Overwrite` header. Absent means `T`.
    pub fn overwrite(&self) -> DavResult<bool> {
        match self.header("Overwrite").map(str::trim) {
            None => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("t") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("f") => Ok(false),
            Some(v) => Err(DavError::BadRequest(format!(
                "The HTTP Overwrite header should be either T or F, got {v}"
            ))),
        }
    }

    /// Single `bytes=start-end` range, resolved against `len`.
    ///
    /// Returns `Ok(None)` when there is no (or an unsupported) Range header.
    pub fn byte_range(&self, len: u64) -> DavResult<Option<(u64, u64)>> {
        static RANGE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^\s*bytes\s*=\s*(\d*)\s*-\s*(\d*)\s*$").expect("valid regex literal")
        });

        let Some(header) = self.header("Range") else {
            return Ok(None);
        };
        let Some(caps) = RANGE.captures(header) else {
            return Ok(None);
        };
        let start = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
        let end = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());

        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if s > e => {
                return Err(DavError::RangeNotSatisfiable(format!("{s}-{e}")));
            }
            (Some(s), Some(e)) => (s, e.min(len.saturating_sub(1))),
            (Some(s), None) => (s, len.saturating_sub(1)),
            (None, Some(suffix)) => (len.saturating_sub(suffix), len.saturating_sub(1)),
            (None, None) => return Ok(None),
        };
        if len == 0 || start >= len {
            return Err(DavError::RangeNotSatisfiable(format!(
                "start {start} is beyond the end of a {len} byte resource"
            )));
        }
        Ok(Some((start, end)))
    }

    /// Parse the WebDAV `If:` header into per-URI conditions.
    ///
    /// Untagged lists apply to the request path; tagged lists (`<uri> (...)`)
    /// are resolved through `resolve_uri`.
    pub fn if_conditions<F>(&self, resolve_uri: F) -> DavResult<Vec<IfCondition>>
    where
        F: Fn(&str) -> DavResult<String>,
    {
        static LIST: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)(?:<(?P<uri>[^>]*)>\s*)?\((?P<body>[^)]*)\)").expect("valid regex literal")
        });
        static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)(?P<not>Not\s+)?(?:<(?P<token>[^>]*)>|\[(?P<etag>[^\]]*)\])")
                .expect("valid regex literal")
        });

        let Some(header) = self.header("If") else {
            return Ok(Vec::new());
        };

        let mut conditions: Vec<IfCondition> = Vec::new();
        let mut last_uri = self.path.clone();
        for list in LIST.captures_iter(header) {
            if let Some(uri) = list.name("uri") {
                last_uri = resolve_uri(uri.as_str())?;
            }

            let mut token = IfToken::default();
            for item in TOKEN.captures_iter(&list["body"]) {
                if item.name("not").is_some() {
                    token.negate = true;
                }
                if let Some(t) = item.name("token") {
                    token.token = t.as_str().to_string();
                }
                if let Some(e) = item.name("etag") {
                    token.etag = e.as_str().to_string();
                }
            }

            match conditions.iter_mut().find(|c| c.uri == last_uri) {
                Some(condition) => condition.tokens.push(token),
                None => conditions.push(IfCondition {
                    uri: last_uri.clone(),
                    tokens: vec![token],
                }),
            }
        }
        Ok(conditions)
    }
}

/// Decode an absolute URI path and resolve it to a tree path below
/// `base_uri`. Paths outside the base are `Forbidden`.
pub fn resolve_uri_path(uri_path: &str, base_uri: &str) -> DavResult<String> {
    let decoded = urlencoding::decode(uri_path)
        .map_err(|e| DavError::InvalidPath(format!("{uri_path}: {e}")))?;
    let relative = strip_base(&decoded, base_uri).ok_or_else(|| {
        DavError::Forbidden(format!(
            "Requested uri ({uri_path}) is out of base uri ({base_uri})"
        ))
    })?;
    path::normalize(relative)
}

/// Strip `base_uri` from an absolute decoded path.
fn strip_base<'a>(path: &'a str, base_uri: &str) -> Option<&'a str> {
    let base = base_uri.trim_end_matches('/');
    if base.is_empty() {
        return Some(path);
    }
    if path == base {
        return Some("");
    }
    path.strip_prefix(base).filter(|rest| rest.starts_with('/'))
}

/// One condition list of an `If:` header, applying to `uri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfCondition {
    /// Normalized tree path the tokens apply to.
    pub uri: String,
    pub tokens: Vec<IfToken>,
}

/// One `(...)` list entry. Lock plugins flip `valid` during `validateTokens`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfToken {
    pub token: String,
    /// Quoted entity tag, as sent.
    pub etag: String,
    pub negate: bool,
    pub valid: bool,
}

/// Response under construction.
///
/// Status is `None` until some handler decides it; the server treats a
/// response that leaves the pipeline without a status as an internal error.
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of `name`.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Replace `name`. Invalid names or values are logged and ignored.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some((name, value)) = header_pair(name, value) {
            self.headers.insert(name, value);
        }
    }

    /// Append another value for `name`.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if let Some((name, value)) = header_pair(name, value) {
            self.headers.append(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Set an XML body with its content type.
    pub fn set_xml_body(&mut self, xml: String) {
        self.set_header("Content-Type", "application/xml; charset=utf-8");
        self.set_header("Content-Length", &xml.len().to_string());
        self.body = Bytes::from(xml);
    }

    /// Split into parts for the transport.
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (
            self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            self.headers,
            self.body,
        )
    }
}

fn header_pair(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            tracing::warn!(header = name, "Dropping invalid response header");
            None
        }
    }
}
