//! Path normalization helpers.
//!
//! Tree paths are slash-separated, relative to the DAV root, with no leading
//! or trailing slash. The root collection is the empty string.

use crate::error::{DavError, DavResult};

/// Normalize a request path: drop empty and `.` segments, reject `..`.
pub fn normalize(path: &str) -> DavResult<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(DavError::InvalidPath(path.to_string())),
            s if s.contains('\0') => return Err(DavError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Split into `(parent, name)`. The root splits into `("", "")`.
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Whether `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}
