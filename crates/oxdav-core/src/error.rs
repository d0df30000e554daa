//! Error taxonomy for the DAV pipeline.
//!
//! Every failure that can cross a plugin boundary is a [`DavError`]. The
//! server converts the error that aborted a request into an HTTP status with
//! [`DavError::status`] after emitting the `exception` event.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors raised by the tree, the coordinators, the server and plugins.
#[derive(Debug, Error)]
pub enum DavError {
    /// Resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Permission denied.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Password authentication is disabled for this account.
    ///
    /// Distinct from a wrong password, which is reported as a failed
    /// authentication result rather than an error.
    #[error("Password login forbidden")]
    PasswordLoginForbidden,

    /// Not enough free space for the upload.
    #[error("Insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Backing storage is temporarily unavailable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Authentication required or rejected.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// Path is malformed (e.g. contains `..`).
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource is locked by another operation.
    #[error("File locked: {0}")]
    FileLocked(String),

    /// Parent collection missing or similar state conflict.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A conditional request header did not match.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Method not allowed on this resource.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// No handler claimed the method or report.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Request body type is not supported.
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Requested byte range cannot be served.
    #[error("Requested range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DavError {
    /// HTTP status code sent to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::NotFound(_) => StatusCode::NOT_FOUND,
            DavError::Forbidden(_) | DavError::PasswordLoginForbidden => StatusCode::FORBIDDEN,
            DavError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            DavError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DavError::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            DavError::InvalidPath(_) | DavError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DavError::FileLocked(_) => StatusCode::LOCKED,
            DavError::Conflict(_) => StatusCode::CONFLICT,
            DavError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DavError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            DavError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            DavError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            DavError::Io(e) => io_error_status(e),
            DavError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is part of normal client interaction.
    ///
    /// Sync clients probe for missing files, race each other on uploads and
    /// retry without credentials; none of that is a server fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            DavError::NotFound(_)
                | DavError::NotAuthenticated(_)
                | DavError::PasswordLoginForbidden
                | DavError::FileLocked(_)
                | DavError::Conflict(_)
                | DavError::MethodNotAllowed(_)
                | DavError::NotImplemented(_)
                | DavError::RangeNotSatisfiable(_)
                | DavError::ServiceUnavailable(_)
        )
    }

    /// Short exception class name rendered into the XML error body.
    pub fn kind(&self) -> &'static str {
        match self {
            DavError::NotFound(_) => "NotFound",
            DavError::Forbidden(_) => "Forbidden",
            DavError::PasswordLoginForbidden => "PasswordLoginForbidden",
            DavError::InsufficientStorage(_) => "InsufficientStorage",
            DavError::ServiceUnavailable(_) => "ServiceUnavailable",
            DavError::NotAuthenticated(_) => "NotAuthenticated",
            DavError::InvalidPath(_) => "InvalidPath",
            DavError::BadRequest(_) => "BadRequest",
            DavError::FileLocked(_) => "FileLocked",
            DavError::Conflict(_) => "Conflict",
            DavError::PreconditionFailed(_) => "PreconditionFailed",
            DavError::MethodNotAllowed(_) => "MethodNotAllowed",
            DavError::NotImplemented(_) => "NotImplemented",
            DavError::UnsupportedMediaType(_) => "UnsupportedMediaType",
            DavError::RangeNotSatisfiable(_) => "RequestedRangeNotSatisfiable",
            DavError::Io(_) => "IoError",
            DavError::Internal(_) => "InternalError",
        }
    }
}

/// Map an IO error kind to an HTTP status.
pub fn io_error_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        io::ErrorKind::AlreadyExists => StatusCode::METHOD_NOT_ALLOWED,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => StatusCode::BAD_REQUEST,
        io::ErrorKind::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Result type for DAV operations.
pub type DavResult<T> = Result<T, DavError>;
