//! Error handling.
//!
//! The error kinds here are the HTTP-facing counterpart of the kinds named
//! in the design: `NotFound`, `AlreadyExists`, `DuplicateKey`,
//! `LockContended`, `LockUnavailable`, `UpstreamUnavailable`,
//! `UpstreamNotFound`, `IntegrityViolation`, `Cancelled`,
//! `DeadlineExceeded`, `ConfigInvalid`, `StorageIterationUnsupported`,
//! `IssuesFound`.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use ncps_core::CoreError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Generic HTTP responses.
    /// The URL you requested was not found.
    NotFound,

    /// Unauthorized.
    Unauthorized,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses.
    /// The requested narinfo does not exist.
    NoSuchNarinfo,

    /// The requested NAR does not exist.
    NoSuchNar,

    /// The narinfo or NAR already exists.
    AlreadyExists,

    /// Invalid compression type "{name}".
    InvalidCompressionType { name: String },

    /// Database error: {0}
    DatabaseError(AnyError),

    /// A row already exists under a unique key the caller was trying to insert.
    DuplicateKey,

    /// Storage error: {0}
    StorageError(AnyError),

    /// Storage backend does not support iteration (`WalkChunks`/`WalkNars`).
    StorageIterationUnsupported,

    /// Manifest serialization error: {0}
    ManifestSerializationError(super::nix_manifest::Error),

    /// Could not acquire the lock for "{key}" after retrying.
    LockContended { key: String },

    /// The lock backend for "{key}" is unavailable: {0}
    LockUnavailable(String, AnyError),

    /// The upstream cache is unavailable: {0}
    UpstreamUnavailable(AnyError),

    /// The upstream cache reported the artifact as missing.
    UpstreamNotFound,

    /// Integrity violation: {reason}
    IntegrityViolation { reason: String },

    /// The operation was cancelled.
    Cancelled,

    /// The operation's deadline elapsed.
    DeadlineExceeded,

    /// Invalid configuration: {0}
    ConfigInvalid(String),

    /// Error from the core library: {0}
    CoreError(CoreError),

    /// General request error: {0}
    RequestError(AnyError),

    /// fsck found unrepaired issues.
    IssuesFound,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    pub fn upstream_unavailable(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::UpstreamUnavailable(AnyError::new(error))
    }

    pub fn lock_unavailable(key: impl Into<String>, error: impl StdError + Send + Sync + 'static) -> Self {
        Self::LockUnavailable(key.into(), AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::InternalServerError => "InternalServerError",
            Self::NoSuchNarinfo => "NoSuchNarinfo",
            Self::NoSuchNar => "NoSuchNar",
            Self::AlreadyExists => "AlreadyExists",
            Self::InvalidCompressionType { .. } => "InvalidCompressionType",
            Self::DatabaseError(_) => "DatabaseError",
            Self::DuplicateKey => "DuplicateKey",
            Self::StorageError(_) => "StorageError",
            Self::StorageIterationUnsupported => "StorageIterationUnsupported",
            Self::ManifestSerializationError(_) => "ManifestSerializationError",
            Self::LockContended { .. } => "LockContended",
            Self::LockUnavailable(..) => "LockUnavailable",
            Self::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Self::UpstreamNotFound => "UpstreamNotFound",
            Self::IntegrityViolation { .. } => "IntegrityViolation",
            Self::Cancelled => "Cancelled",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::CoreError(_) => "CoreError",
            Self::RequestError(_) => "RequestError",
            Self::IssuesFound => "IssuesFound",
        }
    }

    /// Returns a version of this error safe to hand to a client, sanitizing
    /// anything that might leak internal state.
    fn into_client(self) -> Self {
        match self {
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(_) => Self::InternalServerError,
            Self::ManifestSerializationError(_) => Self::InternalServerError,
            Self::CoreError(_) => Self::InternalServerError,
            Self::LockUnavailable(..) => Self::InternalServerError,
            Self::ConfigInvalid(_) => Self::InternalServerError,
            Self::NoSuchNarinfo => Self::NotFound,
            Self::NoSuchNar => Self::NotFound,
            other => other,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NoSuchNarinfo => StatusCode::NOT_FOUND,
            Self::NoSuchNar => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::AlreadyExists => StatusCode::CONFLICT,
            Self::InvalidCompressionType { .. } => StatusCode::BAD_REQUEST,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            // Upstream is gone but we've exhausted any local fallback: 502.
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamNotFound => StatusCode::NOT_FOUND,
            Self::IntegrityViolation { .. } => StatusCode::BAD_GATEWAY,
            // Eviction holds the write lock; the serving path's read-lock
            // acquisition gave up within its deadline.
            Self::LockContended { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<CoreError> for ServerError {
    fn from(error: CoreError) -> Self {
        Self::CoreError(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_)
                | Self::StorageError(_)
                | Self::ManifestSerializationError(_)
                | Self::CoreError(_)
                | Self::LockUnavailable(..)
                | Self::IntegrityViolation { .. }
        ) {
            tracing::error!(error = ?self, "request failed");
        }

        let sanitized = self.into_client();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}
