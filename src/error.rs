use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Path is outside the site root: {0}")]
    PathEscape(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Missing authenticated principal")]
    Unauthenticated,
}

impl PanelError {
    /// Classify an OS error against the tenant-relative path it concerns.
    ///
    /// `io::Error` display strings never carry the path, so the message stays
    /// free of absolute locations.
    pub fn from_io(relative: &str, err: io::Error) -> Self {
        let subject = display_relative(relative);
        match err.kind() {
            io::ErrorKind::NotFound => PanelError::NotFound(subject),
            io::ErrorKind::PermissionDenied => {
                PanelError::PermissionDenied(format!("{subject}: {err}"))
            }
            io::ErrorKind::AlreadyExists => PanelError::Conflict(subject),
            io::ErrorKind::Unsupported => PanelError::InvalidArgument(format!("{subject}: {err}")),
            _ => PanelError::Internal(format!("{subject}: {err}")),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PanelError::InvalidArgument(_) => "INVALID_ARGUMENT",
            PanelError::PathEscape(_) => "PATH_ESCAPE",
            PanelError::NotFound(_) => "NOT_FOUND",
            PanelError::PermissionDenied(_) => "PERMISSION_DENIED",
            PanelError::Conflict(_) => "CONFLICT",
            PanelError::Internal(_) => "INTERNAL",
            PanelError::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

/// Render a tenant-relative path for messages, `/` standing for the site root.
pub fn display_relative(relative: &str) -> String {
    let trimmed = relative.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = match &self {
            PanelError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            PanelError::PathEscape(_) => StatusCode::FORBIDDEN,
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            PanelError::Conflict(_) => StatusCode::CONFLICT,
            PanelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PanelError::Unauthenticated => StatusCode::UNAUTHORIZED,
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

pub type PanelResult<T> = Result<T, PanelError>;
