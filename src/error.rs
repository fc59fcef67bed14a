//! Error types for the APK signer.
//!
//! [`SigningError`] is the single failure kind the signing core hands back.
//! [`ServiceError`] is what HTTP handlers return; it implements `ResponseError`
//! for Actix-web integration, converting domain errors into status codes.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;
use crate::tools::ToolError;

/// Underlying cause of a [`SigningError`].
#[derive(Error, Debug)]
pub enum SigningFailure {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keystore vanished after losing the creation race")]
    RepeatedCollision,
}

/// Identity resolution or package signing failed for one application.
#[derive(Error, Debug)]
#[error("Signing failed for {apk_id}: {failure}")]
pub struct SigningError {
    pub apk_id: String,
    #[source]
    pub failure: SigningFailure,
}

impl SigningError {
    pub fn new(apk_id: &str, failure: impl Into<SigningFailure>) -> Self {
        Self {
            apk_id: apk_id.to_string(),
            failure: failure.into(),
        }
    }
}

pub type SigningResult<T> = Result<T, SigningError>;

/// Service error type with structured error responses.
#[derive(Error, Debug)]
pub enum ServiceError {
    // Request validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unsigned package not found: {0}")]
    SourceNotFound(String),

    // Authentication errors
    #[error("Unauthorized")]
    Unauthorized,

    // Signing errors
    #[error(transparent)]
    Signing(SigningError),

    // Environment errors (missing JDK tools and the like)
    #[error("Environment error: {0}")]
    Environment(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ServiceError {
    /// Get the error code for structured error responses.
    fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInput(_) => Some("INVALID_INPUT"),
            Self::HashMismatch { .. } => Some("HASH_MISMATCH"),
            Self::SourceNotFound(_) => Some("SOURCE_NOT_FOUND"),
            Self::Unauthorized => Some("UNAUTHORIZED"),
            Self::Signing(_) => Some("SIGNING_FAILED"),
            Self::Environment(_) => Some("ENVIRONMENT_ERROR"),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request - Client errors
            Self::InvalidInput(_) | Self::HashMismatch { .. } | Self::SourceNotFound(_) => {
                StatusCode::BAD_REQUEST
            }

            // 401 Unauthorized
            Self::Unauthorized => StatusCode::UNAUTHORIZED,

            // 500 Internal Server Error - Everything else
            Self::Signing(_) | Self::Environment(_) | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Tool output and paths stay in the logs.
        let error = match self {
            Self::Signing(_) => "Signing failed".to_string(),
            Self::Environment(_) => "Signing toolchain unavailable".to_string(),
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error,
            code: self.error_code().map(String::from),
        };

        HttpResponse::build(self.status_code()).json(body)
    }
}

// Conversion from common error types

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NoSuchObject { bucket, path } => {
                Self::SourceNotFound(format!("{bucket}/{path}"))
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<SigningError> for ServiceError {
    /// A tool that could not be started is an environment problem, not a
    /// failure of this particular signing request.
    fn from(err: SigningError) -> Self {
        match &err.failure {
            SigningFailure::Tool(tool) if !tool.is_execution_error() => {
                Self::Environment(err.to_string())
            }
            _ => Self::Signing(err),
        }
    }
}

impl From<ToolError> for ServiceError {
    fn from(err: ToolError) -> Self {
        Self::Environment(err.to_string())
    }
}

/// Result type alias for handler operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
