//! # Error Handling
//!
//! This module defines the error taxonomy shared by the session core and the HTTP surface,
//! and how those errors are converted to HTTP responses.
//!
//! ## Error Classes:
//!
//! ### Session errors (never turned into HTTP responses by the session itself)
//! - **PermissionDenied / DeviceNotFound**: microphone problems, short-circuit `start`
//! - **EngineConnection**: the conversational engine failed, session goes to `Error`
//! - **ExternalService**: the signing provider or persistence failed, scoped to the tool call
//! - **Validation**: local form validation, never reaches the engine
//! - **TransientTeardown**: failures while stopping, always swallowed
//!
//! ### HTTP errors
//! - **Internal / BadRequest / NotFound / ConfigError**: gateway route failures
//! - **CapacityExceeded**: no free session slot for a new websocket
//!
//! ## Response shape:
//! Every error response follows the gateway failure contract so that the
//! session-side client can read `error` regardless of which route failed:
//! ```json
//! { "success": false, "error": "Invalid email format", "type": "validation_error", "timestamp": "..." }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Rust Concepts:
/// - **enum**: A type that can be one of several variants
/// - **String**: Each variant holds a human-readable message
/// - **#[derive(Debug, Clone, PartialEq)]**: Errors are compared in tests and
///   cloned into session views
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::ValidationError("Please enter your full name".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Internal server errors (unexpected failures)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Every session slot is taken
    CapacityExceeded(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Microphone permission was refused by the user or the platform
    PermissionDenied(String),

    /// No capture device is available
    DeviceNotFound(String),

    /// The conversational engine could not be reached or rejected the call
    EngineConnection(String),

    /// The signing provider or the persistence layer failed
    ExternalService(String),

    /// Failure while tearing a session down; never surfaced
    TransientTeardown(String),
}

impl AppError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::CapacityExceeded(_) => "capacity_exceeded",
            AppError::ValidationError(_) => "validation_error",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::DeviceNotFound(_) => "device_not_found",
            AppError::EngineConnection(_) => "engine_connection_error",
            AppError::ExternalService(_) => "external_service_error",
            AppError::TransientTeardown(_) => "transient_teardown_error",
        }
    }

    /// The bare message without the category prefix added by `Display`.
    ///
    /// ## Why this exists:
    /// The UI shows provider messages verbatim (e.g. "Invalid email"), while
    /// logs use the prefixed `Display` form.
    pub fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::CapacityExceeded(msg)
            | AppError::ValidationError(msg)
            | AppError::PermissionDenied(msg)
            | AppError::DeviceNotFound(msg)
            | AppError::EngineConnection(msg)
            | AppError::ExternalService(msg)
            | AppError::TransientTeardown(msg) => msg,
        }
    }

    /// Teardown failures are discarded instead of being shown to the user.
    pub fn is_swallowed(&self) -> bool {
        matches!(self, AppError::TransientTeardown(_))
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used when an error is logged or converted with `.to_string()`.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::CapacityExceeded(msg) => write!(f, "Capacity exceeded: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            AppError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            AppError::EngineConnection(msg) => write!(f, "Engine connection error: {}", msg),
            AppError::ExternalService(msg) => write!(f, "External service error: {}", msg),
            AppError::TransientTeardown(msg) => write!(f, "Teardown error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - ExternalService → 502 (Bad Gateway)
/// - CapacityExceeded → 503 (Service Unavailable)
/// - Everything else → 500 (Internal Server Error)
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "error": self.message(),          // Human-readable error message
            "type": self.kind(),              // Machine-readable error type
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// ## Usage:
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// ## Why BadRequest:
/// JSON parsing errors are almost always due to the client sending malformed data.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Transport failures while talking to the signing provider or the gateway.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalService(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_message_has_no_prefix() {
        let err = AppError::ExternalService("Invalid email".to_string());
        assert_eq!(err.message(), "Invalid email");
        assert_eq!(err.to_string(), "External service error: Invalid email");
    }

    #[test]
    fn test_only_teardown_is_swallowed() {
        assert!(AppError::TransientTeardown("stop failed".into()).is_swallowed());
        assert!(!AppError::EngineConnection("gone".into()).is_swallowed());
    }

    #[actix_web::test]
    async fn test_error_response_follows_gateway_contract() {
        let response = AppError::ValidationError("Invalid email format".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Invalid email format");
        assert_eq!(json["type"], "validation_error");
    }
}
