// src/errors.rs
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the kestrel-dispatch service
#[derive(Debug)]
pub enum KestrelError {
    // API boundary errors
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Gone(String),
    Forbidden(String),
    Unavailable(String),
    Internal(String),

    // Redis errors
    RedisConnection(String),
    RedisQuery(String),

    // Network and HTTP client errors
    NetworkTimeout,
    NetworkConnection(String),
    HttpClient(String),

    // Serialization and parsing errors
    JsonParsing(String),
    JsonSerialization(String),

    // Business logic errors
    DispatchNotFound(String),
    RideNotFound(String),
    DriverNotFound(String),
    NoDriversNearby,
    GeocodeMiss(String),
    OtpMismatch,

    // Validation errors
    ValidationFailed(Vec<ValidationError>),
    InvalidFieldValue {
        field: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            KestrelError::NotFound(msg) => write!(f, "Not found: {}", msg),
            KestrelError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            KestrelError::Gone(msg) => write!(f, "Gone: {}", msg),
            KestrelError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            KestrelError::Unavailable(msg) => write!(f, "Upstream unavailable: {}", msg),
            KestrelError::Internal(msg) => write!(f, "Internal error: {}", msg),

            KestrelError::RedisConnection(msg) => write!(f, "Redis connection error: {}", msg),
            KestrelError::RedisQuery(msg) => write!(f, "Redis query error: {}", msg),

            KestrelError::NetworkTimeout => write!(f, "Network request timed out"),
            KestrelError::NetworkConnection(msg) => write!(f, "Network connection error: {}", msg),
            KestrelError::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),

            KestrelError::JsonParsing(msg) => write!(f, "JSON parsing error: {}", msg),
            KestrelError::JsonSerialization(msg) => write!(f, "JSON serialization error: {}", msg),

            KestrelError::DispatchNotFound(id) => write!(f, "Dispatch not found: {}", id),
            KestrelError::RideNotFound(id) => write!(f, "Ride not found: {}", id),
            KestrelError::DriverNotFound(id) => write!(f, "Driver not found: {}", id),
            KestrelError::NoDriversNearby => write!(f, "No drivers nearby"),
            KestrelError::GeocodeMiss(text) => write!(f, "Could not resolve location: {}", text),
            KestrelError::OtpMismatch => write!(f, "OTP does not match"),

            KestrelError::ValidationFailed(errors) => {
                write!(f, "Validation failed: {} errors", errors.len())
            }
            KestrelError::InvalidFieldValue { field, value, reason } => {
                write!(f, "Invalid value '{}' for field '{}': {}", value, field, reason)
            }
        }
    }
}

impl std::error::Error for KestrelError {}

impl KestrelError {
    /// Transient faults are retried with backoff at the call site; everything
    /// else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KestrelError::Unavailable(_)
                | KestrelError::NetworkTimeout
                | KestrelError::NetworkConnection(_)
                | KestrelError::RedisConnection(_)
        )
    }
}

impl IntoResponse for KestrelError {
    fn into_response(self) -> Response {
        let (status, error_type, message, details) = match self {
            KestrelError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            KestrelError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            KestrelError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),
            KestrelError::Gone(msg) => (StatusCode::GONE, "gone", msg, None),
            KestrelError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),

            KestrelError::ValidationFailed(errors) => {
                let details = serde_json::to_value(&errors).ok();
                (
                    StatusCode::BAD_REQUEST,
                    "validation_failed",
                    "Validation errors occurred".to_string(),
                    details,
                )
            }
            KestrelError::InvalidFieldValue { field, reason, .. } => (
                StatusCode::BAD_REQUEST,
                "invalid_field",
                format!("Invalid value for {}: {}", field, reason),
                None,
            ),

            KestrelError::DispatchNotFound(id) => (
                StatusCode::NOT_FOUND,
                "dispatch_not_found",
                format!("Dispatch not found: {}", id),
                None,
            ),
            KestrelError::RideNotFound(id) => (
                StatusCode::NOT_FOUND,
                "ride_not_found",
                format!("Ride not found: {}", id),
                None,
            ),
            KestrelError::DriverNotFound(id) => (
                StatusCode::NOT_FOUND,
                "driver_not_found",
                format!("Driver not found: {}", id),
                None,
            ),
            KestrelError::NoDriversNearby => (
                StatusCode::NOT_FOUND,
                "no_drivers_nearby",
                "No drivers nearby".to_string(),
                None,
            ),
            KestrelError::GeocodeMiss(text) => (
                StatusCode::NOT_FOUND,
                "geocode_miss",
                format!("Could not resolve location: {}", text),
                None,
            ),
            KestrelError::OtpMismatch => (
                StatusCode::FORBIDDEN,
                "otp_mismatch",
                "OTP does not match".to_string(),
                None,
            ),

            KestrelError::Unavailable(msg)
            | KestrelError::NetworkConnection(msg)
            | KestrelError::HttpClient(msg) => {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable", msg, None)
            }
            KestrelError::NetworkTimeout => (
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "Network request timed out".to_string(),
                None,
            ),

            // Store faults and invariant violations are internal; these are
            // never swallowed silently.
            _ => {
                tracing::error!("internal error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", self.to_string(), None)
            }
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
        };

        (status, axum::Json(error_response)).into_response()
    }
}

// Convenience type alias for Results
pub type KestrelResult<T> = Result<T, KestrelError>;

// Conversion implementations for common error types
impl From<redis::RedisError> for KestrelError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => KestrelError::RedisConnection(err.to_string()),
            redis::ErrorKind::AuthenticationFailed => {
                KestrelError::RedisConnection("Authentication failed".to_string())
            }
            _ => KestrelError::RedisQuery(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for KestrelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KestrelError::NetworkTimeout
        } else if err.is_connect() {
            KestrelError::NetworkConnection(err.to_string())
        } else {
            KestrelError::HttpClient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for KestrelError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() {
            KestrelError::JsonParsing(err.to_string())
        } else {
            KestrelError::JsonSerialization(err.to_string())
        }
    }
}

// Helper functions for creating common errors
impl KestrelError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        KestrelError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        KestrelError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        KestrelError::Conflict(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        KestrelError::Gone(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        KestrelError::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KestrelError::Internal(msg.into())
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        KestrelError::ValidationFailed(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = KestrelError::DispatchNotFound("dsp-123".to_string());
        assert_eq!(error.to_string(), "Dispatch not found: dsp-123");
    }

    #[test]
    fn test_validation_error() {
        let error = KestrelError::validation_error("radiusKm", "must be at most 50");
        match error {
            KestrelError::ValidationFailed(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "radiusKm");
                assert_eq!(errors[0].message, "must be at most 50");
            }
            _ => panic!("Expected ValidationFailed error"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(KestrelError::unavailable("eta oracle down").is_transient());
        assert!(KestrelError::NetworkTimeout.is_transient());
        assert!(!KestrelError::conflict("cursor moved").is_transient());
        assert!(!KestrelError::gone("offer window elapsed").is_transient());
    }

    #[test]
    fn test_helper_functions() {
        assert!(matches!(KestrelError::bad_request("x"), KestrelError::BadRequest(_)));
        assert!(matches!(KestrelError::gone("x"), KestrelError::Gone(_)));
        assert!(matches!(KestrelError::conflict("x"), KestrelError::Conflict(_)));
        assert!(matches!(KestrelError::internal("x"), KestrelError::Internal(_)));
    }
}
