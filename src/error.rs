//! # Error Handling
//!
//! Error types for both halves of the service:
//!
//! - **Core errors** ([`AcquireError`], [`DispatchError`]): returned by the
//!   transcription service. Each one also knows the integer sentinel it collapses
//!   to on the plain client protocol (`0` for a failed acquire, negative status
//!   codes for a rejected dispatch).
//! - **HTTP errors** ([`AppError`]): returned by request handlers and converted
//!   into JSON responses through actix's `ResponseError` trait.
//!
//! ## JSON Error Format:
//! ```json
//! {
//!   "error": {
//!     "type": "pool_exhausted",
//!     "message": "All 4 context slots are occupied",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Why a context could not be acquired.
///
/// The integer protocol reports both cases as handle `0`; inside the crate they
/// stay distinguishable so callers and logs can tell a full pool from a broken
/// model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Every slot already owns a live context
    PoolFull,

    /// The engine failed to construct a context from the model path
    LoadFailed(String),
}

impl AcquireError {
    /// Machine-readable reason string used in API responses.
    pub fn reason(&self) -> &'static str {
        match self {
            AcquireError::PoolFull => "pool_full",
            AcquireError::LoadFailed(_) => "load_failed",
        }
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::PoolFull => write!(f, "No empty context slot available"),
            AcquireError::LoadFailed(msg) => write!(f, "Failed to load model: {}", msg),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Why a transcription job was not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Handle is 0 or addresses a slot beyond the pool capacity
    OutOfRange,

    /// Slot is empty, or now belongs to a newer context than the handle refers to
    NoContext,

    /// The background execution unit could not be started
    SpawnFailed(String),
}

impl DispatchError {
    /// Status code on the integer protocol.
    pub fn status_code(&self) -> i32 {
        match self {
            DispatchError::OutOfRange => -1,
            DispatchError::NoContext => -2,
            DispatchError::SpawnFailed(_) => -3,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::OutOfRange => write!(f, "Handle is out of pool range"),
            DispatchError::NoContext => write!(f, "Handle does not refer to a live context"),
            DispatchError::SpawnFailed(msg) => write!(f, "Failed to start transcription worker: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Malformed request body or query (400)
/// - **NotFound**: Unknown context handle (404)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: Input failed validation rules (400)
/// - **PoolExhausted**: No free context slot (503)
/// - **ModelLoad**: The model could not be loaded (422)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    PoolExhausted(String),
    ModelLoad(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::PoolExhausted(msg) => write!(f, "Pool exhausted: {}", msg),
            AppError::ModelLoad(msg) => write!(f, "Model load failed: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::PoolExhausted(msg) => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted", msg),
            AppError::ModelLoad(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "model_load_failed", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON problems are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<AcquireError> for AppError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::PoolFull => AppError::PoolExhausted(err.to_string()),
            AcquireError::LoadFailed(_) => AppError::ModelLoad(err.to_string()),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::OutOfRange | DispatchError::NoContext => AppError::NotFound(err.to_string()),
            DispatchError::SpawnFailed(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(format!("Blocking task failed: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_status_codes() {
        assert_eq!(DispatchError::OutOfRange.status_code(), -1);
        assert_eq!(DispatchError::NoContext.status_code(), -2);
        assert_eq!(DispatchError::SpawnFailed("eagain".into()).status_code(), -3);
    }

    #[test]
    fn test_acquire_error_mapping() {
        assert_eq!(AcquireError::PoolFull.reason(), "pool_full");
        assert_eq!(AcquireError::LoadFailed("bad header".into()).reason(), "load_failed");

        let full: AppError = AcquireError::PoolFull.into();
        assert_eq!(full.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let load: AppError = AcquireError::LoadFailed("bad header".into()).into();
        assert_eq!(load.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(load.to_string().contains("bad header"));
    }

    #[test]
    fn test_dispatch_error_mapping() {
        let stale: AppError = DispatchError::NoContext.into();
        assert_eq!(stale.status_code(), StatusCode::NOT_FOUND);

        let spawn: AppError = DispatchError::SpawnFailed("eagain".into()).into();
        assert_eq!(spawn.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
