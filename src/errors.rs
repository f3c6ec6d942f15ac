use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::fmt;
use tower_governor::GovernorError;

use crate::features::ValidationError;
use crate::inference::InternalScoringError;
use crate::models::{ErrorBody, ProfileDecodeError};

/// Application-specific error types.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Body is not JSON, or not the expected shape.
    InvalidPayload(String),
    /// Body exceeds the configured size limit.
    PayloadTooLarge(String),
    /// A field failed schema checks.
    Validation(ValidationError),
    /// Batch request is empty or too large.
    InvalidBatch(String),
    /// The model artifact has not finished loading (or failed to).
    ModelUnavailable,
    /// The request did not finish within its processing budget.
    Overloaded { budget_ms: u64 },
    /// The client exceeded its per-IP request rate.
    RateLimited { wait_secs: u64 },
    /// Code and artifact disagree; every prediction may be suspect.
    InternalScoring(InternalScoringError),
    /// Internal server error.
    InternalError(String),
    /// Resource not found error.
    NotFound(String),
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::Validation(e) => write!(f, "Validation failed: {}", e),
            AppError::InvalidBatch(msg) => write!(f, "Invalid batch: {}", msg),
            AppError::ModelUnavailable => write!(f, "Model is not loaded yet"),
            AppError::Overloaded { budget_ms } => {
                write!(f, "Request exceeded its {}ms processing budget", budget_ms)
            }
            AppError::RateLimited { wait_secs } => {
                write!(f, "Rate limit exceeded, retry in {}s", wait_secs)
            }
            AppError::InternalScoring(e) => write!(f, "Internal scoring error: {}", e),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// HTTP status the error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidPayload(_) | AppError::InvalidBatch(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ModelUnavailable | AppError::Overloaded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::InternalScoring(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Seconds a client should wait before retrying, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::Overloaded { .. } => Some(1),
            AppError::RateLimited { wait_secs } => Some((*wait_secs).max(1)),
            _ => None,
        }
    }

    /// Structured body sent to the caller. Server-side details stay in logs.
    pub fn body(&self) -> ErrorBody {
        let (code, message, field) = match self {
            AppError::InvalidPayload(msg) => ("invalid_payload", msg.clone(), None),
            AppError::PayloadTooLarge(msg) => ("payload_too_large", msg.clone(), None),
            AppError::Validation(e) => (
                "validation_error",
                e.reason.to_string(),
                Some(e.field.clone()),
            ),
            AppError::InvalidBatch(msg) => ("invalid_batch", msg.clone(), None),
            AppError::ModelUnavailable => (
                "model_unavailable",
                "Model is not loaded yet".to_string(),
                None,
            ),
            AppError::Overloaded { .. } => (
                "overloaded",
                "Server is busy, retry later".to_string(),
                None,
            ),
            AppError::RateLimited { wait_secs } => (
                "rate_limited",
                format!("Too many requests, retry in {}s", wait_secs),
                None,
            ),
            AppError::InternalScoring(_) => (
                "internal_scoring_error",
                "Internal scoring error".to_string(),
                None,
            ),
            AppError::InternalError(_) => (
                "internal_error",
                "Internal server error".to_string(),
                None,
            ),
            AppError::NotFound(msg) => ("not_found", msg.clone(), None),
        };

        ErrorBody {
            code: code.to_string(),
            message,
            field,
        }
    }
}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Client errors are logged quietly; server errors at ERROR.
    fn into_response(self) -> Response {
        match &self {
            AppError::InvalidPayload(_)
            | AppError::PayloadTooLarge(_)
            | AppError::Validation(_)
            | AppError::InvalidBatch(_) => tracing::debug!("Client error: {}", self),
            AppError::NotFound(_) => tracing::debug!("{}", self),
            AppError::ModelUnavailable => tracing::warn!("Request rejected: model not ready"),
            AppError::Overloaded { budget_ms } => {
                tracing::warn!("Request shed after {}ms budget", budget_ms)
            }
            AppError::RateLimited { .. } => tracing::debug!("{}", self),
            // Already reported on the scoring_invariant target where it was raised.
            AppError::InternalScoring(_) => {}
            AppError::InternalError(msg) => tracing::error!("Internal error: {}", msg),
        }

        let status = self.status();
        let body = Json(self.body());

        match self.retry_after() {
            Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err)
    }
}

impl From<ProfileDecodeError> for AppError {
    fn from(err: ProfileDecodeError) -> Self {
        match err {
            ProfileDecodeError::NotAnObject(_) => AppError::InvalidPayload(err.to_string()),
            ProfileDecodeError::Field(e) => AppError::Validation(e),
        }
    }
}

impl From<InternalScoringError> for AppError {
    fn from(err: InternalScoringError) -> Self {
        AppError::InternalScoring(err)
    }
}

impl From<JsonRejection> for AppError {
    /// Converts an axum JSON extraction failure into an `AppError`.
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(rejection.body_text())
        } else {
            AppError::InvalidPayload(rejection.body_text())
        }
    }
}

impl From<GovernorError> for AppError {
    /// Maps rate limiter rejections onto the structured error body.
    fn from(err: GovernorError) -> Self {
        match err {
            GovernorError::TooManyRequests { wait_time, .. } => AppError::RateLimited {
                wait_secs: wait_time,
            },
            GovernorError::UnableToExtractKey => {
                AppError::InternalError("unable to identify client for rate limiting".to_string())
            }
            GovernorError::Other { code, msg, .. } => AppError::InternalError(format!(
                "rate limiter failed with {}: {}",
                code,
                msg.unwrap_or_default()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ValidationReason;

    #[test]
    fn test_validation_error_names_field() {
        let err = AppError::from(ValidationError::new(
            "annual_revenue",
            ValidationReason::Missing,
        ));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = err.body();
        assert_eq!(body.code, "validation_error");
        assert_eq!(body.field.as_deref(), Some("annual_revenue"));
        assert_eq!(body.message, "required field is missing");
    }

    #[test]
    fn test_server_errors_hide_details() {
        let err = AppError::InternalScoring(InternalScoringError::FeatureCountMismatch {
            expected: 8,
            actual: 7,
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body().message, "Internal scoring error");
        assert!(err.body().field.is_none());
    }

    #[test]
    fn test_overload_sets_retry_after() {
        let response = AppError::Overloaded { budget_ms: 100 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_decode_errors_split_by_kind() {
        let not_object = ProfileDecodeError::NotAnObject("array");
        assert!(matches!(
            AppError::from(not_object),
            AppError::InvalidPayload(_)
        ));

        let field = ProfileDecodeError::Field(ValidationError::new(
            "sector",
            ValidationReason::NotFinite,
        ));
        assert!(matches!(AppError::from(field), AppError::Validation(_)));
    }

    #[test]
    fn test_rate_limit_rejection_is_structured() {
        let err = AppError::from(GovernorError::TooManyRequests {
            wait_time: 3,
            headers: None,
        });
        assert_eq!(err.body().code, "rate_limited");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "3"
        );
    }
}
