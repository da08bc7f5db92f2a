//! HTTP error envelope.

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use knowledge_hub_core::Error;

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An [`Error`] bound to the request it failed, ready to render.
///
/// Only the coarse category and a safe message reach the client; provider
/// and internal detail stays in the logs.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(error: Error, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        let mut retry_after_secs = None;

        let (status, message, details) = match &error {
            Error::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing API key".to_string(),
                None,
            ),
            Error::Forbidden(_) => (
                StatusCode::FORBIDDEN,
                "Insufficient permissions for this operation".to_string(),
                None,
            ),
            Error::ValidationFailed { reason, detail } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Request validation failed".to_string(),
                Some(json!({ "reason": reason, "detail": detail })),
            ),
            Error::RateLimited {
                requests_remaining,
                retry_after_secs: retry,
            } => {
                retry_after_secs = Some(*retry);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "Rate limit exceeded".to_string(),
                    Some(json!({
                        "requests_remaining": requests_remaining,
                        "retry_after_secs": retry,
                    })),
                )
            }
            Error::BudgetExceeded { used, limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Daily token budget exceeded".to_string(),
                Some(json!({
                    "tokens_used_today": used,
                    "daily_limit": limit,
                    "tokens_remaining": limit.saturating_sub(*used),
                })),
            ),
            Error::ModelProvider(_) | Error::AllProvidersFailed { .. } | Error::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "All model providers are currently unavailable".to_string(),
                None,
            ),
            Error::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "The request timed out".to_string(),
                None,
            ),
            Error::NotFound(what) => (StatusCode::NOT_FOUND, format!("Not found: {}", what), None),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error occurred".to_string(),
                None,
            ),
        };

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, error = %error, "Request failed");
        }

        Self {
            status,
            body: ErrorBody {
                error: error.category(),
                message,
                request_id,
                details,
            },
            retry_after_secs,
        }
    }

    /// Body that could not be parsed into the expected shape.
    pub fn malformed_body(rejection: JsonRejection, request_id: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: ErrorBody {
                error: "validation_error",
                message: "Request validation failed".to_string(),
                request_id: request_id.into(),
                details: Some(json!({ "detail": rejection.body_text() })),
            },
            retry_after_secs: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
