use crate::admission::AdmissionError;
use crate::auth::TokenError;
use crate::rate_limit::RateScope;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<RateScope>,
}

/// Request failures that are not admission outcomes
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    RateLimited {
        scope: RateScope,
        retry_after_seconds: u64,
    },
    /// The game aggregate stayed contended past the retry budget
    Contended,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited {
                scope,
                retry_after_seconds,
            } => {
                let body = Json(ErrorResponse {
                    error: "rate_limited".to_string(),
                    scope: Some(scope),
                });
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
                resp
            }
            ApiError::Contended => {
                let body = Json(ErrorResponse {
                    error: "contention, retry".to_string(),
                    scope: None,
                });
                let mut resp = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
                resp
            }
            other => {
                let (status, error_message) = match other {
                    ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
                    ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
                    ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
                    ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
                    ApiError::Internal => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal error".to_string(),
                    ),
                    ApiError::RateLimited { .. } | ApiError::Contended => unreachable!(),
                };
                let body = Json(ErrorResponse {
                    error: error_message,
                    scope: None,
                });
                (status, body).into_response()
            }
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Contention { .. } => ApiError::Contended,
            AdmissionError::Invalid(v) => ApiError::BadRequest(v.to_string()),
            AdmissionError::Store(e) => {
                error!(error = %e, "Admission store failure");
                ApiError::Internal
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let resp = ApiError::RateLimited {
            scope: RateScope::Identity,
            retry_after_seconds: 7,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn test_contention_maps_to_503() {
        let resp = ApiError::from(AdmissionError::Contention { attempts: 3 }).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn test_store_failure_maps_to_500() {
        let resp = ApiError::from(AdmissionError::Store(anyhow::anyhow!("disk gone"))).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
