use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use statuscast_core::error::StoreError;
use statuscast_core::SubscriptionError;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    TokenExpired(String),
    #[error("{0}")]
    AlreadyUnsubscribed(String),
    #[error("Too many requests")]
    RateLimited,
    #[error("Unexpected error")]
    Internal,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::TokenExpired(_) => (StatusCode::GONE, "token_expired"),
            ApiError::AlreadyUnsubscribed(_) => (StatusCode::CONFLICT, "already_unsubscribed"),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.status_and_code();
        (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code,
                    message: self.to_string(),
                },
            }),
        )
            .into_response()
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::InvalidEmail
            | SubscriptionError::InvalidScope { .. }
            | SubscriptionError::InvalidChannelConfig(_) => ApiError::BadRequest(err.to_string()),
            SubscriptionError::PageNotFound | SubscriptionError::NotFound => {
                ApiError::NotFound(err.to_string())
            }
            SubscriptionError::TokenExpired => ApiError::TokenExpired(err.to_string()),
            SubscriptionError::AlreadyUnsubscribed => {
                ApiError::AlreadyUnsubscribed(err.to_string())
            }
            SubscriptionError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store error");
        ApiError::Internal
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
