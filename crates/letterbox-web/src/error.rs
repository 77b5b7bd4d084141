use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use letterbox_adapters::ScrapeFailure;
use letterbox_services::ServiceError;
use letterbox_storage::StoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("username and password are required")]
    MissingCredentials,
    #[error("username is already taken")]
    UsernameTaken,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("token expired")]
    TokenExpired,
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error("token signing failed: {0}")]
    TokenSigning(String),
    #[error("live updates are unavailable")]
    EventsUnavailable,
    #[error("storage failure: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Service(err) => match err {
                ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
                ServiceError::InvalidMovieId(_)
                | ServiceError::InvalidRating
                | ServiceError::MissingMovieName
                | ServiceError::InvalidQuery => StatusCode::BAD_REQUEST,
                ServiceError::MovieNotFound(_)
                | ServiceError::Scrape(ScrapeFailure::NotFound) => StatusCode::NOT_FOUND,
                ServiceError::ConstraintConflict(_) => StatusCode::CONFLICT,
                ServiceError::Scrape(_) | ServiceError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::MissingCredentials => StatusCode::BAD_REQUEST,
            ApiError::UsernameTaken => StatusCode::CONFLICT,
            ApiError::InvalidCredentials | ApiError::TokenExpired => StatusCode::UNAUTHORIZED,
            ApiError::PasswordHash(_) | ApiError::TokenSigning(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::EventsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Service(err) => err.code(),
            ApiError::MissingCredentials => "MISSING_CREDENTIALS",
            ApiError::UsernameTaken => "USERNAME_TAKEN",
            ApiError::InvalidCredentials => "INVALID_CREDENTIALS",
            ApiError::TokenExpired => "TOKEN_EXPIRED",
            ApiError::PasswordHash(_) | ApiError::TokenSigning(_) => "AUTH_ERROR",
            ApiError::EventsUnavailable => "EVENTS_UNAVAILABLE",
            ApiError::Store(_) => "STORE_ERROR",
        }
    }

    /// Client-facing text. Storage details never appear here.
    fn public_message(&self) -> String {
        match self {
            ApiError::Service(ServiceError::Store(_))
            | ApiError::Store(_)
            | ApiError::PasswordHash(_)
            | ApiError::TokenSigning(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// An [`ApiError`] bound to the deployment's disclosure policy.
#[derive(Debug)]
pub struct ApiFailure {
    pub error: ApiError,
    pub expose_details: bool,
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let code = self.error.code();
        if status.is_server_error() {
            warn!(code, error = %self.error, "request failed");
        } else {
            debug!(code, error = %self.error, "request rejected");
        }

        let detail =
            (self.expose_details && status.is_server_error()).then(|| self.error.to_string());
        let body = ErrorBody {
            success: false,
            message: self.error.public_message(),
            code,
            error: detail,
        };
        (status, Json(body)).into_response()
    }
}
