use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::DbErr;
use services::services::{
    config::ConfigError, storage::StorageError, transform::TransformError,
};
use thiserror::Error;
use utils::response::ApiResponse;
use utils_jwt::TokenError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired | TokenError::Invalid(_) => ApiError::Unauthorized,
            TokenError::WrongScope => {
                ApiError::Forbidden("Token is not valid for this resource".to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidPath(path) => {
                ApiError::BadRequest(format!("Invalid object path: {path}"))
            }
            StorageError::NotFound(path) => {
                ApiError::NotFound(format!("Object not found: {path}"))
            }
            StorageError::Io(io) => ApiError::Io(io),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Transform(err) => match err {
                TransformError::Validation(_) => (StatusCode::BAD_REQUEST, "TransformError"),
                TransformError::ImageNotFound(_) => (StatusCode::NOT_FOUND, "TransformError"),
                TransformError::Denied(_) => (StatusCode::FORBIDDEN, "TransformError"),
                TransformError::Conflict => (StatusCode::CONFLICT, "TransformError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "TransformError"),
            },
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IoError"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "AuthError"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "AuthError"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFoundError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequestError"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::Transform(err) => err.to_string(),
            ApiError::Unauthorized => {
                "Unauthorized. Provide the token issued with the run.".to_string()
            }
            ApiError::Forbidden(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Internal(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };

        if status_code.is_server_error() {
            tracing::error!(
                status = %status_code,
                error_type,
                error = %self,
                "API request failed"
            );
        }
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
