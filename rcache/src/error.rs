use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RcacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("request timed out waiting for batched lookup")]
    Timeout,

    #[error("not found")]
    NotFound,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for RcacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            RcacheError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RcacheError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RcacheError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RcacheError::NotFound => StatusCode::NOT_FOUND,
        };
        let body = Json(ErrorBody { error: self.to_string() });
        (status, body).into_response()
    }
}
