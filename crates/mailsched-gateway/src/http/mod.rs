pub mod events;
pub mod health;

use axum::{http::StatusCode, Json};
use serde::Serialize;

/// Error body shared by every endpoint: `{"message": "..."}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            message: message.into(),
            code: None,
        }),
    )
}
