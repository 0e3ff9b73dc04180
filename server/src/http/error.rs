use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use api::error::ApiError;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
}

/// http-layer error: wraps anything convertible to `anyhow::Error` so
/// handlers can use `?` freely. `ApiError` is downcast back out at the
/// response boundary to recover its code/status pairing; anything else
/// (a channel closing, an unexpected io error) falls back to 500.
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.0.downcast_ref::<ApiError>() {
            Some(err) => (
                err.code.status_code(),
                Json(ErrorBody {
                    error: ErrorDetail {
                        code: err.code.as_str(),
                        message: &err.message,
                    },
                }),
            )
                .into_response(),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: ErrorDetail {
                        code: "FILEOPS_FAILED",
                        message: &self.0.to_string(),
                    },
                }),
            )
                .into_response(),
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
