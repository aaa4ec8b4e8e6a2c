use axum::{http::StatusCode, response::{IntoResponse, Response}};
use tracing::error;

use crate::relay::RelayError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(RelayError::Validation(reason)) = self.0.downcast_ref::<RelayError>() {
            return (StatusCode::BAD_REQUEST, reason.to_string()).into_response();
        }

        error!(error = %self.0, backtrace = %self.0.backtrace(), "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            self.0.to_string(),
        )
            .into_response()
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
