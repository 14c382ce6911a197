use axum::{http::StatusCode, response::{IntoResponse, Response}};
use tracing::error;

use crate::ChatError;

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::Unauthorized { .. } | ChatError::Impersonation { .. }) => StatusCode::FORBIDDEN,
            Some(ChatError::RoomNotFound(_)) => StatusCode::NOT_FOUND,
            Some(
                ChatError::InvalidSlot { .. }
                | ChatError::DateOutOfHorizon { .. }
                | ChatError::RoomMismatch { .. }
                | ChatError::SelfDealing,
            ) => StatusCode::BAD_REQUEST,
            Some(ChatError::NotEntered(_)) => StatusCode::CONFLICT,
            Some(ChatError::History(_) | ChatError::Directory(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{:?}", self.0);
            return (status, "something went wrong").into_response();
        }
        (status, self.0.to_string()).into_response()
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
