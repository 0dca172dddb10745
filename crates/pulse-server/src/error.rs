//! HTTP error responses.
//!
//! Errors are returned as plain text bodies with the matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pulse_core::HubError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

impl From<HubError> for HttpError {
    fn from(err: HubError) -> Self {
        let message = err.to_string();
        match err {
            HubError::InvalidMessage | HubError::InvalidChannel(_) => HttpError::BadRequest(message),
            HubError::UnknownConnection(_) | HubError::UnknownRoute(_) => HttpError::NotFound(message),
            HubError::RegistryFull { .. } | HubError::ShuttingDown => {
                HttpError::ServiceUnavailable(message)
            }
        }
    }
}
