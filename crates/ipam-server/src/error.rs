//! Server errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ipam::AllocatorError;
use ipam::address::AddressError;
use ipam::db::DbError;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("Persistence error: {0}")]
    Db(#[from] DbError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<AddressError> for ServerError {
    fn from(err: AddressError) -> Self {
        ServerError::BadRequest(err.to_string())
    }
}

impl ServerError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Allocator(err) => match err {
                AllocatorError::OutOfUniverse(_) | AllocatorError::Address(_) | AllocatorError::Decode(_) => {
                    StatusCode::BAD_REQUEST
                }
                AllocatorError::NotFound(_) => StatusCode::NOT_FOUND,
                AllocatorError::AddressInUse { .. }
                | AllocatorError::AddressOwnedByPeer { .. }
                | AllocatorError::RingProtocol(_)
                | AllocatorError::Space(_) => StatusCode::CONFLICT,
                AllocatorError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
                AllocatorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                AllocatorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, format!("{self}\n")).into_response()
    }
}
