use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::auth::store::StoreError;

/// Failures surfaced by the auth service. Handlers map these to client
/// status codes via `IntoResponse`.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email already registered")]
    AccountExists,
    /// Covers both unknown email and wrong password so responses carry no
    /// account-enumeration signal.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => AuthError::AccountExists,
            StoreError::Other(e) => AuthError::Store(e),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::AccountExists => StatusCode::CONFLICT,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::Store(e) => {
                error!(error = %e, "auth store failure");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
                    .into_response();
            }
        };
        (status, self.to_string()).into_response()
    }
}
