//! HTTP error mapping. Handlers return `Result<T, AppError>`; this is the
//! single place that turns an internal failure into a status code plus a
//! `{error_code, error_message}` body (§7 propagation policy: user-visible
//! errors always carry a code and a human message).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api_types::ErrorResponse;

pub enum AppError {
    NotFound(String),
    InvalidTransition(String),
    Forbidden(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "E-1001", msg),
            AppError::InvalidTransition(msg) => (StatusCode::BAD_REQUEST, "E-2015", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "E-4002", msg),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "E-4001", err.to_string())
            }
        };
        (
            status,
            Json(ErrorResponse {
                error_code: code.to_string(),
                error_message: message,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<shipctl_orchestrator::job_state_machine::InvalidJobTransition>().is_some() {
            return AppError::InvalidTransition(err.to_string());
        }
        if err.downcast_ref::<shipctl_orchestrator::shipper::NoShipperResolved>().is_some() {
            return AppError::InvalidTransition(err.to_string());
        }
        AppError::Internal(err)
    }
}
