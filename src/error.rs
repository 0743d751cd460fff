//! Request-scoped errors and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::users::rules::ValidationErrors;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Input rejected by the rule set, keyed by field.
    #[error("the given data was invalid")]
    Validation(#[from] ValidationErrors),

    #[error("{0}")]
    Unauthorized(String),

    /// A computed attribute was read while its source attribute is unset.
    #[error("attribute `{0}` is not set")]
    Precondition(&'static str),

    #[error("resource not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Precondition(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Validation(errors) => json!({
                "message": self.to_string(),
                "errors": errors,
            }),
            AppError::Precondition(_) | AppError::Internal(_) => {
                error!(error = %self, "request failed");
                json!({ "message": "Internal server error" })
            }
            _ => json!({ "message": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        let mut errors = ValidationErrors::default();
        errors.add("email", "The email has already been taken.");
        assert_eq!(
            AppError::Validation(errors).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::Unauthorized("no".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Precondition("firstname").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unauthorized_message_is_exposed() {
        let err = AppError::Unauthorized("Only admin can access this action.".into());
        assert_eq!(err.to_string(), "Only admin can access this action.");
    }
}
