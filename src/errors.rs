// =============================================================================
// Error taxonomy — §7 of the portfolio accounting design
// =============================================================================
//
// `AppError` is the typed error surfaced at the HTTP boundary. Transport and
// parse failures from the quote client are retried internally (see
// `quote_client`) and only reach here as `NavUnavailable` once retries are
// exhausted. Ambient/bootstrap failures (config load, process setup) stay on
// `anyhow::Result` rather than going through this enum.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no such portfolio")]
    NoPosition,

    #[error("no such scheme")]
    NoScheme,

    #[error("insufficient units: requested {requested}, available {available}")]
    InsufficientUnits {
        requested: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("portfolio has transactions and cannot be removed")]
    HasTransactions,

    #[error("portfolio already exists")]
    DuplicatePortfolio,

    #[error("NAV unavailable for scheme {0}")]
    NavUnavailable(crate::types::SchemeCode),

    #[error("missing or invalid authorization token")]
    Unauthorized,

    #[error("insufficient role for this operation")]
    Forbidden,

    #[error("transport error contacting provider: {0}")]
    Transport(String),

    #[error("failed to parse provider response: {0}")]
    Parse(String),

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NoPosition | AppError::NoScheme => StatusCode::NOT_FOUND,
            AppError::DuplicatePortfolio => StatusCode::CONFLICT,
            AppError::InsufficientUnits { .. }
            | AppError::NavUnavailable(_)
            | AppError::HasTransactions => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Transport(_) | AppError::Parse(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        tracing::warn!(error = %self, status = %status, "request failed");

        let body = ErrorBody {
            success: false,
            message: self.to_string(),
            errors: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
