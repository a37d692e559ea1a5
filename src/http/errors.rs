use axum::Json;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::CreditError;
use crate::provider::ProviderError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }),
    )
}

pub fn map_credit_error(err: CreditError) -> ApiError {
    match err {
        CreditError::Authentication { reason } => {
            error_response(StatusCode::UNAUTHORIZED, "unauthorized", reason)
        }
        CreditError::InsufficientBalance {
            required,
            available,
        } => error_response(
            StatusCode::FORBIDDEN,
            "insufficient_balance",
            format!("insufficient balance: {available} available, {required} required"),
        ),
        CreditError::UpstreamProvider(ProviderError::Timeout { timeout_ms }) => error_response(
            StatusCode::BAD_GATEWAY,
            "upstream_timeout",
            format!("compute provider did not answer within {timeout_ms}ms"),
        ),
        CreditError::UpstreamProvider(err) => {
            error_response(StatusCode::BAD_GATEWAY, "upstream_error", err.to_string())
        }
        CreditError::Connectivity { message } => {
            error_response(StatusCode::BAD_GATEWAY, "upstream_error", message)
        }
        CreditError::Timeout { elapsed_ms } => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            format!("gave up after {elapsed_ms}ms"),
        ),
        CreditError::WebhookVerification { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_signature", reason)
        }
        err @ (CreditError::TaskNotFound { .. }
        | CreditError::PaymentSessionNotFound { .. }
        | CreditError::AccountNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        CreditError::InvalidRequest { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", reason)
        }
        CreditError::Storage(err) => {
            tracing::error!(error = %err, "ledger store failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "ledger store unavailable",
            )
        }
        CreditError::Token(err) => {
            tracing::error!(error = %err, "token signing failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "token signing failed",
            )
        }
    }
}
