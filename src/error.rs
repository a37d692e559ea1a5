use thiserror::Error;

use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("authentication required: {reason}")]
    Authentication { reason: String },
    #[error("insufficient balance: required={required} available={available}")]
    InsufficientBalance { required: i64, available: i64 },
    #[error("upstream provider error: {0}")]
    UpstreamProvider(#[from] ProviderError),
    #[error("webhook verification failed: {reason}")]
    WebhookVerification { reason: String },
    #[error("connectivity error: {message}")]
    Connectivity { message: String },
    #[error("polling timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },
    #[error("payment session not found: {session_id}")]
    PaymentSessionNotFound { session_id: String },
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
}

impl CreditError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CreditError>;
