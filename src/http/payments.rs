use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use tracing::Instrument;

use crate::error::CreditError;
use crate::ids::request_id;
use crate::payment::{CheckoutRequest, SIGNATURE_HEADER, WebhookReceipt};

use super::errors::{ApiError, error_response, map_credit_error};
use super::state::{AppState, extract_header};

#[derive(Debug, Serialize)]
pub(super) struct WebhookAck {
    received: bool,
}

pub(super) async fn open_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Response, ApiError> {
    let identity = state.resolve(&headers).await.map_err(map_credit_error)?;
    let response = match state.payments.open_checkout(&identity, &payload).await {
        Ok(session) => Json(session).into_response(),
        Err(err) => map_credit_error(err).into_response(),
    };
    Ok(state.attach_visitor(&identity, response).await)
}

pub(super) async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let span = tracing::info_span!("payment_webhook", request_id = %request_id());
    async move {
        let signature = extract_header(&headers, SIGNATURE_HEADER);
        match state
            .payments
            .handle_webhook(signature.as_deref(), &body)
            .await
        {
            Ok(receipt) => {
                if let WebhookReceipt::Credited { session_id, .. } = &receipt {
                    tracing::info!(session_id = %session_id, "payment credited");
                }
                Ok(Json(WebhookAck { received: true }))
            }
            Err(err @ CreditError::WebhookVerification { .. }) => {
                tracing::warn!(error = %err, "webhook rejected");
                Err(map_credit_error(err))
            }
            Err(CreditError::InvalidRequest { reason }) => {
                tracing::warn!(reason = %reason, "webhook body rejected");
                Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    reason,
                ))
            }
            Err(err) => {
                tracing::error!(error = %err, "webhook processing failed; sender will retry");
                Err(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "processing_error",
                    err.to_string(),
                ))
            }
        }
    }
    .instrument(span)
    .await
}
