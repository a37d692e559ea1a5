use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::store::{BalanceKind, UsageRecord};

use super::errors::{ApiError, map_credit_error};
use super::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    balance: i64,
    kind: BalanceKind,
    authenticated: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct UsageQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    records: Vec<UsageRecord>,
}

pub(super) async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = state.resolve(&headers).await.map_err(map_credit_error)?;
    let response = match identity.ledger.balance_of(&identity.account_id).await {
        Ok(balance) => Json(BalanceResponse {
            balance,
            kind: identity.kind,
            authenticated: identity.authenticated,
        })
        .into_response(),
        Err(err) => map_credit_error(err).into_response(),
    };
    Ok(state.attach_visitor(&identity, response).await)
}

pub(super) async fn claim_daily_bonus(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = state.resolve(&headers).await.map_err(map_credit_error)?;
    let response = match state.bonus.claim(&identity).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => map_credit_error(err).into_response(),
    };
    Ok(state.attach_visitor(&identity, response).await)
}

pub(super) async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Response, ApiError> {
    let identity = state.resolve(&headers).await.map_err(map_credit_error)?;
    let limit = query
        .limit
        .unwrap_or(state.usage_limit)
        .clamp(1, state.usage_limit);
    let response = match state.store.list_usage(&identity.account_id, limit).await {
        Ok(records) => Json(UsageResponse { records }).into_response(),
        Err(err) => map_credit_error(err.into()).into_response(),
    };
    Ok(state.attach_visitor(&identity, response).await)
}
