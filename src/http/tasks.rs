use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use crate::error::CreditError;
use crate::ids::request_id;
use crate::submission::{TaskRequest, TaskView};

use super::errors::{ApiError, map_credit_error};
use super::state::AppState;

pub(super) async fn submit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TaskRequest>,
) -> Result<Response, ApiError> {
    let span = tracing::info_span!(
        "submit_task",
        request_id = %request_id(),
        action_type = %payload.action_type,
        account_id = tracing::field::Empty,
    );
    async move {
        let identity = state.resolve(&headers).await.map_err(map_credit_error)?;
        tracing::Span::current().record("account_id", tracing::field::display(&identity.account_id));

        let result = if !identity.authenticated && !state.allow_anonymous_tasks {
            Err(CreditError::unauthenticated("sign in to submit tasks"))
        } else {
            state.submissions.submit(&identity, &payload).await
        };
        let response = match result {
            Ok(task) => Json(task).into_response(),
            Err(err) => map_credit_error(err).into_response(),
        };
        Ok(state.attach_visitor(&identity, response).await)
    }
    .instrument(span)
    .await
}

pub(super) async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let view = state
        .submissions
        .refresh_status(task_id.trim())
        .await
        .map_err(map_credit_error)?;
    Ok(Json(view))
}
