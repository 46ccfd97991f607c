use axum::{
    Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse, Json as ResponseJson,
        sse::{KeepAlive, Sse},
    },
    routing::get,
};
use db::models::transform_run::TransformRun;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utils::response::ApiResponse;
use utils_jwt::TokenScope;
use uuid::Uuid;

use crate::{AppState, error::ApiError, routes::bearer_token};

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// The run row together with the folded status document: live while the run
/// is in flight, derived from the row once it is terminal.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunDetails {
    pub run: TransformRun,
    pub status: Option<Value>,
}

/// Token from the Authorization header, or from `?token=` for EventSource
/// clients that cannot set headers.
fn presented_token<'a>(headers: &'a HeaderMap, query: &'a TokenQuery) -> Option<&'a str> {
    bearer_token(headers).or(query.token.as_deref())
}

fn authorize_run(state: &AppState, run_id: Uuid, token: Option<&str>) -> Result<(), ApiError> {
    let token = token.ok_or(ApiError::Unauthorized)?;
    let subject = state.tokens.verify(token, TokenScope::RunStatus)?;
    if subject != run_id.to_string() {
        return Err(ApiError::Forbidden(
            "Token is not valid for this run".to_string(),
        ));
    }
    Ok(())
}

pub async fn get_run(
    Path(run_id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<RunDetails>>, ApiError> {
    authorize_run(&state, run_id, presented_token(&headers, &query))?;

    let run = TransformRun::find_by_id(&state.db.connection, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {run_id} not found")))?;
    let status = state.transform.status_snapshot(&run);

    Ok(ResponseJson(ApiResponse::success(RunDetails { run, status })))
}

/// Status feed. Replays the run's history, then follows new reports and
/// closes after the terminal event; an already-terminal run gets a one-shot
/// replay of its final status.
pub async fn stream_run_status(
    Path(run_id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    authorize_run(&state, run_id, presented_token(&headers, &query))?;

    let run = TransformRun::find_by_id(&state.db.connection, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {run_id} not found")))?;
    let store = state
        .transform
        .status_channel(&run)
        .ok_or_else(|| ApiError::NotFound(format!("No status for run {run_id}")))?;

    Ok(Sse::new(store.sse_stream()).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/stream", get(stream_run_status))
}
