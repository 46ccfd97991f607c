use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{post, put},
};
use serde::{Deserialize, Serialize};
use services::services::storage::{self, StorageKind, StoredObject};
use utils::response::ApiResponse;
use utils_jwt::TokenScope;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct CreateUpload {
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub content_type: String,
}

/// A pre-authorized slot the client PUTs source bytes into. The token is
/// scoped to exactly this path.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadSlot {
    pub path: String,
    pub upload_url: String,
    pub public_url: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub token: String,
}

pub async fn create_upload(
    State(state): State<AppState>,
    Json(payload): Json<CreateUpload>,
) -> Result<ResponseJson<ApiResponse<UploadSlot>>, ApiError> {
    let path = storage::object_path(
        payload.workspace_id,
        payload.project_id,
        StorageKind::Original,
        Uuid::new_v4(),
        &payload.content_type,
    );
    let token = state.tokens.issue_upload(&path)?;

    Ok(ResponseJson(ApiResponse::success(UploadSlot {
        upload_url: format!("/api/storage/uploads/{path}"),
        public_url: state.store.url_for(&path),
        path,
        token,
    })))
}

pub async fn put_upload(
    Path(path): Path<String>,
    Query(query): Query<UploadQuery>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<ResponseJson<ApiResponse<StoredObject>>, ApiError> {
    let subject = state.tokens.verify(&query.token, TokenScope::Upload)?;
    if subject != path {
        return Err(ApiError::Forbidden(
            "Token is not valid for this upload path".to_string(),
        ));
    }
    if body.is_empty() {
        return Err(ApiError::BadRequest(
            "Upload body must not be empty".to_string(),
        ));
    }

    state.store.put(&path, &body).await?;
    let url = state.store.url_for(&path);
    tracing::info!("Stored uploaded object at {path}");

    Ok(ResponseJson(ApiResponse::success(StoredObject { path, url })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/storage/uploads", post(create_upload))
        .route("/storage/uploads/{*path}", put(put_upload))
}
