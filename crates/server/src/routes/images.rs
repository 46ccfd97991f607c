use axum::{
    Extension, Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::{models::image_generation::ImageGeneration, types::EditMode};
use serde::Deserialize;
use services::services::transform::{EditRequest, SubmittedRun, TransformRequest};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError, middleware::load_image_middleware};

pub async fn get_image(
    Extension(image): Extension<ImageGeneration>,
) -> Result<ResponseJson<ApiResponse<ImageGeneration>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(image)))
}

/// Full lineage the image belongs to, root first, ascending by version.
pub async fn get_image_versions(
    Extension(image): Extension<ImageGeneration>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<ImageGeneration>>>, ApiError> {
    let lineage =
        ImageGeneration::find_lineage(&state.db.connection, image.root_id()).await?;
    Ok(ResponseJson(ApiResponse::success(lineage)))
}

pub async fn regenerate_image(
    Extension(image): Extension<ImageGeneration>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<SubmittedRun>>, ApiError> {
    let submitted = state
        .transform
        .submit(TransformRequest::Regenerate { image_id: image.id })
        .await?;
    Ok(ResponseJson(ApiResponse::success(submitted)))
}

#[derive(Debug, Deserialize)]
pub struct CreateEdit {
    pub mode: EditMode,
    pub prompt: String,
    #[serde(default)]
    pub mask_url: Option<String>,
    #[serde(default)]
    pub replace_newer_versions: bool,
}

pub async fn create_edit(
    Extension(image): Extension<ImageGeneration>,
    State(state): State<AppState>,
    Json(payload): Json<CreateEdit>,
) -> Result<ResponseJson<ApiResponse<SubmittedRun>>, ApiError> {
    let submitted = state
        .transform
        .submit(TransformRequest::Edit(EditRequest {
            image_id: image.id,
            mode: payload.mode,
            prompt: payload.prompt,
            mask_url: payload.mask_url,
            replace_newer_versions: payload.replace_newer_versions,
        }))
        .await?;
    Ok(ResponseJson(ApiResponse::success(submitted)))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let image_id_router = Router::new()
        .route("/", get(get_image))
        .route("/versions", get(get_image_versions))
        .route("/regenerate", post(regenerate_image))
        .route("/edits", post(create_edit))
        .layer(from_fn_with_state(state.clone(), load_image_middleware));

    Router::new().nest("/images/{id}", image_id_router)
}
