use axum::{
    Extension, Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::get,
};
use db::models::{
    image_generation::{CreateImageGeneration, ImageGeneration},
    project::{CreateProject, Project},
};
use serde::Deserialize;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError, middleware::load_project_middleware};

pub async fn get_projects(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<Project>>>, ApiError> {
    let projects = Project::find_all(&state.db.connection).await?;
    Ok(ResponseJson(ApiResponse::success(projects)))
}

pub async fn get_project(
    Extension(project): Extension<Project>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(project)))
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(payload): Json<CreateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Project name must not be empty".to_string(),
        ));
    }

    let project = Project::create(&state.db.connection, &payload).await?;
    tracing::info!("Created project {} '{}'", project.id, project.name);
    Ok(ResponseJson(ApiResponse::success(project)))
}

/// Registration payload for a new source photo. The project and workspace come
/// from the URL, not the body.
#[derive(Debug, Deserialize)]
pub struct RegisterImage {
    pub user_id: Uuid,
    pub original_image_url: String,
    pub prompt: String,
}

pub async fn register_image(
    Extension(project): Extension<Project>,
    State(state): State<AppState>,
    Json(payload): Json<RegisterImage>,
) -> Result<ResponseJson<ApiResponse<ImageGeneration>>, ApiError> {
    if payload.original_image_url.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "original_image_url must not be empty".to_string(),
        ));
    }

    let generation = ImageGeneration::create(
        &state.db.connection,
        &CreateImageGeneration {
            project_id: project.id,
            workspace_id: project.workspace_id,
            user_id: payload.user_id,
            original_image_url: payload.original_image_url,
            prompt: payload.prompt,
        },
    )
    .await?;
    Project::recount(&state.db.connection, project.id).await?;

    Ok(ResponseJson(ApiResponse::success(generation)))
}

pub async fn get_project_images(
    Extension(project): Extension<Project>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<ImageGeneration>>>, ApiError> {
    let images =
        ImageGeneration::find_roots_for_project(&state.db.connection, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(images)))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let project_id_router = Router::new()
        .route("/", get(get_project))
        .route("/images", get(get_project_images).post(register_image))
        .layer(from_fn_with_state(
            state.clone(),
            load_project_middleware,
        ));

    let projects_router = Router::new()
        .route("/", get(get_projects).post(create_project))
        .nest("/{id}", project_id_router);

    Router::new().nest("/projects", projects_router)
}
