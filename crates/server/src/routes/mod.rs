use std::path::PathBuf;

use axum::{
    Router,
    http::{HeaderMap, header},
    routing::get,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::AppState;

pub mod health;
pub mod images;
pub mod projects;
pub mod runs;
pub mod storage;

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Builds the application router. API endpoints live under `/api`; stored
/// objects are served read-only under `/files`.
pub fn router(state: AppState, objects_root: PathBuf) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(projects::router(&state))
        .merge(images::router(&state))
        .merge(runs::router())
        .merge(storage::router());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_routes)
        .nest_service("/files", ServeDir::new(objects_root))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use db::{DBService, models::project::Project};
    use serde_json::{Value, json};
    use services::services::{
        config::TransformConfig,
        eligibility::AllowAll,
        inference::{FetchedImage, GeneratedImage, InferenceClient, InferenceError},
        storage::{FsObjectStore, ObjectStore},
        transform::{SubmittedRun, TransformService},
    };
    use tempfile::TempDir;
    use tower::ServiceExt;
    use utils_jwt::TokenService;
    use uuid::Uuid;

    use super::*;
    use crate::routes::storage::UploadSlot;

    /// Inference stub that always succeeds and always produces the same PNG.
    struct CannedInference;

    #[async_trait]
    impl InferenceClient for CannedInference {
        async fn enhance(
            &self,
            _image_url: &str,
            _prompt: &str,
        ) -> Result<GeneratedImage, InferenceError> {
            Ok(GeneratedImage {
                url: "http://model.test/out.png".to_string(),
                content_type: "image/png".to_string(),
            })
        }

        async fn edit(
            &self,
            _image_url: &str,
            _mask_url: Option<&str>,
            _prompt: &str,
        ) -> Result<GeneratedImage, InferenceError> {
            Ok(GeneratedImage {
                url: "http://model.test/out.png".to_string(),
                content_type: "image/png".to_string(),
            })
        }

        async fn fetch(&self, _url: &str) -> Result<FetchedImage, InferenceError> {
            Ok(FetchedImage {
                bytes: png_bytes(),
                content_type: "image/png".to_string(),
            })
        }
    }

    /// Like [`CannedInference`], but holds the model call until the test
    /// opens the gate.
    struct GatedInference {
        go: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl InferenceClient for GatedInference {
        async fn enhance(
            &self,
            _image_url: &str,
            _prompt: &str,
        ) -> Result<GeneratedImage, InferenceError> {
            let permit = self
                .go
                .acquire()
                .await
                .map_err(|_| InferenceError::EmptyResult)?;
            permit.forget();
            Ok(GeneratedImage {
                url: "http://model.test/out.png".to_string(),
                content_type: "image/png".to_string(),
            })
        }

        async fn edit(
            &self,
            _image_url: &str,
            _mask_url: Option<&str>,
            _prompt: &str,
        ) -> Result<GeneratedImage, InferenceError> {
            let permit = self
                .go
                .acquire()
                .await
                .map_err(|_| InferenceError::EmptyResult)?;
            permit.forget();
            Ok(GeneratedImage {
                url: "http://model.test/out.png".to_string(),
                content_type: "image/png".to_string(),
            })
        }

        async fn fetch(&self, _url: &str) -> Result<FetchedImage, InferenceError> {
            Ok(FetchedImage {
                bytes: png_bytes(),
                content_type: "image/png".to_string(),
            })
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            4,
            4,
            image::Rgba([10, 20, 30, 255]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    struct TestApp {
        router: Router,
        state: AppState,
        _objects: TempDir,
    }

    async fn test_app() -> TestApp {
        test_app_with(Arc::new(CannedInference)).await
    }

    async fn test_app_with(inference: Arc<dyn InferenceClient>) -> TestApp {
        let db = DBService::from_url("sqlite::memory:")
            .await
            .expect("connect test db");
        let objects = TempDir::new().expect("create temp dir");
        let store: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(objects.path().to_path_buf(), None));
        let tokens = Arc::new(TokenService::new(b"test-secret", 3600));
        let transform = TransformService::new(
            db.clone(),
            store.clone(),
            inference,
            Arc::new(AllowAll),
            tokens.clone(),
            TransformConfig {
                retry_base_delay_secs: 0,
                retry_max_delay_secs: 0,
                ..TransformConfig::default()
            },
        );

        let state = AppState {
            db,
            store,
            tokens,
            transform,
        };
        let router = router(state.clone(), objects.path().to_path_buf());
        TestApp {
            router,
            state,
            _objects: objects,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.expect("request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("build request")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request")
    }

    async fn create_project(app: &TestApp, name: &str) -> Project {
        let (status, body) = send(
            app,
            post_json(
                "/api/projects",
                json!({ "workspace_id": Uuid::new_v4(), "name": name }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body["data"].clone()).expect("project payload")
    }

    /// Stages a source PNG in the object store and registers an image
    /// pointing at it, returning the new image id.
    async fn register_source_image(app: &TestApp, project: &Project) -> String {
        let path = format!(
            "{}/{}/original/{}.png",
            project.workspace_id,
            project.id,
            Uuid::new_v4()
        );
        app.state
            .store
            .put(&path, &png_bytes())
            .await
            .expect("stage source");

        let (status, body) = send(
            app,
            post_json(
                &format!("/api/projects/{}/images", project.id),
                json!({
                    "user_id": Uuid::new_v4(),
                    "original_image_url": format!("/files/{path}"),
                    "prompt": "golden hour"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["id"].as_str().expect("image id").to_string()
    }

    async fn poll_run_until_terminal(app: &TestApp, run_id: &str, token: &str) -> Value {
        for _ in 0..300 {
            let request = Request::builder()
                .uri(format!("/api/runs/{run_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .expect("build request");
            let (status, body) = send(app, request).await;
            assert_eq!(status, StatusCode::OK);

            // The row turns terminal a beat before the final status report,
            // so wait for the status document to settle as well.
            let details = body["data"].clone();
            let step = &details["status"]["step"];
            if step == "completed" || step == "failed" {
                return details;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not reach a terminal status");
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, "bearer lower".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("lower"));

        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let app = test_app().await;
        let (status, body) = send(&app, get_req("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn project_and_image_registration_flow() {
        let app = test_app().await;
        let project = create_project(&app, "Loft shoot").await;
        assert_eq!(project.image_count, 0);

        let image_id = register_source_image(&app, &project).await;

        let (status, body) = send(&app, get_req(&format!("/api/projects/{}", project.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["image_count"], 1);
        assert_eq!(body["data"]["completed_count"], 0);

        let (status, body) =
            send(&app, get_req(&format!("/api/projects/{}/images", project.id))).await;
        assert_eq!(status, StatusCode::OK);
        let images = body["data"].as_array().expect("image list");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0]["id"], image_id.as_str());

        let (status, body) = send(&app, get_req("/api/projects")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().expect("project list").len(), 1);
    }

    #[tokio::test]
    async fn blank_project_name_is_rejected() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/projects",
                json!({ "workspace_id": Uuid::new_v4(), "name": "   " }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn unknown_image_returns_not_found() {
        let app = test_app().await;
        let (status, _) = send(&app, get_req(&format!("/api/images/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn regenerate_flow_over_http() {
        let app = test_app().await;
        let project = create_project(&app, "Patio").await;
        let image_id = register_source_image(&app, &project).await;

        // Status without any token is rejected outright.
        let (status, _) = send(&app, get_req(&format!("/api/runs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &app,
            post_json(&format!("/api/images/{image_id}/regenerate"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let submitted: SubmittedRun =
            serde_json::from_value(body["data"].clone()).expect("submitted run");

        let details = poll_run_until_terminal(
            &app,
            &submitted.run_id.to_string(),
            &submitted.status_token,
        )
        .await;
        assert_eq!(details["run"]["status"], "completed");
        assert_eq!(details["status"]["step"], "completed");
        assert_eq!(details["status"]["progress_percent"], 100);

        let (status, body) = send(&app, get_req(&format!("/api/images/{image_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");
        assert!(
            body["data"]["result_image_url"]
                .as_str()
                .expect("result url")
                .contains("/result/")
        );

        // A token for a different run must not open this one.
        let foreign = app
            .state
            .tokens
            .issue_run_status(Uuid::new_v4())
            .expect("issue token");
        let request = Request::builder()
            .uri(format!("/api/runs/{}", submitted.run_id))
            .header(header::AUTHORIZATION, format!("Bearer {foreign}"))
            .body(Body::empty())
            .expect("build request");
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn finished_run_stream_replays_and_closes() {
        let app = test_app().await;
        let project = create_project(&app, "Stream").await;
        let image_id = register_source_image(&app, &project).await;

        let (_, body) = send(
            &app,
            post_json(&format!("/api/images/{image_id}/regenerate"), json!({})),
        )
        .await;
        let submitted: SubmittedRun =
            serde_json::from_value(body["data"].clone()).expect("submitted run");
        poll_run_until_terminal(&app, &submitted.run_id.to_string(), &submitted.status_token)
            .await;

        // EventSource clients pass the token as a query parameter.
        let request = get_req(&format!(
            "/api/runs/{}/stream?token={}",
            submitted.run_id, submitted.status_token
        ));
        let response = app.router.clone().oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read sse body");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: json_patch"));
        assert!(text.contains("event: finished"));
    }

    #[tokio::test]
    async fn open_stream_ends_when_the_run_finishes() {
        let gated = Arc::new(GatedInference {
            go: tokio::sync::Semaphore::new(0),
        });
        let app = test_app_with(gated.clone()).await;
        let project = create_project(&app, "Live").await;
        let image_id = register_source_image(&app, &project).await;

        let (_, body) = send(
            &app,
            post_json(&format!("/api/images/{image_id}/regenerate"), json!({})),
        )
        .await;
        let submitted: SubmittedRun =
            serde_json::from_value(body["data"].clone()).expect("submitted run");

        // Attach while the model call is held, so the subscription is live.
        let request = get_req(&format!(
            "/api/runs/{}/stream?token={}",
            submitted.run_id, submitted.status_token
        ));
        let response = app.router.clone().oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::OK);

        gated.go.add_permits(1);

        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("stream should end once the run finishes")
        .expect("read sse body");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"fetching\""));
        assert!(text.contains("\"completed\""));
        assert!(text.contains("event: finished"));
    }

    #[tokio::test]
    async fn add_edit_flow_over_http() {
        let app = test_app().await;
        let project = create_project(&app, "Terrace").await;
        let image_id = register_source_image(&app, &project).await;

        let (status, body) = send(
            &app,
            post_json(
                &format!("/api/images/{image_id}/edits"),
                json!({ "mode": "add", "prompt": "add fairy lights" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let submitted: SubmittedRun =
            serde_json::from_value(body["data"].clone()).expect("submitted run");

        let details = poll_run_until_terminal(
            &app,
            &submitted.run_id.to_string(),
            &submitted.status_token,
        )
        .await;
        assert_eq!(details["run"]["status"], "completed");

        let (status, body) =
            send(&app, get_req(&format!("/api/images/{image_id}/versions"))).await;
        assert_eq!(status, StatusCode::OK);
        let versions = body["data"].as_array().expect("lineage");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0]["version"], 1);
        assert_eq!(versions[1]["version"], 2);
        assert_eq!(versions[1]["parent_id"], image_id.as_str());
    }

    #[tokio::test]
    async fn remove_edit_without_mask_is_rejected() {
        let app = test_app().await;
        let project = create_project(&app, "Reject").await;
        let image_id = register_source_image(&app, &project).await;

        let (status, body) = send(
            &app,
            post_json(
                &format!("/api/images/{image_id}/edits"),
                json!({ "mode": "remove", "prompt": "remove the bin" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn upload_slot_roundtrip() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/storage/uploads",
                json!({
                    "workspace_id": Uuid::new_v4(),
                    "project_id": Uuid::new_v4(),
                    "content_type": "image/png"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let slot: UploadSlot = serde_json::from_value(body["data"].clone()).expect("upload slot");
        assert!(slot.path.ends_with(".png"));
        assert!(slot.path.contains("/original/"));

        // A token minted for a different path must not authorize this slot.
        let foreign = app
            .state
            .tokens
            .issue_upload("elsewhere/other/original/x.png")
            .expect("issue token");
        let request = Request::builder()
            .method("PUT")
            .uri(format!("{}?token={foreign}", slot.upload_url))
            .body(Body::from(png_bytes()))
            .expect("build request");
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let request = Request::builder()
            .method("PUT")
            .uri(format!("{}?token={}", slot.upload_url, slot.token))
            .body(Body::from(png_bytes()))
            .expect("build request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["path"], slot.path.as_str());

        // The stored object is immediately served back under /files.
        let response = app
            .router
            .clone()
            .oneshot(get_req(&format!("/files/{}", slot.path)))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        assert_eq!(bytes.as_ref(), png_bytes().as_slice());
    }

    #[tokio::test]
    async fn empty_upload_body_is_rejected() {
        let app = test_app().await;
        let (_, body) = send(
            &app,
            post_json(
                "/api/storage/uploads",
                json!({
                    "workspace_id": Uuid::new_v4(),
                    "project_id": Uuid::new_v4(),
                    "content_type": "image/jpeg"
                }),
            ),
        )
        .await;
        let slot: UploadSlot = serde_json::from_value(body["data"].clone()).expect("upload slot");

        let request = Request::builder()
            .method("PUT")
            .uri(format!("{}?token={}", slot.upload_url, slot.token))
            .body(Body::empty())
            .expect("build request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }
}
