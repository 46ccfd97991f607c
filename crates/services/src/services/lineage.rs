use chrono::Utc;
use db::{
    DbConn, DbErr,
    models::image_generation::{ImageGeneration, ImageGenerationError, NewVersion},
    types::EditMode,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Bounded number of version recomputations when concurrent edits of the
/// same base collide on the unique `(parent_id, version)` index.
const MAX_VERSION_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LineageError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("Lineage {root} is too contended, gave up after {attempts} attempts")]
    Contention { root: Uuid, attempts: u32 },
}

#[derive(Debug)]
pub struct RecordedEdit {
    pub generation: ImageGeneration,
    /// How many newer versions were deleted before the insert.
    pub pruned: u64,
    /// Result objects the deleted versions pointed at. The rows are gone;
    /// removing the objects is the caller's job.
    pub pruned_result_urls: Vec<String>,
}

/// Appends the produced artifact as the next version of `base`'s lineage.
///
/// The new record takes `base.version + 1` and points at the lineage root.
/// With `replace_newer_versions`, every version above the base is deleted
/// first so a "redo from here" edit leaves no orphaned suffix. The base
/// record itself is never touched.
///
/// A losing writer in a concurrent-edit race recomputes the version from the
/// lineage maximum and retries a bounded number of times.
pub async fn record_edit(
    db: &DbConn,
    base: &ImageGeneration,
    new_image_id: Uuid,
    result_url: &str,
    prompt: &str,
    mode: EditMode,
    replace_newer_versions: bool,
) -> Result<RecordedEdit, LineageError> {
    let root = base.root_id();

    let (pruned, pruned_result_urls) = if replace_newer_versions {
        let doomed: Vec<String> = ImageGeneration::find_lineage(db, root)
            .await?
            .into_iter()
            .filter(|g| g.version > base.version)
            .filter_map(|g| g.result_image_url)
            .collect();
        let pruned = ImageGeneration::prune_newer(db, root, base.version).await?;
        if pruned > 0 {
            tracing::info!(
                "Pruned {pruned} newer version(s) of lineage {root} before recording edit"
            );
        }
        (pruned, doomed)
    } else {
        (0, Vec::new())
    };

    let metadata = json!({
        "edited_from": base.id,
        "edit_mode": mode,
        "recorded_at": Utc::now(),
    });

    let mut version = base.version + 1;
    for attempt in 1..=MAX_VERSION_RETRIES {
        let new = NewVersion {
            id: new_image_id,
            parent_id: root,
            version,
            result_image_url: result_url.to_string(),
            prompt: prompt.to_string(),
            metadata: Some(metadata.clone()),
        };

        match ImageGeneration::insert_version(db, base, &new).await {
            Ok(generation) => {
                return Ok(RecordedEdit {
                    generation,
                    pruned,
                    pruned_result_urls,
                });
            }
            Err(ImageGenerationError::VersionTaken { .. }) => {
                let latest = ImageGeneration::max_version(db, root)
                    .await?
                    .unwrap_or(base.version);
                tracing::warn!(
                    "Version {version} of lineage {root} was taken concurrently, \
                     retrying with {} (attempt {attempt})",
                    latest + 1
                );
                version = latest + 1;
            }
            Err(ImageGenerationError::Database(err)) => return Err(err.into()),
        }
    }

    Err(LineageError::Contention {
        root,
        attempts: MAX_VERSION_RETRIES,
    })
}

#[cfg(test)]
mod tests {
    use db::{
        models::{
            image_generation::{CreateImageGeneration, ImageGeneration, NewVersion},
            project::{CreateProject, Project},
        },
        types::GenerationStatus,
    };
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;

    use super::*;

    async fn test_db() -> DbConn {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect test db");
        db_migration::Migrator::up(&db, None)
            .await
            .expect("run migrations");
        db
    }

    async fn seed_root(db: &DbConn) -> ImageGeneration {
        let project = Project::create(
            db,
            &CreateProject {
                workspace_id: Uuid::new_v4(),
                name: "Kitchen remodel".to_string(),
            },
        )
        .await
        .expect("create project");

        let root = ImageGeneration::create(
            db,
            &CreateImageGeneration {
                project_id: project.id,
                workspace_id: project.workspace_id,
                user_id: Uuid::new_v4(),
                original_image_url: "/files/ws/proj/original/root.jpg".to_string(),
                prompt: "warm lighting".to_string(),
            },
        )
        .await
        .expect("create root");

        ImageGeneration::mark_completed(db, root.id, "/files/ws/proj/result/root.jpg", None)
            .await
            .expect("complete root")
    }

    async fn append_version(db: &DbConn, base: &ImageGeneration, version: i32) -> ImageGeneration {
        ImageGeneration::insert_version(
            db,
            base,
            &NewVersion {
                id: Uuid::new_v4(),
                parent_id: base.root_id(),
                version,
                result_image_url: format!("/files/ws/proj/result/v{version}.jpg"),
                prompt: format!("edit {version}"),
                metadata: None,
            },
        )
        .await
        .expect("append version")
    }

    #[tokio::test]
    async fn edit_appends_next_version_pointing_at_root() {
        let db = test_db().await;
        let root = seed_root(&db).await;

        let recorded = record_edit(
            &db,
            &root,
            Uuid::new_v4(),
            "/files/ws/proj/result/new.jpg",
            "remove the ladder",
            EditMode::Remove,
            false,
        )
        .await
        .expect("record edit");

        assert_eq!(recorded.pruned, 0);
        assert!(recorded.pruned_result_urls.is_empty());
        assert_eq!(recorded.generation.version, 2);
        assert_eq!(recorded.generation.parent_id, Some(root.id));
        assert_eq!(recorded.generation.status, GenerationStatus::Completed);
        assert_eq!(
            recorded.generation.original_image_url,
            root.original_image_url
        );

        let metadata = recorded.generation.metadata.expect("metadata");
        assert_eq!(metadata["edited_from"], root.id.to_string());
        assert_eq!(metadata["edit_mode"], "remove");

        let unchanged = ImageGeneration::find_by_id(&db, root.id)
            .await
            .expect("find root")
            .expect("root exists");
        assert_eq!(unchanged.status, GenerationStatus::Completed);
        assert_eq!(unchanged.result_image_url, root.result_image_url);
    }

    #[tokio::test]
    async fn edit_from_chain_middle_still_points_at_root() {
        let db = test_db().await;
        let root = seed_root(&db).await;
        let v2 = append_version(&db, &root, 2).await;

        let recorded = record_edit(
            &db,
            &v2,
            Uuid::new_v4(),
            "/files/ws/proj/result/v3.jpg",
            "add a chair",
            EditMode::Add,
            false,
        )
        .await
        .expect("record edit");

        assert_eq!(recorded.generation.version, 3);
        assert_eq!(recorded.generation.parent_id, Some(root.id));
    }

    #[tokio::test]
    async fn replace_newer_versions_prunes_suffix_before_insert() {
        let db = test_db().await;
        let root = seed_root(&db).await;
        let v2 = append_version(&db, &root, 2).await;
        append_version(&db, &root, 3).await;
        append_version(&db, &root, 4).await;
        append_version(&db, &root, 5).await;

        let recorded = record_edit(
            &db,
            &v2,
            Uuid::new_v4(),
            "/files/ws/proj/result/redo.jpg",
            "redo from version two",
            EditMode::Add,
            true,
        )
        .await
        .expect("record edit");

        assert_eq!(recorded.pruned, 3);
        assert_eq!(
            recorded.pruned_result_urls,
            vec![
                "/files/ws/proj/result/v3.jpg",
                "/files/ws/proj/result/v4.jpg",
                "/files/ws/proj/result/v5.jpg",
            ]
        );
        assert_eq!(recorded.generation.version, 3);

        let lineage = ImageGeneration::find_lineage(&db, root.id)
            .await
            .expect("lineage");
        let versions: Vec<i32> = lineage.iter().map(|g| g.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn lost_race_recomputes_version_and_succeeds() {
        let db = test_db().await;
        let root = seed_root(&db).await;
        // Another edit of the same base landed first.
        append_version(&db, &root, 2).await;

        let recorded = record_edit(
            &db,
            &root,
            Uuid::new_v4(),
            "/files/ws/proj/result/late.jpg",
            "late edit",
            EditMode::Add,
            false,
        )
        .await
        .expect("record edit");

        assert_eq!(recorded.generation.version, 3);
        assert_eq!(recorded.generation.parent_id, Some(root.id));
    }
}
