use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::image_generation,
    models::ids,
    types::GenerationStatus,
};

#[derive(Debug, Error)]
pub enum ImageGenerationError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("version {version} already exists in lineage {root}")]
    VersionTaken { root: Uuid, version: i32 },
}

/// One rendered artifact. `parent_id` always points at the lineage root
/// (NULL for the root itself), never at the immediate predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGeneration {
    pub id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub original_image_url: String,
    pub result_image_url: Option<String>,
    pub prompt: String,
    pub status: GenerationStatus,
    pub version: i32,
    pub parent_id: Option<Uuid>,
    pub metadata: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateImageGeneration {
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub original_image_url: String,
    pub prompt: String,
}

/// Payload for appending one completed version to a lineage. Ownership and
/// `original_image_url` are copied from the base record, not supplied here.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub version: i32,
    pub result_image_url: String,
    pub prompt: String,
    pub metadata: Option<JsonValue>,
}

impl ImageGeneration {
    pub fn root_id(&self) -> Uuid {
        self.parent_id.unwrap_or(self.id)
    }

    async fn from_model<C: ConnectionTrait>(
        db: &C,
        model: image_generation::Model,
    ) -> Result<Self, DbErr> {
        let project_id = ids::project_uuid_by_id(db, model.project_id)
            .await?
            .ok_or(DbErr::RecordNotFound("Project not found".to_string()))?;

        Ok(Self {
            id: model.uuid,
            project_id,
            workspace_id: model.workspace_id,
            user_id: model.user_id,
            original_image_url: model.original_image_url,
            result_image_url: model.result_image_url,
            prompt: model.prompt,
            status: model.status,
            version: model.version,
            parent_id: model.parent_id,
            metadata: model.metadata,
            error_message: model.error_message,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        })
    }

    /// Creates the lineage root: version 1, no parent, pending.
    pub async fn create<C: ConnectionTrait>(
        db: &C,
        data: &CreateImageGeneration,
    ) -> Result<Self, DbErr> {
        let project_row_id = ids::project_id_by_uuid(db, data.project_id)
            .await?
            .ok_or(DbErr::RecordNotFound("Project not found".to_string()))?;

        let now = Utc::now();
        let active = image_generation::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            project_id: Set(project_row_id),
            workspace_id: Set(data.workspace_id),
            user_id: Set(data.user_id),
            original_image_url: Set(data.original_image_url.clone()),
            result_image_url: Set(None),
            prompt: Set(data.prompt.clone()),
            status: Set(GenerationStatus::Pending),
            version: Set(1),
            parent_id: Set(None),
            metadata: Set(None),
            error_message: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        };

        let model = active.insert(db).await?;
        Self::from_model(db, model).await
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
    ) -> Result<Option<Self>, DbErr> {
        let record = image_generation::Entity::find()
            .filter(image_generation::Column::Uuid.eq(id))
            .one(db)
            .await?;
        match record {
            Some(model) => Ok(Some(Self::from_model(db, model).await?)),
            None => Ok(None),
        }
    }

    /// All records of one lineage (the root plus its descendants), ordered
    /// by ascending version.
    pub async fn find_lineage<C: ConnectionTrait>(
        db: &C,
        root: Uuid,
    ) -> Result<Vec<Self>, DbErr> {
        let records = image_generation::Entity::find()
            .filter(
                Condition::any()
                    .add(image_generation::Column::Uuid.eq(root))
                    .add(image_generation::Column::ParentId.eq(root)),
            )
            .order_by_asc(image_generation::Column::Version)
            .all(db)
            .await?;

        let mut generations = Vec::with_capacity(records.len());
        for model in records {
            generations.push(Self::from_model(db, model).await?);
        }
        Ok(generations)
    }

    /// Lineage roots registered under a project, newest first.
    pub async fn find_roots_for_project<C: ConnectionTrait>(
        db: &C,
        project_id: Uuid,
    ) -> Result<Vec<Self>, DbErr> {
        let project_row_id = ids::project_id_by_uuid(db, project_id)
            .await?
            .ok_or(DbErr::RecordNotFound("Project not found".to_string()))?;

        let records = image_generation::Entity::find()
            .filter(image_generation::Column::ProjectId.eq(project_row_id))
            .filter(image_generation::Column::ParentId.is_null())
            .order_by_desc(image_generation::Column::CreatedAt)
            .all(db)
            .await?;

        let mut generations = Vec::with_capacity(records.len());
        for model in records {
            generations.push(Self::from_model(db, model).await?);
        }
        Ok(generations)
    }

    pub async fn max_version<C: ConnectionTrait>(
        db: &C,
        root: Uuid,
    ) -> Result<Option<i32>, DbErr> {
        image_generation::Entity::find()
            .select_only()
            .column(image_generation::Column::Version)
            .filter(
                Condition::any()
                    .add(image_generation::Column::Uuid.eq(root))
                    .add(image_generation::Column::ParentId.eq(root)),
            )
            .order_by_desc(image_generation::Column::Version)
            .into_tuple()
            .one(db)
            .await
    }

    /// Deletes every record in the lineage with `version > above`. The root
    /// itself can never match (its version is 1 and its parent is NULL), so
    /// pruning removes a suffix of descendants only.
    pub async fn prune_newer<C: ConnectionTrait>(
        db: &C,
        root: Uuid,
        above: i32,
    ) -> Result<u64, DbErr> {
        let result = image_generation::Entity::delete_many()
            .filter(image_generation::Column::ParentId.eq(root))
            .filter(image_generation::Column::Version.gt(above))
            .exec(db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Appends a completed version record, copying ownership and the
    /// original-image pointer from `base`. A unique-index collision on
    /// `(parent_id, version)` surfaces as `VersionTaken` so the caller can
    /// recompute and retry.
    pub async fn insert_version<C: ConnectionTrait>(
        db: &C,
        base: &Self,
        new: &NewVersion,
    ) -> Result<Self, ImageGenerationError> {
        let project_row_id = ids::project_id_by_uuid(db, base.project_id)
            .await?
            .ok_or(DbErr::RecordNotFound("Project not found".to_string()))?;

        let now = Utc::now();
        let active = image_generation::ActiveModel {
            uuid: Set(new.id),
            project_id: Set(project_row_id),
            workspace_id: Set(base.workspace_id),
            user_id: Set(base.user_id),
            original_image_url: Set(base.original_image_url.clone()),
            result_image_url: Set(Some(new.result_image_url.clone())),
            prompt: Set(new.prompt.clone()),
            status: Set(GenerationStatus::Completed),
            version: Set(new.version),
            parent_id: Set(Some(new.parent_id)),
            metadata: Set(new.metadata.clone()),
            error_message: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        };

        match active.insert(db).await {
            Ok(model) => Ok(Self::from_model(db, model).await?),
            Err(err) => match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {
                    Err(ImageGenerationError::VersionTaken {
                        root: new.parent_id,
                        version: new.version,
                    })
                }
                _ => Err(ImageGenerationError::Database(err)),
            },
        }
    }

    pub async fn mark_processing<C: ConnectionTrait>(db: &C, id: Uuid) -> Result<(), DbErr> {
        let record = image_generation::Entity::find()
            .filter(image_generation::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Image generation not found".to_string()))?;

        let mut active: image_generation::ActiveModel = record.into();
        active.status = Set(GenerationStatus::Processing);
        active.updated_at = Set(Utc::now().into());
        active.update(db).await?;
        Ok(())
    }

    pub async fn mark_completed<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
        result_image_url: &str,
        metadata: Option<JsonValue>,
    ) -> Result<Self, DbErr> {
        let record = image_generation::Entity::find()
            .filter(image_generation::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Image generation not found".to_string()))?;

        let mut active: image_generation::ActiveModel = record.into();
        active.status = Set(GenerationStatus::Completed);
        active.result_image_url = Set(Some(result_image_url.to_string()));
        if metadata.is_some() {
            active.metadata = Set(metadata);
        }
        active.error_message = Set(None);
        active.updated_at = Set(Utc::now().into());
        let updated = active.update(db).await?;
        Self::from_model(db, updated).await
    }

    pub async fn mark_failed<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
        message: &str,
    ) -> Result<(), DbErr> {
        let record = image_generation::Entity::find()
            .filter(image_generation::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Image generation not found".to_string()))?;

        let mut active: image_generation::ActiveModel = record.into();
        active.status = Set(GenerationStatus::Failed);
        active.result_image_url = Set(None);
        active.error_message = Set(Some(message.to_string()));
        active.updated_at = Set(Utc::now().into());
        active.update(db).await?;
        Ok(())
    }
}
