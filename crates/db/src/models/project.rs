use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    entities::{image_generation, project},
    types::GenerationStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub image_count: i64,
    pub completed_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub workspace_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProjectCounts {
    pub image_count: i64,
    pub completed_count: i64,
}

impl Project {
    fn from_model(model: project::Model) -> Self {
        Self {
            id: model.uuid,
            workspace_id: model.workspace_id,
            name: model.name,
            image_count: model.image_count,
            completed_count: model.completed_count,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }

    pub async fn create<C: ConnectionTrait>(
        db: &C,
        data: &CreateProject,
    ) -> Result<Self, DbErr> {
        let now = Utc::now();
        let active = project::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            workspace_id: Set(data.workspace_id),
            name: Set(data.name.clone()),
            image_count: Set(0),
            completed_count: Set(0),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            ..Default::default()
        };

        let model = active.insert(db).await?;
        Ok(Self::from_model(model))
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
    ) -> Result<Option<Self>, DbErr> {
        let record = project::Entity::find()
            .filter(project::Column::Uuid.eq(id))
            .one(db)
            .await?;
        Ok(record.map(Self::from_model))
    }

    pub async fn find_all<C: ConnectionTrait>(db: &C) -> Result<Vec<Self>, DbErr> {
        let records = project::Entity::find()
            .order_by_desc(project::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    /// Recomputes the aggregate counters from the generations table. Counts
    /// are derived, never incremented, so a recount after any terminal
    /// transition is always consistent.
    pub async fn recount<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
    ) -> Result<ProjectCounts, DbErr> {
        let record = project::Entity::find()
            .filter(project::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Project not found".to_string()))?;

        let image_count = image_generation::Entity::find()
            .filter(image_generation::Column::ProjectId.eq(record.id))
            .count(db)
            .await?;
        let completed_count = image_generation::Entity::find()
            .filter(image_generation::Column::ProjectId.eq(record.id))
            .filter(image_generation::Column::Status.eq(GenerationStatus::Completed))
            .count(db)
            .await?;

        let counts = ProjectCounts {
            image_count: i64::try_from(image_count).unwrap_or(i64::MAX),
            completed_count: i64::try_from(completed_count).unwrap_or(i64::MAX),
        };

        let mut active: project::ActiveModel = record.into();
        active.image_count = Set(counts.image_count);
        active.completed_count = Set(counts.completed_count);
        active.updated_at = Set(Utc::now().into());
        active.update(db).await?;

        Ok(counts)
    }
}
