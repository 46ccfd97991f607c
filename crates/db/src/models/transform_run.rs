use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    entities::transform_run,
    models::ids,
    types::{RunStatus, TaskKind},
};

/// Durable record of one dispatched transformation run. `attempts` counts
/// every started attempt, so retries stay observable after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRun {
    pub id: Uuid,
    pub generation_id: Uuid,
    pub kind: TaskKind,
    pub status: RunStatus,
    pub attempts: i32,
    pub result_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTransformRun {
    pub generation_id: Uuid,
    pub kind: TaskKind,
}

impl TransformRun {
    async fn from_model<C: ConnectionTrait>(
        db: &C,
        model: transform_run::Model,
    ) -> Result<Self, DbErr> {
        let generation_id = ids::generation_uuid_by_id(db, model.generation_id)
            .await?
            .ok_or(DbErr::RecordNotFound("Image generation not found".to_string()))?;

        Ok(Self {
            id: model.uuid,
            generation_id,
            kind: model.kind,
            status: model.status,
            attempts: model.attempts,
            result_id: model.result_id,
            error_message: model.error_message,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        })
    }

    pub async fn create<C: ConnectionTrait>(
        db: &C,
        data: &CreateTransformRun,
    ) -> Result<Self, DbErr> {
        let generation_row_id = ids::generation_id_by_uuid(db, data.generation_id)
            .await?
            .ok_or(DbErr::RecordNotFound("Image generation not found".to_string()))?;

        let now = Utc::now();
        let active = transform_run::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            generation_id: Set(generation_row_id),
            kind: Set(data.kind),
            status: Set(RunStatus::Queued),
            attempts: Set(0),
            result_id: Set(None),
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
        let record = transform_run::Entity::find()
            .filter(transform_run::Column::Uuid.eq(id))
            .one(db)
            .await?;
        match record {
            Some(model) => Ok(Some(Self::from_model(db, model).await?)),
            None => Ok(None),
        }
    }

    /// Marks the run running and bumps the attempt counter, returning the
    /// attempt number that is about to execute.
    pub async fn record_attempt<C: ConnectionTrait>(db: &C, id: Uuid) -> Result<i32, DbErr> {
        let record = transform_run::Entity::find()
            .filter(transform_run::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Transform run not found".to_string()))?;

        let attempt = record.attempts + 1;
        let mut active: transform_run::ActiveModel = record.into();
        active.attempts = Set(attempt);
        active.status = Set(RunStatus::Running);
        active.updated_at = Set(Utc::now().into());
        active.update(db).await?;
        Ok(attempt)
    }

    pub async fn mark_completed<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
        result_id: Uuid,
    ) -> Result<(), DbErr> {
        let record = transform_run::Entity::find()
            .filter(transform_run::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Transform run not found".to_string()))?;

        let mut active: transform_run::ActiveModel = record.into();
        active.status = Set(RunStatus::Completed);
        active.result_id = Set(Some(result_id));
        active.error_message = Set(None);
        active.updated_at = Set(Utc::now().into());
        active.update(db).await?;
        Ok(())
    }

    pub async fn mark_failed<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
        message: &str,
    ) -> Result<(), DbErr> {
        let record = transform_run::Entity::find()
            .filter(transform_run::Column::Uuid.eq(id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Transform run not found".to_string()))?;

        let mut active: transform_run::ActiveModel = record.into();
        active.status = Set(RunStatus::Failed);
        active.error_message = Set(Some(message.to_string()));
        active.updated_at = Set(Utc::now().into());
        active.update(db).await?;
        Ok(())
    }

    /// Runs left queued or running, oldest first. Populated only after an
    /// unclean shutdown; the startup sweep fails them.
    pub async fn find_unfinished<C: ConnectionTrait>(db: &C) -> Result<Vec<Self>, DbErr> {
        let records = transform_run::Entity::find()
            .filter(
                transform_run::Column::Status.is_in([RunStatus::Queued, RunStatus::Running]),
            )
            .order_by_asc(transform_run::Column::CreatedAt)
            .all(db)
            .await?;

        let mut runs = Vec::with_capacity(records.len());
        for model in records {
            runs.push(Self::from_model(db, model).await?);
        }
        Ok(runs)
    }
}
