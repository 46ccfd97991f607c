use sea_orm::{JsonValue, entity::prelude::*};

use crate::types::GenerationStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "image_generations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uuid: Uuid,
    pub project_id: i64,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub original_image_url: String,
    pub result_image_url: Option<String>,
    pub prompt: String,
    pub status: GenerationStatus,
    pub version: i32,
    /// Root of the lineage; NULL for the root record itself.
    pub parent_id: Option<Uuid>,
    pub metadata: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
