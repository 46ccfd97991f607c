use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Projects::Table)
                    .col(pk_id_col(manager, Projects::Id))
                    .col(uuid_col(Projects::Uuid))
                    .col(uuid_col(Projects::WorkspaceId))
                    .col(ColumnDef::new(Projects::Name).string().not_null())
                    .col(
                        ColumnDef::new(Projects::ImageCount)
                            .big_integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(
                        ColumnDef::new(Projects::CompletedCount)
                            .big_integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(timestamp_col(Projects::CreatedAt))
                    .col(timestamp_col(Projects::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_projects_uuid")
                    .table(Projects::Table)
                    .col(Projects::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_projects_workspace_id")
                    .table(Projects::Table)
                    .col(Projects::WorkspaceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(ImageGenerations::Table)
                    .col(pk_id_col(manager, ImageGenerations::Id))
                    .col(uuid_col(ImageGenerations::Uuid))
                    .col(fk_id_col(manager, ImageGenerations::ProjectId))
                    .col(uuid_col(ImageGenerations::WorkspaceId))
                    .col(uuid_col(ImageGenerations::UserId))
                    .col(
                        ColumnDef::new(ImageGenerations::OriginalImageUrl)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ImageGenerations::ResultImageUrl).text())
                    .col(ColumnDef::new(ImageGenerations::Prompt).text().not_null())
                    .col(
                        ColumnDef::new(ImageGenerations::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(ImageGenerations::Version)
                            .integer()
                            .not_null()
                            .default(Expr::val(1)),
                    )
                    .col(uuid_nullable_col(ImageGenerations::ParentId))
                    .col(ColumnDef::new(ImageGenerations::Metadata).json())
                    .col(ColumnDef::new(ImageGenerations::ErrorMessage).text())
                    .col(timestamp_col(ImageGenerations::CreatedAt))
                    .col(timestamp_col(ImageGenerations::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_image_generations_project_id")
                            .from(ImageGenerations::Table, ImageGenerations::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_image_generations_uuid")
                    .table(ImageGenerations::Table)
                    .col(ImageGenerations::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_image_generations_project_id")
                    .table(ImageGenerations::Table)
                    .col(ImageGenerations::ProjectId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_image_generations_status")
                    .table(ImageGenerations::Table)
                    .col(ImageGenerations::Status)
                    .to_owned(),
            )
            .await?;

        // Arbitrates concurrent edits of one base: the losing writer gets a
        // unique violation and recomputes its version. NULL parents (lineage
        // roots) are distinct under sqlite, so roots never collide here.
        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_image_generations_parent_version")
                    .table(ImageGenerations::Table)
                    .col(ImageGenerations::ParentId)
                    .col(ImageGenerations::Version)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(TransformRuns::Table)
                    .col(pk_id_col(manager, TransformRuns::Id))
                    .col(uuid_col(TransformRuns::Uuid))
                    .col(fk_id_col(manager, TransformRuns::GenerationId))
                    .col(
                        ColumnDef::new(TransformRuns::Kind)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransformRuns::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("queued")),
                    )
                    .col(
                        ColumnDef::new(TransformRuns::Attempts)
                            .integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(uuid_nullable_col(TransformRuns::ResultId))
                    .col(ColumnDef::new(TransformRuns::ErrorMessage).text())
                    .col(timestamp_col(TransformRuns::CreatedAt))
                    .col(timestamp_col(TransformRuns::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_transform_runs_generation_id")
                            .from(TransformRuns::Table, TransformRuns::GenerationId)
                            .to(ImageGenerations::Table, ImageGenerations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_transform_runs_uuid")
                    .table(TransformRuns::Table)
                    .col(TransformRuns::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_transform_runs_generation_id")
                    .table(TransformRuns::Table)
                    .col(TransformRuns::GenerationId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_transform_runs_status")
                    .table(TransformRuns::Table)
                    .col(TransformRuns::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TransformRuns::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ImageGenerations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Projects::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: IntoIden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn fk_id_col<T: IntoIden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().to_owned()
}

fn uuid_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().not_null().to_owned()
}

fn uuid_nullable_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().to_owned()
}

fn timestamp_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum Projects {
    Table,
    Id,
    Uuid,
    WorkspaceId,
    Name,
    ImageCount,
    CompletedCount,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ImageGenerations {
    Table,
    Id,
    Uuid,
    ProjectId,
    WorkspaceId,
    UserId,
    OriginalImageUrl,
    ResultImageUrl,
    Prompt,
    Status,
    Version,
    ParentId,
    Metadata,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum TransformRuns {
    Table,
    Id,
    Uuid,
    GenerationId,
    Kind,
    Status,
    Attempts,
    ResultId,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}
