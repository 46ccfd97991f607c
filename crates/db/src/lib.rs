use std::path::Path;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub mod entities;
pub mod models;
pub mod types;

pub use sea_orm::{DbConn, DbErr};

#[derive(Clone)]
pub struct DBService {
    pub connection: DatabaseConnection,
}

impl DBService {
    /// Opens (creating if needed) the sqlite database under the asset dir
    /// and brings the schema up to date.
    pub async fn new(asset_dir: &Path) -> Result<Self, DbErr> {
        let db_path = asset_dir.join("db.sqlite");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        Self::from_url(&url).await
    }

    pub async fn from_url(url: &str) -> Result<Self, DbErr> {
        let mut options = ConnectOptions::new(url);
        options.sqlx_logging(false);
        let connection = Database::connect(options).await?;
        let pending = db_migration::Migrator::get_pending_migrations(&connection).await?;
        if !pending.is_empty() {
            tracing::info!("applying {} pending database migration(s)", pending.len());
        }
        db_migration::Migrator::up(&connection, None).await?;
        Ok(Self { connection })
    }
}
