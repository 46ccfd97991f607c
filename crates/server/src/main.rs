use std::sync::Arc;

use db::{DBService, DbErr};
use rand::{Rng, distributions::Alphanumeric};
use server::{AppState, routes};
use services::services::{
    config::{Config, ConfigError, load_config_from_file, save_config_to_file},
    eligibility::AllowAll,
    inference::HttpInferenceClient,
    storage::{FsObjectStore, ObjectStore},
    transform::TransformService,
};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use utils::assets::{asset_dir, config_path, objects_dir};
use utils_jwt::TokenService;

#[derive(Debug, Error)]
enum DarkroomError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[tokio::main]
async fn main() -> Result<(), DarkroomError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = load_config_from_file(&config_path()).await;
    let (config, secret) = ensure_token_secret(config).await?;

    let db = DBService::new(&asset_dir()).await?;
    std::fs::create_dir_all(objects_dir())?;

    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        objects_dir(),
        config.storage.public_base_url.clone(),
    ));
    let inference = Arc::new(HttpInferenceClient::new(&config.inference));
    let tokens = Arc::new(TokenService::new(secret.as_bytes(), config.token.ttl_secs));
    let transform = TransformService::new(
        db.clone(),
        store.clone(),
        inference,
        Arc::new(AllowAll),
        tokens.clone(),
        config.transform,
    );

    // Runs that were in flight when the last process died are unrecoverable.
    transform.recover_interrupted().await?;

    let state = AppState {
        db,
        store,
        tokens,
        transform,
    };
    let app = routes::router(state, objects_dir());

    let port = std::env::var("BACKEND_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .unwrap_or(config.server.port);
    let host = std::env::var("HOST").unwrap_or_else(|_| config.server.host.clone());

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!("Server running on http://{host}:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Loads or generates the HS256 secret used for run-status and upload tokens.
/// A generated secret is persisted so tokens survive restarts.
async fn ensure_token_secret(mut config: Config) -> Result<(Config, String), DarkroomError> {
    if let Some(secret) = config.token.secret.clone().filter(|s| !s.is_empty()) {
        return Ok((config, secret));
    }

    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    config.token.secret = Some(secret.clone());
    save_config_to_file(&config, &config_path()).await?;
    tracing::info!("Generated and persisted a new token secret");

    Ok((config, secret))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!("Failed to install SIGINT handler: {err}");
                return std::future::pending().await;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {err}");
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {err}");
            return std::future::pending().await;
        }
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
