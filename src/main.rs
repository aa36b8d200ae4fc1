use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use backend::{Backends, ChunkStore, local::LocalStore, sftp::SftpStore};
use config::RunMode;
use services::upload_service::{UploadService, connectivity_report};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting chunked-upload with config: {:?}", cfg);

    // --- Storage backends ---
    let local: Arc<dyn ChunkStore> = Arc::new(LocalStore::new(&cfg.storage_root));
    let remote: Option<Arc<dyn ChunkStore>> = cfg
        .sftp
        .clone()
        .map(|settings| Arc::new(SftpStore::new(settings)) as Arc<dyn ChunkStore>);
    let backends = Backends::new(local, remote);

    // --- Remote connectivity check mode ---
    if mode == RunMode::CheckRemote {
        let report = connectivity_report(&backends).await;
        println!("{}", report.detail);
        if !report.ok {
            anyhow::bail!("remote backend check failed: {}", report.detail);
        }
        return Ok(());
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_root).exists() {
        fs::create_dir_all(&cfg.storage_root)?;
        tracing::info!("Created storage directory at {}", cfg.storage_root);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Migrations (always applied; `--migrate` exits afterwards) ---
    db::run_migrations(&db).await?;
    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    if backends.remote().is_some() {
        tracing::info!("Remote SFTP backend enabled");
    }
    let uploads = UploadService::new(db.clone(), backends);
    uploads.recover_stale_merges().await?;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(uploads);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
