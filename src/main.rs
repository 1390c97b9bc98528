use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod network;
mod routes;
mod services;

use config::{AppConfig, Backend};
use network::{ObjectNetwork, local::LocalNetwork, memory::MemoryNetwork};
use services::{
    cache::{CacheConfig, MetadataCaches},
    detector::MagicDetector,
    gateway::Gateway,
    settings::{LocalSettings, MemorySettings, SettingsStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-gateway with config: {:?}", cfg);

    let (network, settings): (Arc<dyn ObjectNetwork>, Arc<dyn SettingsStore>) = match cfg.backend
    {
        Backend::Memory => {
            if migrate {
                tracing::info!("Memory backend has no schema, nothing to migrate.");
                return Ok(());
            }
            (
                Arc::new(MemoryNetwork::new()),
                Arc::new(MemorySettings::new()),
            )
        }
        Backend::Local => {
            let db = connect_local(&cfg).await?;

            // --- Handle migration mode ---
            if migrate {
                network::local::run_migrations(&db).await?;
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }

            (
                Arc::new(LocalNetwork::new(db.clone(), cfg.storage_dir.clone())),
                Arc::new(LocalSettings::new(db)),
            )
        }
    };

    // --- Initialize gateway ---
    let caches = MetadataCaches::in_memory(CacheConfig {
        capacity: cfg.cache_capacity,
        lifetime: cfg.cache_lifetime,
    });
    let gateway = Gateway::new(network, settings, caches, Arc::new(MagicDetector));
    let state = handlers::AppState::new(Arc::new(gateway), cfg.request_timeout);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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

/// Prepare the payload directory and the SQLite file, then open the pool.
async fn connect_local(cfg: &AppConfig) -> Result<Arc<sqlx::SqlitePool>> {
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLite refuses to open a missing file without `mode=rwc`.
    match fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(db_path)
    {
        Ok(_) => tracing::debug!("File can be created/opened successfully."),
        Err(e) => tracing::warn!("Failed to open file manually: {}", e),
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;
    Ok(Arc::new(db))
}
