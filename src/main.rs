use anyhow::{Context, Result};
use axum::Router;
use gist_shard_store::{
    ShardedMediaStore, StoreOptions,
    backend::{ContainerBackend, FilesystemBackend, GistBackend},
    config::{AppConfig, BackendKind},
    kv::{KeyValueStore, SqliteKvStore},
    models::ShardPolicy,
    routes::routes::routes,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// How often the cache warmer sweeps expired entries and re-reads manifests.
const CACHE_WARM_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting gist-shard-store with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx does not create the database file on its own.
    if !db_path_obj.exists() {
        match fs::OpenOptions::new().create(true).truncate(false).write(true).open(db_path) {
            Ok(_) => tracing::debug!("Created database file {}", db_path),
            Err(e) => tracing::warn!("Failed to create database file: {}", e),
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    let kv_store = SqliteKvStore::new(db);

    // --- Handle migration mode ---
    if migrate {
        kv_store.ensure_schema().await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    kv_store.ensure_schema().await?;

    // --- Container backend ---
    let backend: Arc<dyn ContainerBackend> = match cfg.backend {
        BackendKind::Filesystem => {
            if !Path::new(&cfg.containers_dir).exists() {
                fs::create_dir_all(&cfg.containers_dir)?;
                tracing::info!("Created containers directory at {}", cfg.containers_dir);
            }
            Arc::new(FilesystemBackend::new(&cfg.containers_dir))
        }
        BackendKind::Gist => {
            let token = cfg.gist_token.clone().unwrap_or_default();
            Arc::new(GistBackend::new(token, cfg.gist_api_url.clone())?)
        }
    };
    let kv: Arc<dyn KeyValueStore> = Arc::new(kv_store);

    // --- Initialize core service ---
    let store = Arc::new(ShardedMediaStore::new(
        backend,
        kv,
        StoreOptions {
            policy: ShardPolicy::default(),
            app_version: cfg.app_version.clone(),
            device_id: cfg.device_id.clone(),
        },
    ));
    store.initialize().await;
    if let Some(master) = &cfg.master_gist_id {
        store.bind_master_container(master).await?;
    }
    store.start_cache_warmer(CACHE_WARM_INTERVAL).await;

    // --- Build router ---
    let app: Router = routes().with_state(store.clone());

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
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    store.destroy().await;
    Ok(())
}
