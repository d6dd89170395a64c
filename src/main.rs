use anyhow::Result;
use backup_replicator::{
    AppState, app,
    config::AppConfig,
    services::{
        clock::SystemClock,
        mapping_store::SqliteMappingStore,
        object_store::{FsObjectStore, Replica},
    },
};
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting backup-replicator with config: {:?}", cfg);

    // --- Ensure object store directories exist ---
    for dir in [&cfg.source_dir, &cfg.destination_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).await?;
            tracing::info!("Created storage directory at {}", dir);
        }
    }

    // --- Initialize SQLite mapping table ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let store = Arc::new(SqliteMappingStore::connect(&cfg.database_url, 5).await?);
    store.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let replica = Replica::new(
        Arc::new(FsObjectStore::new(&cfg.source_dir)),
        Arc::new(FsObjectStore::new(&cfg.destination_dir)),
    );
    let state = AppState::new(
        store,
        replica,
        Arc::new(SystemClock),
        cfg.replicator_config(),
        cfg.cleaner_config(),
        cfg.source_bucket.clone(),
    );

    if let Some(secs) = cfg.sweep_interval_secs {
        tracing::info!("Running Cleaner in-process every {}s", secs);
        tokio::spawn(state.cleaner.clone().run_every(Duration::from_secs(secs)));
    }

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
    axum::serve(listener, app(state)).await?;

    Ok(())
}
