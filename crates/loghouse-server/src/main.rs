//! Loghouse server binary
//!
//! Wires configuration, the two storage tiers, the retention sweep, and
//! the stats aggregator into the axum server, then runs until SIGINT or
//! SIGTERM.
//!
//! Configuration is environment-driven; see [`loghouse_server::config`].
//! Logging is controlled via `RUST_LOG`.

use std::path::Path;
use std::sync::Arc;

use loghouse_server::{
    cleanup, config::CLEANUP_JOB_RETRIES, stats, AppState, CleanupQueue, Config, Leader,
    SingleNodeLeader,
};
use loghouse_storage::{BucketLogStore, LogStore, SqliteLogStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());

    if let Some(parent) = Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path, "initializing primary store");
    let db = Arc::new(SqliteLogStore::new(&config.db_path).await?);

    let bucket = object_store_tier(&config)?;

    let cleanup_queue = Arc::new(CleanupQueue::new(
        db.clone() as Arc<dyn LogStore>,
        bucket.clone().map(|b| b as Arc<dyn LogStore>),
        config.cleanup_workers,
        config.cleanup_batch_size,
        CLEANUP_JOB_RETRIES,
    ));

    let leader: Arc<dyn Leader> = Arc::new(SingleNodeLeader);
    let _sweep = cleanup::start_sweep(
        db.clone(),
        cleanup_queue.clone(),
        leader,
        config.cleanup_interval,
        config.retention,
        config.cleanup_batch_size,
    );

    let (stats_tx, stats_logger) = stats::StatsLogger::new(1024);
    let _stats = tokio::spawn(stats_logger.run(stats::FLUSH_INTERVAL));

    let state = AppState {
        db,
        bucket,
        config: config.clone(),
        cleanup: cleanup_queue,
        stats: stats_tx,
    };
    let app = loghouse_server::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(
        addr = %config.addr,
        url = %config.url,
        retention_days = config.retention.as_secs() / 86_400,
        cleanup_workers = config.cleanup_workers,
        "loghouse server starting"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("loghouse server shut down gracefully");
    Ok(())
}

fn object_store_tier(config: &Config) -> anyhow::Result<Option<Arc<BucketLogStore>>> {
    if config.use_local_storage {
        std::fs::create_dir_all(&config.local_storage_path)?;
        tracing::info!(path = %config.local_storage_path, "object-store tier on local filesystem");
        let store =
            object_store::local::LocalFileSystem::new_with_prefix(&config.local_storage_path)?;
        return Ok(Some(Arc::new(BucketLogStore::new(Arc::new(store)))));
    }

    if let Some(bucket) = &config.bucket {
        tracing::info!(bucket = %bucket, "object-store tier on S3");
        let s3 = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        return Ok(Some(Arc::new(BucketLogStore::new(Arc::new(s3)))));
    }

    tracing::info!("object-store tier disabled");
    Ok(None)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
