use anyhow::Result;
use deploy_store::{
    config::{AppConfig, Role},
    db,
    jobs::{ContentSource, JobContext},
    routes::routes,
    services::{
        cloud_backend::S3Backend,
        cloud_client::CloudClient,
        deploy_repository::SqliteDeployRepository,
        file_client::FileStoreClient,
        file_server::{CloudTier, FileServer},
        job_queue::JobQueue,
        local_store::LocalStore,
        worker::{Worker, WorkerConfig},
    },
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config, role + migrate flag ---
    let (cfg, role, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        role = ?role,
        root = %cfg.root,
        database_url = %cfg.database_url,
        bucket = cfg.bucket().unwrap_or("-"),
        "Starting deploy-store"
    );

    let pool = db::connect(&cfg.database_url).await?;

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let local = LocalStore::new(&cfg.root);
    local.ensure_root().await?;
    let queue = JobQueue::new(pool.clone());

    let cloud = match &cfg.cloud {
        Some(cloud_cfg) => {
            let backend = S3Backend::from_config(cloud_cfg).await;
            tracing::info!(bucket = %cloud_cfg.bucket, region = %cloud_cfg.region, "cloud tier enabled");
            Some(CloudTier {
                client: CloudClient::new(Arc::new(backend)),
                bucket: cloud_cfg.bucket.clone(),
            })
        }
        None => {
            tracing::info!("no bucket configured, running as a pure local store");
            None
        }
    };

    match role {
        Role::Server => serve(&cfg, FileServer::new(local, cloud, queue)).await,
        Role::Worker => {
            let source: Arc<dyn ContentSource> = match &cfg.file_server_url {
                Some(url) => Arc::new(FileStoreClient::new(url)?),
                None => Arc::new(local.clone()),
            };
            let deploys = Arc::new(SqliteDeployRepository::new(
                pool,
                queue.clone(),
                cfg.bucket().map(str::to_string),
            ));
            let ctx = JobContext {
                cloud: cloud.map(|tier| tier.client),
                source,
                local,
                deploys,
            };
            let config = WorkerConfig {
                slots: cfg.workers,
                cleanup_interval: cfg.cleanup_interval,
                ..Default::default()
            };
            Worker::new(queue, ctx, config).run(shutdown_signal()).await
        }
    }
}

async fn serve(cfg: &AppConfig, server: FileServer) -> Result<()> {
    let app = routes::app(server);

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
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
