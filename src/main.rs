mod api;
mod artifact_store;
mod auth;
mod blob_store;
mod bus;
mod config;
mod dedup_lock;
mod errors;
mod models;
mod pipeline;
mod progress;
mod queue;
mod selection;
mod source;
mod store;
mod transcoder;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use blob_store::{LocalBlobStore, UrlSigner};
use bus::NotificationBus;
use config::Config;
use dedup_lock::DedupLock;
use pipeline::{Collaborators, Pipeline, PipelineSettings};
use queue::WorkerSettings;
use source::YtDlpSource;
use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use transcoder::FfmpegTranscoder;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn TaskStore>,
    pub bus: Arc<NotificationBus>,
    pub blobs: Arc<LocalBlobStore>,
    pub queue_tx: mpsc::Sender<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidfetch_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using generated API key; set VIDFETCH_API_KEY to call the API");
    }
    if config.link_secret_is_fallback {
        warn!("Using generated link secret; signed links will not survive a restart");
    }

    artifact_store::ensure_work_root(&config.work_root).await?;

    let store: Arc<dyn TaskStore> = match &config.database_path {
        Some(path) => {
            info!("Persisting tasks in {}", path.display());
            Arc::new(SqliteTaskStore::open(path)?)
        }
        None => {
            warn!("VIDFETCH_DATABASE_PATH not set; tasks are kept in memory only");
            Arc::new(MemoryTaskStore::new())
        }
    };

    let blobs = Arc::new(LocalBlobStore::new(
        config.blob_root.clone(),
        config.public_base_url.clone(),
        UrlSigner::new(config.link_secret.clone()),
    ));
    blobs.ensure_root().await?;

    let bus = Arc::new(NotificationBus::new());
    let locks = Arc::new(DedupLock::new(config.lock_ttl));

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        bus.clone(),
        locks.clone(),
        Collaborators {
            source: Arc::new(YtDlpSource::new(config.ytdlp_bin.clone())),
            transcoder: Arc::new(FfmpegTranscoder::new(config.ffmpeg_bin.clone())),
            blobs: blobs.clone(),
        },
        PipelineSettings {
            work_root: config.work_root.clone(),
            lock_key_policy: config.lock_key_policy,
            selection: config.selection.clone(),
            link_ttl: config.link_ttl,
            stage_timeout: config.stage_timeout,
        },
    ));

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    queue::spawn_pipeline_workers(
        pipeline,
        queue_rx,
        &queue_tx,
        WorkerSettings {
            worker_count: config.worker_count,
            lock_retry: config.lock_retry,
        },
    );
    queue::spawn_housekeeping_worker(bus.clone(), locks, config.event_retention);

    let recovery = queue::recover_unfinished(store.as_ref(), &queue_tx).await?;
    if recovery != queue::Recovery::default() {
        info!(
            requeued = recovery.requeued,
            failed = recovery.failed,
            "Recovered unfinished tasks"
        );
    }

    let state = AppState {
        config: config.clone(),
        store,
        bus,
        blobs,
        queue_tx,
    };

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/downloads", post(api::create_download))
        .route("/v1/downloads/{task_id}", get(api::get_download))
        .route("/v1/downloads/{task_id}/events", get(api::download_events))
        .route("/v1/files/{*key}", get(api::download_file))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        workers = config.worker_count,
        lock_key = config.lock_key_policy.as_str(),
        "vidfetch-api listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
