pub mod aggregator;
pub mod api;
pub mod cache;
pub mod collector;
pub mod config;
pub mod health;
pub mod metrics_defs;
pub mod repository;
pub mod types;

use crate::aggregator::Aggregator;
use crate::api::ApiState;
use crate::cache::{Cache, CacheBackend, CachedRepository};
use crate::collector::Collector;
use crate::config::{Config, ValidationError};
use crate::repository::FileRepository;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Runs the service until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<(), ServiceError> {
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    serve(config, shutdown).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Starts every component and runs until `shutdown` is cancelled, then shuts
/// them down in order: the API drains, the aggregate is flushed, the cache is
/// closed and the remaining tasks are joined.
pub async fn serve(config: Config, shutdown: CancellationToken) -> Result<(), ServiceError> {
    config.validate()?;

    let cache = Arc::new(CacheBackend::connect(&config.cache).await);
    tracing::info!(backend = cache.kind(), "cache ready");

    let file = Arc::new(FileRepository::new(&config.storage.file_path));
    let repository = Arc::new(CachedRepository::new(
        file,
        cache.clone(),
        config.cache.ttl(),
    ));
    let aggregator = Aggregator::new(Some(repository));

    match aggregator.load_from_repository().await {
        Ok(count) => tracing::info!(items = count, "loaded news from repository"),
        Err(e) => tracing::warn!(error = %e, "could not load news from repository, starting empty"),
    }

    let collector = Collector::new(
        config.sources.clone(),
        config.interval(),
        config.request_timeout(),
    )?;
    let api_state = ApiState {
        aggregator: aggregator.clone(),
        sources: collector.registry(),
        cache: cache.clone(),
    };
    let api_listener = api::bind(&config.listener).await?;

    let (results_tx, results_rx) = mpsc::channel(config.channel_capacity);
    let (errors_tx, errors_rx) = mpsc::channel(config.channel_capacity);

    let mut aggregator_task = {
        let aggregator = aggregator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { aggregator.start(results_rx, errors_rx, shutdown).await })
    };

    let mut tasks = JoinSet::new();
    tasks.spawn(collector.run(results_tx, errors_tx, shutdown.clone()));
    tasks.spawn(run_admin(config.clone(), aggregator.clone(), shutdown.clone()));

    let mut api_task = tokio::spawn(api::serve(api_listener, api_state, shutdown.clone()));

    let api_finished = tokio::select! {
        _ = shutdown.cancelled() => false,
        result = &mut api_task => {
            log_api_exit(result);
            shutdown.cancel();
            true
        }
    };

    tracing::info!("shutting down");
    let grace_period = Duration::from_secs(config.shutdown.grace_period_secs);
    let task_timeout = Duration::from_secs(config.shutdown.task_timeout_secs);

    if !api_finished {
        match tokio::time::timeout(grace_period, &mut api_task).await {
            Ok(result) => log_api_exit(result),
            Err(_) => {
                tracing::warn!("api server did not drain within the grace period");
                api_task.abort();
            }
        }
    }

    // The consume loop must be out of the way before the final flush.
    if tokio::time::timeout(task_timeout, &mut aggregator_task)
        .await
        .is_err()
    {
        tracing::warn!("aggregator did not stop in time");
        aggregator_task.abort();
    }

    if let Err(e) = aggregator.save_to_repository().await {
        tracing::error!(error = %e, "failed to flush news to repository");
    }

    if let Err(e) = cache.close().await {
        tracing::warn!(error = %e, "failed to close cache");
    }

    let joined = tokio::time::timeout(task_timeout, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "task failed");
            }
        }
    })
    .await;
    if joined.is_err() {
        tracing::warn!("background tasks did not finish within the timeout");
        tasks.abort_all();
    }

    aggregator.mark_stopped();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn run_admin(config: Config, aggregator: Aggregator, shutdown: CancellationToken) {
    let listener = &config.admin_listener;
    let service = AdminService::new(move || aggregator.is_ready());

    tracing::info!(host = %listener.host, port = listener.port, "admin listening");
    if let Err(e) = run_http_service(
        &listener.host,
        listener.port,
        service,
        shutdown.clone().cancelled_owned(),
    )
    .await
    {
        tracing::error!(error = %e, "admin server failed");
        shutdown.cancel();
    }
}

fn log_api_exit(result: Result<io::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => tracing::info!("api server stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "api server failed"),
        Err(e) => tracing::error!(error = %e, "api server task failed"),
    }
}
