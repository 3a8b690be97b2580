use crate::metrics_defs::{COLLECTOR_ERRORS, COLLECTOR_ITEMS, COLLECTOR_PASS_DURATION};
use crate::types::{Item, Source};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
struct SourcePayload {
    articles: Vec<Article>,
}

#[derive(Deserialize)]
struct Article {
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
}

impl Article {
    // Unparseable or missing timestamps fall back to the collection time.
    fn into_item(self, source: &str, collected_at: DateTime<Utc>, index: usize) -> Item {
        let published_at = self
            .published_at
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(collected_at);

        Item {
            id: Item::collected_id(source, collected_at.timestamp(), index),
            title: self.title.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            url: self.url.unwrap_or_default(),
            source: source.to_string(),
            published_at,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("unexpected status code: {0}")]
    Status(StatusCode),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// Metric tag for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Request(_) => "request",
            FetchError::Status(_) => "status",
            FetchError::Decode(_) => "decode",
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("error collecting from {source_name}: {error}")]
pub struct SourceError {
    pub source_name: String,
    #[source]
    pub error: FetchError,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub url: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_item_count: usize,
    pub consecutive_failures: u64,
    pub total_failures: u64,
}

/// Outcome of the most recent fetches of every configured source, in
/// configuration order.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    statuses: Arc<RwLock<Vec<SourceStatus>>>,
}

impl SourceRegistry {
    pub fn new(sources: &[Source]) -> Self {
        let statuses = sources
            .iter()
            .map(|source| SourceStatus {
                name: source.name.clone(),
                url: source.url.to_string(),
                last_success: None,
                last_error: None,
                last_error_at: None,
                last_item_count: 0,
                consecutive_failures: 0,
                total_failures: 0,
            })
            .collect();

        SourceRegistry {
            statuses: Arc::new(RwLock::new(statuses)),
        }
    }

    pub fn record_success(&self, name: &str, item_count: usize) {
        let mut statuses = self.statuses.write();
        if let Some(status) = statuses.iter_mut().find(|s| s.name == name) {
            status.last_success = Some(Utc::now());
            status.last_item_count = item_count;
            status.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, name: &str, error: &FetchError) {
        let mut statuses = self.statuses.write();
        if let Some(status) = statuses.iter_mut().find(|s| s.name == name) {
            status.last_error = Some(error.to_string());
            status.last_error_at = Some(Utc::now());
            status.consecutive_failures += 1;
            status.total_failures += 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<SourceStatus> {
        self.statuses.read().iter().find(|s| s.name == name).cloned()
    }

    pub fn list(&self) -> Vec<SourceStatus> {
        self.statuses.read().clone()
    }
}

/// Polls every source at a shared interval. Each pass fetches all sources
/// concurrently and delivers per-source batches and errors on bounded
/// channels.
#[derive(Clone)]
pub struct Collector {
    sources: Arc<Vec<Source>>,
    client: reqwest::Client,
    interval: Duration,
    registry: SourceRegistry,
}

impl Collector {
    pub fn new(
        sources: Vec<Source>,
        interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        let registry = SourceRegistry::new(&sources);

        Ok(Collector {
            sources: Arc::new(sources),
            client,
            interval,
            registry,
        })
    }

    pub fn registry(&self) -> SourceRegistry {
        self.registry.clone()
    }

    /// Runs a pass immediately and then once per interval until `shutdown`
    /// is cancelled. A pass that overruns the interval delays the next one.
    pub async fn run(
        self,
        results: mpsc::Sender<Vec<Item>>,
        errors: mpsc::Sender<SourceError>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            sources = self.sources.len(),
            interval_secs = self.interval.as_secs(),
            "collector started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.collect_pass(&results, &errors, &shutdown).await,
            }
        }

        tracing::info!("collector stopped");
    }

    /// One task per source. Returns once every task has finished, or as soon
    /// as `shutdown` fires, in which case outstanding fetches are aborted.
    pub async fn collect_pass(
        &self,
        results: &mpsc::Sender<Vec<Item>>,
        errors: &mpsc::Sender<SourceError>,
        shutdown: &CancellationToken,
    ) {
        let started = Instant::now();
        let mut tasks = JoinSet::new();

        for source in self.sources.iter().cloned() {
            let collector = self.clone();
            let results = results.clone();
            let errors = errors.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                collector
                    .collect_source(source, results, errors, shutdown)
                    .await
            });
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => {
                        tracing::error!(error = %e, "collector task panicked");
                    }
                    Some(_) => {}
                },
            }
        }

        histogram!(COLLECTOR_PASS_DURATION).record(started.elapsed().as_secs_f64());
    }

    async fn collect_source(
        &self,
        source: Source,
        results: mpsc::Sender<Vec<Item>>,
        errors: mpsc::Sender<SourceError>,
        shutdown: CancellationToken,
    ) {
        match self.fetch_source(&source).await {
            Ok(items) => {
                self.registry.record_success(&source.name, items.len());
                counter!(COLLECTOR_ITEMS, "source" => source.name.clone())
                    .increment(items.len() as u64);

                if items.is_empty() {
                    tracing::debug!(source = %source.name, "source returned no items");
                    return;
                }

                tracing::debug!(source = %source.name, items = items.len(), "collected items");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::debug!(source = %source.name, "shutting down, dropping batch");
                    }
                    sent = results.send(items) => {
                        if sent.is_err() {
                            tracing::debug!(source = %source.name, "results channel closed");
                        }
                    }
                }
            }
            Err(error) => {
                self.registry.record_failure(&source.name, &error);
                counter!(COLLECTOR_ERRORS, "source" => source.name.clone(), "kind" => error.kind())
                    .increment(1);

                let error = SourceError {
                    source_name: source.name,
                    error,
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    sent = errors.send(error) => {
                        if let Err(e) = sent {
                            tracing::debug!(error = %e.0, "error channel closed");
                        }
                    }
                }
            }
        }
    }

    /// Fetches and normalizes one source's articles. Ids are derived from the
    /// source name, the time of this fetch and the position in the response.
    pub async fn fetch_source(&self, source: &Source) -> Result<Vec<Item>, FetchError> {
        let response = self
            .client
            .get(source.url.clone())
            .send()
            .await
            .map_err(FetchError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let body = response.bytes().await.map_err(FetchError::Request)?;
        let payload: SourcePayload = serde_json::from_slice(&body)?;

        let collected_at = Utc::now();
        Ok(payload
            .articles
            .into_iter()
            .enumerate()
            .map(|(index, article)| article.into_item(&source.name, collected_at, index))
            .collect())
    }
}
