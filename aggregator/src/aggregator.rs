use crate::collector::SourceError;
use crate::metrics_defs::{AGGREGATE_SIZE, MERGE_DURATION, REPOSITORY_SAVE_FAILURES};
use crate::repository::{NewsRepository, RepositoryError};
use crate::types::{Item, MAX_ITEMS, limit_to, sort_by_date};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shared::{counter, gauge, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of the aggregate over the process lifetime. Transitions only
/// move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorState {
    Empty,
    Seeded,
    Running,
    Draining,
    Flushed,
    Stopped,
}

struct AggregatorInner {
    // Replaced wholesale by every merge. Readers clone the Arc and release
    // the lock immediately.
    items: RwLock<Arc<Vec<Item>>>,
    repository: Option<Arc<dyn NewsRepository>>,
    state: Mutex<AggregatorState>,
}

/// Owner of the canonical item list. Cloning the handle shares the list.
///
/// Merges are the only writer. They run under the write lock so readers see
/// either the list before or after a merge, never anything in between.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<AggregatorInner>,
}

impl Aggregator {
    pub fn new(repository: Option<Arc<dyn NewsRepository>>) -> Self {
        Aggregator {
            inner: Arc::new(AggregatorInner {
                items: RwLock::new(Arc::new(Vec::new())),
                repository,
                state: Mutex::new(AggregatorState::Empty),
            }),
        }
    }

    pub fn state(&self) -> AggregatorState {
        *self.inner.state.lock()
    }

    /// Used by the readiness probe.
    pub fn is_ready(&self) -> bool {
        self.state() == AggregatorState::Running
    }

    fn advance(&self, next: AggregatorState) {
        let mut state = self.inner.state.lock();
        if next > *state {
            tracing::debug!(from = ?*state, to = ?next, "aggregator state change");
            *state = next;
        }
    }

    pub fn mark_stopped(&self) {
        self.advance(AggregatorState::Stopped);
    }

    /// Seeds the list from the repository. Called once before `start`.
    /// Returns the number of items loaded.
    pub async fn load_from_repository(&self) -> Result<usize, RepositoryError> {
        let Some(repository) = &self.inner.repository else {
            return Ok(0);
        };

        let loaded = repository.get_latest_news(MAX_ITEMS).await?;
        let items = merge_batch(&[], loaded);
        let count = items.len();

        *self.inner.items.write() = Arc::new(items);
        gauge!(AGGREGATE_SIZE).set(count as f64);
        self.advance(AggregatorState::Seeded);

        Ok(count)
    }

    /// Flushes the current list to the repository. Called once after the
    /// consume loop has stopped.
    pub async fn save_to_repository(&self) -> Result<(), RepositoryError> {
        if let Some(repository) = &self.inner.repository {
            let items = self.current();
            repository.save_news(&items).await?;
            tracing::info!(items = items.len(), "flushed news to repository");
        }

        if self.state() == AggregatorState::Draining {
            self.advance(AggregatorState::Flushed);
        }
        Ok(())
    }

    /// Consumes collector output until `shutdown` is cancelled. Batches are
    /// merged in the order they are received, errors are only logged.
    pub async fn start(
        &self,
        mut results: mpsc::Receiver<Vec<Item>>,
        mut errors: mpsc::Receiver<SourceError>,
        shutdown: CancellationToken,
    ) {
        self.advance(AggregatorState::Running);
        tracing::info!(items = self.len(), "aggregator started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(batch) = results.recv() => self.merge(batch).await,
                Some(error) = errors.recv() => {
                    tracing::warn!(
                        source = %error.source_name,
                        error = %error.error,
                        "collection failed"
                    );
                }
            }
        }

        results.close();
        errors.close();
        self.advance(AggregatorState::Draining);
        tracing::info!(items = self.len(), "aggregator stopped");
    }

    /// Merges a batch into the list and writes the result through to the
    /// repository. Persistence failures are logged and otherwise ignored.
    ///
    /// The write-through happens after the lock is released, so merges must
    /// not overlap or an older snapshot could be persisted last. The consume
    /// loop in `start` is the only caller outside of tests.
    pub(crate) async fn merge(&self, batch: Vec<Item>) {
        let started = Instant::now();
        let batch_len = batch.len();

        let merged = {
            let mut items = self.inner.items.write();
            let merged = Arc::new(merge_batch(&items, batch));
            *items = merged.clone();
            merged
        };

        histogram!(MERGE_DURATION).record(started.elapsed().as_secs_f64());
        gauge!(AGGREGATE_SIZE).set(merged.len() as f64);
        tracing::debug!(batch = batch_len, items = merged.len(), "merged batch");

        if let Some(repository) = &self.inner.repository
            && let Err(e) = repository.save_news(&merged).await
        {
            counter!(REPOSITORY_SAVE_FAILURES).increment(1);
            tracing::error!(error = %e, "failed to persist news");
        }
    }

    /// Up to `limit` most recent items. A `limit` of 0 yields nothing.
    pub fn get_latest_news(&self, limit: usize) -> Vec<Item> {
        limit_to(&self.current(), limit)
    }

    pub fn snapshot(&self) -> Vec<Item> {
        self.current().as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<Vec<Item>> {
        self.inner.items.read().clone()
    }
}

/// Appends `batch` to `current`, keeps the first occurrence of every id,
/// sorts most recent first and caps the result at `MAX_ITEMS`.
fn merge_batch(current: &[Item], batch: Vec<Item>) -> Vec<Item> {
    let mut seen = HashSet::with_capacity(current.len() + batch.len());
    let mut merged: Vec<Item> = current
        .iter()
        .cloned()
        .chain(batch)
        .filter(|item| seen.insert(item.id.clone()))
        .collect();

    sort_by_date(&mut merged);
    merged.truncate(MAX_ITEMS);
    merged
}
