//! Component health checks behind `/api/v1/healthz`.
//!
//! The service keeps answering news requests from memory as long as the
//! aggregator runs, so only a stopped aggregator makes it unhealthy. A cache
//! that stops answering or a source that keeps failing degrades it to a
//! warning.

use crate::aggregator::{Aggregator, AggregatorState};
use crate::cache::Cache;
use crate::collector::{SourceRegistry, SourceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered from best to worst, so the overall status is the maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct Check {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Check {
    fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Check {
            status,
            message: message.into(),
            error: None,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub checks: BTreeMap<String, Check>,
}

/// Runs every check. The cache ping is bounded by `timeout`; the other
/// checks only read in-memory state.
pub async fn run_checks(
    aggregator: &Aggregator,
    sources: &SourceRegistry,
    cache: &dyn Cache,
    timeout: Duration,
) -> HealthReport {
    let started = Instant::now();
    let mut checks = BTreeMap::new();

    checks.insert("aggregator".to_string(), aggregator_check(aggregator));
    checks.insert("cache".to_string(), cache_check(cache, timeout).await);
    for status in sources.list() {
        checks.insert(format!("source_{}", status.name), source_check(&status));
    }

    let status = checks
        .values()
        .map(|check| check.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthReport {
        status,
        timestamp: Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
        checks,
    }
}

fn aggregator_check(aggregator: &Aggregator) -> Check {
    match aggregator.state() {
        AggregatorState::Running => Check::new(
            HealthStatus::Healthy,
            format!("aggregating, {} items held", aggregator.len()),
        ),
        AggregatorState::Empty | AggregatorState::Seeded => {
            Check::new(HealthStatus::Warning, "aggregator has not started yet")
        }
        AggregatorState::Draining | AggregatorState::Flushed | AggregatorState::Stopped => {
            Check::new(HealthStatus::Unhealthy, "aggregator is shutting down")
        }
    }
}

// Reads fall through to storage when the cache is down.
async fn cache_check(cache: &dyn Cache, timeout: Duration) -> Check {
    match tokio::time::timeout(timeout, cache.ping()).await {
        Ok(Ok(())) => Check::new(HealthStatus::Healthy, "cache reachable"),
        Ok(Err(e)) => {
            Check::new(HealthStatus::Warning, "cache unreachable").with_error(e.to_string())
        }
        Err(_) => Check::new(HealthStatus::Warning, "cache unreachable")
            .with_error(format!("no answer within {}ms", timeout.as_millis())),
    }
}

fn source_check(status: &SourceStatus) -> Check {
    if status.consecutive_failures == 0 {
        return Check::new(
            HealthStatus::Healthy,
            format!("{} items in the last fetch", status.last_item_count),
        );
    }

    let check = Check::new(
        HealthStatus::Warning,
        format!("{} consecutive failed fetches", status.consecutive_failures),
    );
    match &status.last_error {
        Some(error) => check.with_error(error.clone()),
        None => check,
    }
}
