//! Metrics definitions for the news aggregator.

use shared::metrics_defs::{MetricDef, MetricType};

pub const COLLECTOR_PASS_DURATION: MetricDef = MetricDef {
    name: "collector.pass.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete one collection pass over all sources in seconds",
};

pub const COLLECTOR_ITEMS: MetricDef = MetricDef {
    name: "collector.items",
    metric_type: MetricType::Counter,
    description: "Number of items collected. Tagged with source.",
};

pub const COLLECTOR_ERRORS: MetricDef = MetricDef {
    name: "collector.errors",
    metric_type: MetricType::Counter,
    description: "Number of failed source fetches. Tagged with source, kind.",
};

pub const AGGREGATE_SIZE: MetricDef = MetricDef {
    name: "aggregator.items",
    metric_type: MetricType::Gauge,
    description: "Number of items currently held in the aggregate",
};

pub const MERGE_DURATION: MetricDef = MetricDef {
    name: "aggregator.merge.duration",
    metric_type: MetricType::Histogram,
    description: "Time to merge one batch into the aggregate in seconds",
};

pub const REPOSITORY_SAVE_FAILURES: MetricDef = MetricDef {
    name: "repository.save.failure",
    metric_type: MetricType::Counter,
    description: "Number of failed writes of the aggregate to the repository",
};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of latest-news lookups served from the cache",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of latest-news lookups that fell through to the repository",
};

pub const API_NEWS_REQUESTS: MetricDef = MetricDef {
    name: "api.news.requests",
    metric_type: MetricType::Counter,
    description: "Number of news requests served. Tagged with status.",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in
// the future.
pub const ALL_METRICS: &[MetricDef] = &[
    COLLECTOR_PASS_DURATION,
    COLLECTOR_ITEMS,
    COLLECTOR_ERRORS,
    AGGREGATE_SIZE,
    MERGE_DURATION,
    REPOSITORY_SAVE_FAILURES,
    CACHE_HIT,
    CACHE_MISS,
    API_NEWS_REQUESTS,
];
