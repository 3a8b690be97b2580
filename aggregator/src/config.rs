use crate::types::Source;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("At least one source must be configured")]
    NoSources,

    #[error("Empty source name")]
    EmptySourceName,

    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 8081,
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Storage {
    pub file_path: String,
}

impl Default for Storage {
    fn default() -> Self {
        Storage {
            file_path: "news_cache.json".into(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CacheConfig {
    Memory {
        #[serde(default = "default_cache_ttl_secs")]
        ttl_secs: u64,
        #[serde(default = "default_cleanup_interval_secs")]
        cleanup_interval_secs: u64,
        #[serde(default = "default_max_capacity")]
        max_capacity: u64,
    },
    Redis {
        #[serde(default = "default_redis_address")]
        address: String,
        #[serde(default = "default_redis_prefix")]
        prefix: String,
        #[serde(default = "default_cache_ttl_secs")]
        ttl_secs: u64,
        #[serde(default = "default_connect_timeout_secs")]
        connect_timeout_secs: u64,
    },
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        match self {
            CacheConfig::Memory { ttl_secs, .. } | CacheConfig::Redis { ttl_secs, .. } => {
                Duration::from_secs(*ttl_secs)
            }
        }
    }

    /// In-process cache with default settings. Also used as the fallback
    /// when a networked cache cannot be reached.
    pub fn memory() -> Self {
        CacheConfig::Memory {
            ttl_secs: default_cache_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_capacity: default_max_capacity(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            CacheConfig::Memory {
                ttl_secs,
                cleanup_interval_secs,
                max_capacity,
            } => {
                if *ttl_secs == 0 {
                    return Err(ValidationError::ZeroValue("cache.ttl_secs"));
                }
                if *cleanup_interval_secs == 0 {
                    return Err(ValidationError::ZeroValue("cache.cleanup_interval_secs"));
                }
                if *max_capacity == 0 {
                    return Err(ValidationError::ZeroValue("cache.max_capacity"));
                }
            }
            CacheConfig::Redis {
                ttl_secs,
                connect_timeout_secs,
                ..
            } => {
                if *ttl_secs == 0 {
                    return Err(ValidationError::ZeroValue("cache.ttl_secs"));
                }
                if *connect_timeout_secs == 0 {
                    return Err(ValidationError::ZeroValue("cache.connect_timeout_secs"));
                }
            }
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::memory()
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

pub(crate) fn default_cleanup_interval_secs() -> u64 {
    600
}

pub(crate) fn default_max_capacity() -> u64 {
    10_000
}

fn default_redis_address() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_redis_prefix() -> String {
    "infohub:".into()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Shutdown {
    /// Time the API server gets to finish in-flight requests.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Time all background tasks get to finish once the aggregate is flushed.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown {
            grace_period_secs: default_grace_period_secs(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    15
}

fn default_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    100
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Public API listener
    #[serde(default)]
    pub listener: Listener,
    /// Liveness and readiness probes
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    pub sources: Vec<Source>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub shutdown: Shutdown,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.sources.is_empty() {
            return Err(ValidationError::NoSources);
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(ValidationError::EmptySourceName);
            }
            if !names.insert(&source.name) {
                return Err(ValidationError::DuplicateSource(source.name.clone()));
            }
        }

        if self.interval_secs == 0 {
            return Err(ValidationError::ZeroValue("interval_secs"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::ZeroValue("request_timeout_secs"));
        }
        if self.channel_capacity == 0 {
            return Err(ValidationError::ZeroValue("channel_capacity"));
        }

        self.cache.validate()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
