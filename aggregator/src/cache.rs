// Cache-aside layer for latest-news reads. Values are opaque byte payloads
// with a per-entry time to live. The in-process backend is a moka cache swept
// by a background task; the networked backend is redis.
use crate::config::{self, CacheConfig};
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS};
use crate::repository::{NewsRepository, RepositoryError};
use crate::types::Item;
use async_trait::async_trait;
use bytes::Bytes;
use moka::Expiry;
use moka::sync::Cache as MokaCache;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use shared::counter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Limits whose cached entries are dropped after every save. Entries for any
/// other limit stay until their time to live runs out.
pub const INVALIDATED_LIMITS: [usize; 5] = [10, 50, 100, 500, 1000];

pub fn news_cache_key(limit: usize) -> String {
    format!("news:latest:{limit}")
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// A zero `ttl` means the backend's default time to live.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// `Ok(None)` is a miss. Expired entries are never returned.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Round trip to the backend, used by health checks.
    async fn ping(&self) -> Result<(), CacheError>;

    async fn close(&self) -> Result<(), CacheError>;
}

#[derive(Clone)]
struct Entry {
    value: Bytes,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct MemoryCache {
    entries: MokaCache<String, Entry>,
    default_ttl: Duration,
    sweeper: CancellationToken,
}

impl MemoryCache {
    /// Must be called from within a tokio runtime, the sweep task is spawned
    /// immediately.
    pub fn new(default_ttl: Duration, cleanup_interval: Duration, max_capacity: u64) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();

        let sweeper = CancellationToken::new();
        tokio::spawn(sweep(entries.clone(), cleanup_interval, sweeper.clone()));

        MemoryCache {
            entries,
            default_ttl,
            sweeper,
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

async fn sweep(entries: MokaCache<String, Entry>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                entries.run_pending_tasks();
                tracing::debug!(entries = entries.entry_count(), "swept expired cache entries");
            }
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        self.entries.insert(key.to_string(), Entry { value, ttl });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.invalidate(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.sweeper.cancel();
        self.entries.invalidate_all();
        Ok(())
    }
}

pub struct RedisCache {
    connection: ConnectionManager,
    prefix: String,
    default_ttl: Duration,
}

impl RedisCache {
    /// Fails if the server does not answer within `connect_timeout`.
    pub async fn connect(
        address: &str,
        prefix: &str,
        default_ttl: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let address = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{address}")
        };

        let client = redis::Client::open(address.as_str())?;
        let mut connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::ConnectTimeout(address.clone()))??;

        let _pong: String =
            tokio::time::timeout(connect_timeout, redis::cmd("PING").query_async(&mut connection))
                .await
                .map_err(|_| CacheError::ConnectTimeout(address.clone()))??;

        Ok(RedisCache {
            connection,
            prefix: prefix.to_string(),
            default_ttl,
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(self.prefixed(key), value.as_ref(), ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection.get(self.prefixed(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(self.prefixed(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        // The connection manager closes its connection once the last clone
        // is dropped.
        Ok(())
    }
}

/// The configured cache backend.
pub enum CacheBackend {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl CacheBackend {
    /// Builds the configured backend. An unreachable redis server is not fatal,
    /// the in-process cache is used instead.
    pub async fn connect(config: &CacheConfig) -> Self {
        match config {
            CacheConfig::Memory {
                ttl_secs,
                cleanup_interval_secs,
                max_capacity,
            } => CacheBackend::Memory(MemoryCache::new(
                Duration::from_secs(*ttl_secs),
                Duration::from_secs(*cleanup_interval_secs),
                *max_capacity,
            )),
            CacheConfig::Redis {
                address,
                prefix,
                ttl_secs,
                connect_timeout_secs,
            } => {
                let ttl = Duration::from_secs(*ttl_secs);
                match RedisCache::connect(
                    address,
                    prefix,
                    ttl,
                    Duration::from_secs(*connect_timeout_secs),
                )
                .await
                {
                    Ok(cache) => {
                        tracing::info!(address, "connected to redis cache");
                        CacheBackend::Redis(cache)
                    }
                    Err(e) => {
                        tracing::warn!(
                            address,
                            error = %e,
                            "redis unavailable, falling back to memory cache"
                        );
                        CacheBackend::Memory(MemoryCache::new(
                            ttl,
                            Duration::from_secs(config::default_cleanup_interval_secs()),
                            config::default_max_capacity(),
                        ))
                    }
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CacheBackend::Memory(_) => "memory",
            CacheBackend::Redis(_) => "redis",
        }
    }
}

#[async_trait]
impl Cache for CacheBackend {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        match self {
            CacheBackend::Memory(c) => c.set(key, value, ttl).await,
            CacheBackend::Redis(c) => c.set(key, value, ttl).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        match self {
            CacheBackend::Memory(c) => c.get(key).await,
            CacheBackend::Redis(c) => c.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            CacheBackend::Memory(c) => c.delete(key).await,
            CacheBackend::Redis(c) => c.delete(key).await,
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        match self {
            CacheBackend::Memory(c) => c.ping().await,
            CacheBackend::Redis(c) => c.ping().await,
        }
    }

    async fn close(&self) -> Result<(), CacheError> {
        match self {
            CacheBackend::Memory(c) => c.close().await,
            CacheBackend::Redis(c) => c.close().await,
        }
    }
}

/// Repository decorator that serves latest-news reads from a cache.
///
/// Cache failures never surface to callers: a failed lookup falls through to
/// the inner repository and a failed store or invalidation is only logged.
pub struct CachedRepository {
    repository: Arc<dyn NewsRepository>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl CachedRepository {
    pub fn new(repository: Arc<dyn NewsRepository>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        CachedRepository {
            repository,
            cache,
            ttl,
        }
    }

    async fn lookup(&self, key: &str) -> Option<Vec<Item>> {
        let data = match self.cache.get(key).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache lookup failed");
                return None;
            }
        };

        match serde_json::from_slice(&data) {
            Ok(items) => Some(items),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }
}

#[async_trait]
impl NewsRepository for CachedRepository {
    async fn save_news(&self, items: &[Item]) -> Result<(), RepositoryError> {
        self.repository.save_news(items).await?;

        for limit in INVALIDATED_LIMITS {
            let key = news_cache_key(limit);
            if let Err(e) = self.cache.delete(&key).await {
                tracing::warn!(key, error = %e, "cache invalidation failed");
            }
        }

        Ok(())
    }

    async fn get_latest_news(&self, limit: usize) -> Result<Vec<Item>, RepositoryError> {
        let key = news_cache_key(limit);

        if let Some(items) = self.lookup(&key).await {
            counter!(CACHE_HIT).increment(1);
            return Ok(items);
        }
        counter!(CACHE_MISS).increment(1);

        let items = self.repository.get_latest_news(limit).await?;

        match serde_json::to_vec(&items) {
            Ok(data) => {
                if let Err(e) = self.cache.set(&key, Bytes::from(data), self.ttl).await {
                    tracing::warn!(key, error = %e, "failed to store news in cache");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to encode news for cache"),
        }

        Ok(items)
    }
}
