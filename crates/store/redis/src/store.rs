use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use cordon_core::SyncError;
use cordon_store::pubsub::Subscription;
use cordon_store::store::{LeaseStatus, RateReply, SyncStore, WindowReply};

use crate::config::RedisConfig;
use crate::scripts;

/// Buffered messages per subscription before backpressure applies.
const SUBSCRIPTION_BUFFER: usize = 16;

struct Scripts {
    acquire: Script,
    release: Script,
    extend: Script,
    fixed_window: Script,
    gcra: Script,
    token_bucket: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            acquire: Script::new(scripts::LOCK_ACQUIRE),
            release: Script::new(scripts::LOCK_RELEASE),
            extend: Script::new(scripts::LOCK_EXTEND),
            fixed_window: Script::new(scripts::FIXED_WINDOW),
            gcra: Script::new(scripts::GCRA),
            token_bucket: Script::new(scripts::TOKEN_BUCKET),
        }
    }
}

/// Redis-backed implementation of [`SyncStore`].
///
/// Commands go through a `deadpool-redis` pool; each subscription gets a
/// dedicated connection, since a connection in subscriber mode cannot run
/// regular commands.
pub struct RedisSyncStore {
    pool: Pool,
    client: redis::Client,
    prefix: String,
    scripts: Scripts,
}

impl RedisSyncStore {
    /// Create a new `RedisSyncStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Connection`] if the pool or client cannot be
    /// created.
    pub fn new(config: &RedisConfig) -> Result<Self, SyncError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| SyncError::Connection(e.to_string()))?
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            client,
            prefix: config.prefix.clone(),
            scripts: Scripts::new(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, SyncError> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn lease_status(code: i64) -> LeaseStatus {
    match code {
        1 => LeaseStatus::Ok,
        -1 => LeaseStatus::Missing,
        _ => LeaseStatus::Mismatch,
    }
}

fn rate_reply(raw: (i64, i64, i64, i64)) -> RateReply {
    let (allowed, remaining, retry_in, reset_in) = raw;
    RateReply {
        allowed: allowed == 1,
        remaining: u64::try_from(remaining).unwrap_or(0),
        retry_in: Duration::from_millis(u64::try_from(retry_in).unwrap_or(0)),
        reset_in: Duration::from_millis(u64::try_from(reset_in).unwrap_or(0)),
    }
}

#[async_trait]
impl SyncStore for RedisSyncStore {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, SyncError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .scripts
            .acquire
            .key(self.full_key(key))
            .arg(token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(result == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<LeaseStatus, SyncError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .scripts
            .release
            .key(self.full_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(lease_status(result))
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LeaseStatus, SyncError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .scripts
            .extend
            .key(self.full_key(key))
            .arg(token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(lease_status(result))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let mut conn = self.conn().await?;
        conn.get(self.full_key(key))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), SyncError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(d) => redis::cmd("SET")
                .arg(self.full_key(key))
                .arg(value)
                .arg("PX")
                .arg(ttl_ms(d))
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| SyncError::Store(e.to_string())),
            None => conn
                .set(self.full_key(key), value)
                .await
                .map_err(|e| SyncError::Store(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, SyncError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, SyncError> {
        let mut conn = self.conn().await?;
        let ms: i64 = conn
            .pttl(self.full_key(key))
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        // -2 means no key, -1 means no expiry.
        if ms < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(u64::try_from(ms).unwrap_or(0))))
    }

    async fn now_ms(&self) -> Result<i64, SyncError> {
        let mut conn = self.conn().await?;
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        n: u64,
    ) -> Result<WindowReply, SyncError> {
        let mut conn = self.conn().await?;
        let (allowed, remaining, retry_at_ms, reset_at_ms): (i64, i64, i64, i64) = self
            .scripts
            .fixed_window
            .key(self.full_key(key))
            .arg(limit)
            .arg(ttl_ms(period))
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(WindowReply {
            allowed: allowed == 1,
            remaining: u64::try_from(remaining).unwrap_or(0),
            retry_at_ms,
            reset_at_ms,
        })
    }

    async fn gcra(
        &self,
        key: &str,
        burst: u64,
        limit: u64,
        period: Duration,
        n: u64,
    ) -> Result<RateReply, SyncError> {
        let mut conn = self.conn().await?;
        let raw: (i64, i64, i64, i64) = self
            .scripts
            .gcra
            .key(self.full_key(key))
            .arg(burst)
            .arg(limit)
            .arg(ttl_ms(period))
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(rate_reply(raw))
    }

    async fn token_bucket(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        burst: u64,
        now_ms: i64,
        n: u64,
    ) -> Result<RateReply, SyncError> {
        let mut conn = self.conn().await?;
        let raw: (i64, i64, i64, i64) = self
            .scripts
            .token_bucket
            .key(self.full_key(key))
            .arg(limit)
            .arg(ttl_ms(period))
            .arg(burst)
            .arg(now_ms)
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(rate_reply(raw))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SyncError> {
        let mut conn = self.conn().await?;
        let _receivers: i64 = conn
            .publish(self.full_key(channel), payload)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, SyncError> {
        let full_channel = self.full_key(channel);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        pubsub
            .subscribe(&full_channel)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(channel = %full_channel, "pub/sub forwarder stopped");
        });

        Ok(Box::new(RedisSubscription { receiver: rx, task }))
    }
}

/// Forwards messages from a dedicated pub/sub connection. Dropping the
/// subscription aborts the forwarder and closes the connection.
struct RedisSubscription {
    receiver: mpsc::Receiver<String>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}


#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            prefix: format!("cordon-test-{}", uuid::Uuid::new_v4()),
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn conformance() {
        let config = test_config();
        let store = RedisSyncStore::new(&config).expect("pool creation should succeed");
        cordon_store::testing::run_conformance_tests(&store)
            .await
            .expect("conformance suite should pass");
    }
}
