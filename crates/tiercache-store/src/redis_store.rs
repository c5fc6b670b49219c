//! Redis store backend.
//!
//! Commands go through a deadpool-redis pool. Pub/sub uses a dedicated client
//! connection per subscriber, since pooled connections cannot `SUBSCRIBE`.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use futures_util::StreamExt;
use redis::AsyncCommands;

use crate::config::RedisConfig;
use crate::traits::{ChannelMessage, DistributedStore, KeyTtl, Subscriber};
use crate::{StoreError, StoreResult};

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 500;

/// Keys per `DEL` command when deleting in bulk.
const DELETE_CHUNK: usize = 500;

/// Compare-and-delete used to release locks held under an owner token.
static DELETE_IF_EQUALS: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end",
    )
});

/// [`DistributedStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    url: String,
}

impl RedisStore {
    /// Wrap an existing pool. `url` is used to open pub/sub connections.
    pub fn new(pool: Pool, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
        }
    }

    /// Build a pool from `config` and verify the connection with `PING`.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        tracing::info!(url = %config.url, "Connecting to Redis");

        let timeout = Duration::from_millis(config.timeout_ms);
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let pool_config = redis_config
            .pool
            .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::pool(format!("failed to create Redis pool: {e}")))?;

        let store = Self::new(pool, config.url.clone());
        store.ping().await?;
        tracing::info!("Connected to Redis");
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish()
    }
}

/// Escape glob metacharacters so a literal prefix can be used with `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 4);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = DELETE_IF_EQUALS.key(key);
        invocation.arg(expected);
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let mut removed = 0u64;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let mut cmd = redis::cmd("DEL");
            for key in chunk {
                cmd.arg(key);
            }
            let count: u64 = cmd.query_async(&mut conn).await?;
            removed += count;
        }
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.conn().await?;
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_pttl(millis))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        tracing::trace!(channel = %channel, "published message (redis)");
        Ok(())
    }

    async fn subscriber(&self) -> StoreResult<Box<dyn Subscriber>> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StoreError::connection(format!("failed to create Redis client: {e}")))?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::connection(format!("failed to get pub/sub connection: {e}")))?;
        Ok(Box::new(RedisSubscriber { pubsub }))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Dedicated Redis pub/sub connection.
pub struct RedisSubscriber {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> StoreResult<()> {
        self.pubsub
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::subscribe(format!("failed to subscribe to {channel}: {e}")))
    }

    async fn next_message(&mut self) -> StoreResult<Option<ChannelMessage>> {
        let mut stream = self.pubsub.on_message();
        Ok(stream.next().await.map(|msg| ChannelMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        }))
    }
}
