//! Redis cache provider.
//!
//! Keeps a fixed set of [`ConnectionManager`]s and hands them out round
//! robin. The first `min_idle_connections` slots are dialed on connect, the
//! rest on first use. A manager re-dials its socket after the connection
//! drops, and failed commands are retried with exponential backoff between
//! `min_retry_backoff` and `max_retry_backoff` so they land on the new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{FromRedisValue, RedisError, ToRedisArgs};
use tokio::sync::{OnceCell, RwLock};

use crate::config::CacheConfig;
use crate::storage::traits::{CacheDatabase, Database, Transaction};
use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError};

const ENGINE: EngineType = EngineType::Cache;

/// Delay before retry number `attempt` (zero-based).
fn retry_backoff(attempt: u32, min: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    min.saturating_mul(factor).min(max)
}

fn is_retryable(e: &RedisError) -> bool {
    e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Reconnect policy for one pooled connection.
fn manager_config(config: &CacheConfig) -> ConnectionManagerConfig {
    let retries = usize::try_from(config.max_retries).unwrap_or(usize::MAX);
    ConnectionManagerConfig::new()
        .set_exponent_base(2)
        .set_factor(millis(config.min_retry_backoff).max(1))
        .set_max_delay(millis(config.max_retry_backoff).max(1))
        .set_number_of_retries(retries)
        .set_response_timeout(config.read_timeout.max(config.write_timeout))
        .set_connection_timeout(config.dial_timeout)
}

/// A nil reply means the key, field or list element is absent.
fn present<T>(reply: Option<T>, what: &str) -> Result<T, StorageError> {
    reply.ok_or_else(|| StorageError::NotFound(what.to_string()))
}

/// Decode a `PTTL` reply: -2 is a missing key, -1 a key without expiry.
fn ttl_from_reply(key: &str, remaining: i64) -> Result<Option<Duration>, StorageError> {
    match remaining {
        -2 => Err(StorageError::NotFound(format!("cache key '{key}'"))),
        ms if ms < 0 => Ok(None),
        ms => Ok(Some(Duration::from_millis(ms.unsigned_abs()))),
    }
}

// =============================================================================
// Connection pool
// =============================================================================

struct ConnectionPool {
    client: redis::Client,
    config: CacheConfig,
    slots: Vec<OnceCell<ConnectionManager>>,
    next: AtomicUsize,
}

impl ConnectionPool {
    fn new(client: redis::Client, config: &CacheConfig) -> Self {
        let size = usize::try_from(config.pool_size).unwrap_or(1).max(1);
        Self {
            client,
            config: config.clone(),
            slots: (0..size).map(|_| OnceCell::new()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// The manager in slot `index`, dialed on first use. Later calls share
    /// it, including after it has re-dialed a dropped socket.
    async fn slot(&self, index: usize) -> Result<ConnectionManager, RedisError> {
        let conn = self.slots[index % self.slots.len()]
            .get_or_try_init(|| {
                ConnectionManager::new_with_config(
                    self.client.clone(),
                    manager_config(&self.config),
                )
            })
            .await?;
        Ok(conn.clone())
    }

    /// Next connection in round-robin order.
    async fn get(&self) -> Result<ConnectionManager, RedisError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.slot(index).await
    }

    fn dialed(&self) -> usize {
        self.slots.iter().filter(|slot| slot.initialized()).count()
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Redis provider.
pub struct RedisProvider {
    config: CacheConfig,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
}

impl std::fmt::Debug for RedisProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisProvider")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("db", &self.config.db)
            .finish_non_exhaustive()
    }
}

impl RedisProvider {
    /// Create a provider. Performs no I/O.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<Arc<ConnectionPool>, StorageError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(StorageError::NotConnected(ENGINE))
    }

    /// Run one command, retrying transport failures.
    async fn query<T>(&self, ctx: &Context, cmd: &redis::Cmd) -> Result<T, StorageError>
    where
        T: FromRedisValue + Send,
    {
        let pool = self.pool().await?;
        let ctx = ctx.or_timeout(self.config.pool_timeout);
        let mut attempt = 0;
        loop {
            let result = ctx
                .run(async {
                    let mut conn = pool.get().await?;
                    let value: T = cmd.query_async(&mut conn).await?;
                    Ok::<T, RedisError>(value)
                })
                .await;

            match result {
                Err(StorageError::Cache(e)) if attempt < self.config.max_retries && is_retryable(&e) => {
                    let backoff = retry_backoff(
                        attempt,
                        self.config.min_retry_backoff,
                        self.config.max_retry_backoff,
                    );
                    tracing::debug!(attempt, backoff = ?backoff, error = %e, "Retrying cache command");
                    ctx.run(async {
                        tokio::time::sleep(backoff).await;
                        Ok::<_, StorageError>(())
                    })
                    .await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run a command whose nil reply means "absent".
    async fn query_present<T>(&self, ctx: &Context, cmd: &redis::Cmd, what: &str) -> Result<T, StorageError>
    where
        T: FromRedisValue + Send,
    {
        present(self.query::<Option<T>>(ctx, cmd).await?, what)
    }

    /// Run a counting command over `items`; an empty list is answered
    /// locally once the connection check passed.
    async fn count<A: ToRedisArgs>(
        &self,
        ctx: &Context,
        name: &str,
        key: Option<&str>,
        items: A,
        empty: bool,
    ) -> Result<u64, StorageError> {
        self.pool().await?;
        if empty {
            return Ok(0);
        }
        let mut cmd = redis::cmd(name);
        if let Some(key) = key {
            cmd.arg(key);
        }
        cmd.arg(items);
        self.query(ctx, &cmd).await
    }
}

#[async_trait]
impl Database for RedisProvider {
    async fn connect(&self, ctx: &Context) -> Result<(), StorageError> {
        self.config.validate()?;
        if self.pool.read().await.is_some() {
            return Ok(());
        }

        let url = self.config.connection_url()?;
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StorageError::connection(ENGINE, e))?;
        let pool = ConnectionPool::new(client, &self.config);

        let ctx = ctx.or_timeout(self.config.dial_timeout);
        let eager = usize::try_from(self.config.min_idle_connections)
            .unwrap_or(1)
            .max(1);
        let verified = ctx
            .run(async {
                for index in 0..eager {
                    pool.slot(index).await?;
                }
                let mut conn = pool.slot(0).await?;
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, RedisError>(pong)
            })
            .await
            .map_err(|e| StorageError::connection(ENGINE, e))?;

        tracing::info!(
            engine = %ENGINE,
            host = %self.config.host,
            port = self.config.port,
            db = self.config.db,
            dialed = pool.dialed(),
            pool_size = self.config.pool_size,
            reply = %verified,
            "Connected"
        );
        *self.pool.write().await = Some(Arc::new(pool));
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.pool.write().await.take().is_some() {
            tracing::info!(engine = %ENGINE, "Connection pool closed");
        }
        Ok(())
    }

    async fn health(&self, ctx: &Context) -> Result<(), StorageError> {
        let _: String = self.query(ctx, &redis::cmd("PING")).await?;
        Ok(())
    }

    fn engine_type(&self) -> EngineType {
        ENGINE
    }

    async fn begin_tx(&self, ctx: &Context) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(self.begin_pipeline(ctx).await?))
    }
}

#[async_trait]
impl CacheDatabase for RedisProvider {
    async fn get(&self, ctx: &Context, key: &str) -> Result<String, StorageError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query_present(ctx, &cmd, &format!("cache key '{key}'")).await
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl).max(1));
        }
        let _: () = self.query(ctx, &cmd).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StorageError> {
        self.count(ctx, "DEL", None, keys, keys.is_empty()).await
    }

    async fn exists(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StorageError> {
        self.count(ctx, "EXISTS", None, keys, keys.is_empty()).await
    }

    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis(ttl).max(1));
        self.query(ctx, &cmd).await
    }

    async fn ttl(&self, ctx: &Context, key: &str) -> Result<Option<Duration>, StorageError> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let remaining: i64 = self.query(ctx, &cmd).await?;
        ttl_from_reply(key, remaining)
    }

    async fn hget(&self, ctx: &Context, key: &str, field: &str) -> Result<String, StorageError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query_present(ctx, &cmd, &format!("hash field '{key}.{field}'"))
            .await
    }

    async fn hset(
        &self,
        ctx: &Context,
        key: &str,
        fields: &[(&str, &str)],
    ) -> Result<u64, StorageError> {
        self.count(ctx, "HSET", Some(key), fields, fields.is_empty())
            .await
    }

    async fn hdel(&self, ctx: &Context, key: &str, fields: &[&str]) -> Result<u64, StorageError> {
        self.count(ctx, "HDEL", Some(key), fields, fields.is_empty())
            .await
    }

    async fn hgetall(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(ctx, &cmd).await
    }

    async fn lpush(&self, ctx: &Context, key: &str, values: &[&str]) -> Result<u64, StorageError> {
        if values.is_empty() {
            return self.llen(ctx, key).await;
        }
        self.count(ctx, "LPUSH", Some(key), values, false).await
    }

    async fn rpop(&self, ctx: &Context, key: &str) -> Result<String, StorageError> {
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(key);
        self.query_present(ctx, &cmd, &format!("list '{key}' is empty"))
            .await
    }

    async fn llen(&self, ctx: &Context, key: &str) -> Result<u64, StorageError> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.query(ctx, &cmd).await
    }

    async fn sadd(&self, ctx: &Context, key: &str, members: &[&str]) -> Result<u64, StorageError> {
        self.count(ctx, "SADD", Some(key), members, members.is_empty())
            .await
    }

    async fn smembers(&self, ctx: &Context, key: &str) -> Result<Vec<String>, StorageError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(ctx, &cmd).await
    }

    async fn srem(&self, ctx: &Context, key: &str, members: &[&str]) -> Result<u64, StorageError> {
        self.count(ctx, "SREM", Some(key), members, members.is_empty())
            .await
    }

    async fn begin_pipeline(&self, ctx: &Context) -> Result<CacheTransaction, StorageError> {
        let pool = self.pool().await?;
        Ok(CacheTransaction::new(
            pool,
            ctx.or_timeout(self.config.pool_timeout),
        ))
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Buffered `MULTI`/`EXEC` pipeline.
///
/// Commands are queued locally and nothing reaches the server before
/// [`Transaction::commit`], which sends the whole batch atomically.
/// [`Transaction::rollback`] discards the local queue. Redis does not undo
/// commands that fail at execution time inside `EXEC`; the guarantee is
/// all-or-nothing delivery of the batch, not rollback of its effects.
pub struct CacheTransaction {
    pool: Arc<ConnectionPool>,
    pipe: Option<redis::Pipeline>,
    queued: usize,
    ctx: Context,
}

impl std::fmt::Debug for CacheTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTransaction")
            .field("active", &self.pipe.is_some())
            .field("queued", &self.queued)
            .finish()
    }
}

impl CacheTransaction {
    fn new(pool: Arc<ConnectionPool>, ctx: Context) -> Self {
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self {
            pool,
            pipe: Some(pipe),
            queued: 0,
            ctx,
        }
    }

    /// Queue a raw command; its reply is discarded.
    pub fn queue(&mut self, cmd: redis::Cmd) -> Result<&mut Self, StorageError> {
        let pipe = self.pipe.as_mut().ok_or(StorageError::TransactionClosed)?;
        pipe.add_command(cmd).ignore();
        self.queued += 1;
        Ok(self)
    }

    pub fn set(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<&mut Self, StorageError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl).max(1));
        }
        self.queue(cmd)
    }

    pub fn delete(&mut self, keys: &[&str]) -> Result<&mut Self, StorageError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.queue(cmd)
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> Result<&mut Self, StorageError> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis(ttl).max(1));
        self.queue(cmd)
    }

    pub fn hset(&mut self, key: &str, fields: &[(&str, &str)]) -> Result<&mut Self, StorageError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(fields);
        self.queue(cmd)
    }

    pub fn lpush(&mut self, key: &str, values: &[&str]) -> Result<&mut Self, StorageError> {
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(values);
        self.queue(cmd)
    }

    pub fn sadd(&mut self, key: &str, members: &[&str]) -> Result<&mut Self, StorageError> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(members);
        self.queue(cmd)
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }
}

#[async_trait]
impl Transaction for CacheTransaction {
    fn engine_type(&self) -> EngineType {
        ENGINE
    }

    fn is_active(&self) -> bool {
        self.pipe.is_some()
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let pipe = self.pipe.take().ok_or(StorageError::TransactionClosed)?;
        if self.queued == 0 {
            return Ok(());
        }
        let pool = self.pool.clone();
        self.ctx
            .run(async move {
                let mut conn = pool.get().await?;
                let _: () = pipe.query_async(&mut conn).await?;
                Ok::<_, RedisError>(())
            })
            .await?;
        tracing::debug!(engine = %ENGINE, commands = self.queued, "Pipeline committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.pipe.take().ok_or(StorageError::TransactionClosed)?;
        tracing::debug!(engine = %ENGINE, discarded = self.queued, "Pipeline discarded");
        Ok(())
    }
}
