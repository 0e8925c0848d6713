//! Redis/DragonflyDB enforcement cache.
//!
//! Key families (all under the configured prefix):
//! - `bans:global` SET + `bans:global:expiry` HASH (ip -> unix ms)
//! - `bans:host:{id}` SET + `bans:host:{id}:expiry` HASH
//! - `rl:{key}` ZSET, score = request time in ms
//! - `autoban:{host}:{ip}` ZSET, same technique
//! - `policy:{host}` STRING with TTL
//! - `token:blacklist:{id}` STRING with TTL
//! - `lock:{key}` STRING holding the holder token, PX TTL
//!
//! Check-then-act operations run as Lua scripts so they are atomic on the
//! server.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, RedisResult, Script};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{now_ms, token_blacklist_key, CacheError, EnforcementCache, RateLimitResult, SyncReport};
use crate::config::{redact_url, CacheConfig};
use crate::policy::{BanScope, BannedIpEntry};

/// Entries per pipelined resync batch
const SYNC_BATCH_SIZE: usize = 500;

/// Extra key lifetime beyond the window, so a window never expires early
const WINDOW_TTL_SLACK_MS: u64 = 1_000;

static IS_BANNED_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local ip = ARGV[1]
local now = tonumber(ARGV[2])
for i = 1, #KEYS, 2 do
  if redis.call('SISMEMBER', KEYS[i], ip) == 1 then
    local expires = redis.call('HGET', KEYS[i + 1], ip)
    if expires and tonumber(expires) <= now then
      redis.call('SREM', KEYS[i], ip)
      redis.call('HDEL', KEYS[i + 1], ip)
    else
      return 1
    end
  end
end
return 0
",
    )
});

static SLIDING_WINDOW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
redis.call('ZADD', key, now, ARGV[3])
redis.call('PEXPIRE', key, window + tonumber(ARGV[4]))
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {count, tonumber(oldest[2])}
",
    )
});

static RELEASE_LOCK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

static EXTEND_LOCK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
",
    )
});

/// Key naming under one prefix
#[derive(Debug, Clone)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn ban_set(&self, scope: &BanScope) -> String {
        match scope {
            BanScope::Global => format!("{}:bans:global", self.prefix),
            BanScope::Host(host) => format!("{}:bans:host:{}", self.prefix, host),
        }
    }

    fn ban_expiry(&self, scope: &BanScope) -> String {
        format!("{}:expiry", self.ban_set(scope))
    }

    fn ban_pattern(&self) -> String {
        format!("{}:bans:*", self.prefix)
    }

    fn rate_window(&self, key: &str) -> String {
        format!("{}:rl:{}", self.prefix, key)
    }

    fn auto_ban(&self, host_id: &str, ip: &str) -> String {
        format!("{}:autoban:{}:{}", self.prefix, host_id, ip)
    }

    fn policy(&self, host_id: &str) -> String {
        format!("{}:policy:{}", self.prefix, host_id)
    }

    fn token(&self, token_id: &str) -> String {
        token_blacklist_key(&self.prefix, token_id)
    }

    fn lock(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }
}

fn window_member(now: u64) -> String {
    let nonce: u64 = rand::thread_rng().gen();
    format!("{}-{:016x}", now, nonce)
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Enforcement cache backed by Redis or DragonflyDB
pub struct RedisEnforcementCache {
    client: Client,
    connection: RwLock<Option<ConnectionManager>>,
    ready: AtomicBool,
    keys: KeySpace,
    op_timeout: Duration,
    redacted_url: String,
}

impl RedisEnforcementCache {
    /// Connect with bounded retries and linear backoff.
    ///
    /// Only an unparsable URL is an error. An unreachable store yields a
    /// cache that reports not-ready until [`reconnect`](Self::reconnect)
    /// succeeds.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| CacheError::Backend(format!("invalid cache URL: {}", e)))?;

        let cache = Self {
            client,
            connection: RwLock::new(None),
            ready: AtomicBool::new(false),
            keys: KeySpace {
                prefix: config.key_prefix.clone(),
            },
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            redacted_url: redact_url(&config.url),
        };

        let attempts = config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match cache.try_connect().await {
                Ok(()) => {
                    info!(url = %cache.redacted_url, attempt, "Connected to enforcement cache");
                    return Ok(cache);
                }
                Err(reason) => {
                    warn!(
                        url = %cache.redacted_url,
                        attempt,
                        attempts,
                        %reason,
                        "Enforcement cache connection attempt failed"
                    );
                    if attempt < attempts {
                        let backoff = Duration::from_millis(config.backoff_ms * u64::from(attempt));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        warn!(
            url = %cache.redacted_url,
            "Enforcement cache unreachable; failing open until a reconnect succeeds"
        );
        Ok(cache)
    }

    async fn try_connect(&self) -> Result<(), String> {
        let client = self.client.clone();
        let connect = async move {
            let mut manager = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut manager).await?;
            Ok::<_, RedisError>(manager)
        };

        match tokio::time::timeout(self.op_timeout, connect).await {
            Ok(Ok(manager)) => {
                *self.connection.write().await = Some(manager);
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.op_timeout)),
        }
    }

    /// Try to re-establish the connection; returns the resulting readiness
    pub async fn reconnect(&self) -> bool {
        if self.is_ready() && self.probe().await {
            return true;
        }
        match self.try_connect().await {
            Ok(()) => {
                info!(url = %self.redacted_url, "Enforcement cache reachable again");
                true
            }
            Err(reason) => {
                debug!(url = %self.redacted_url, %reason, "Enforcement cache reconnect failed");
                false
            }
        }
    }

    /// PING the store, marking the cache not-ready on failure
    pub async fn probe(&self) -> bool {
        let result: Result<String, CacheError> = self
            .run("probe", |mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await;
        result.is_ok()
    }

    /// Background task that reconnects while the store is unreachable
    pub fn spawn_reconnect_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !self.is_ready() {
                    self.reconnect().await;
                }
            }
        })
    }

    fn mark_not_ready(&self, operation: &str, reason: &str) {
        if self.ready.swap(false, Ordering::SeqCst) {
            warn!(
                url = %self.redacted_url,
                operation,
                reason,
                "Enforcement cache became unavailable; failing open"
            );
        }
    }

    fn classify(&self, operation: &str, err: RedisError) -> CacheError {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            self.mark_not_ready(operation, &err.to_string());
            CacheError::NotReady
        } else {
            CacheError::Backend(format!("{}: {}", operation, err))
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        if !self.is_ready() {
            return Err(CacheError::NotReady);
        }
        self.connection.read().await.clone().ok_or(CacheError::NotReady)
    }

    /// Run one operation with readiness check, deadline and error mapping
    async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.classify(operation, e)),
            Err(_) => {
                self.mark_not_ready(operation, "operation timed out");
                Err(CacheError::NotReady)
            }
        }
    }

    async fn slide(&self, operation: &'static str, key: String, window: Duration) -> Result<(u64, u64, u64), CacheError> {
        let now = now_ms();
        let window_ms = millis(window);
        let (count, oldest): (u64, u64) = self
            .run(operation, |mut conn| async move {
                SLIDING_WINDOW_SCRIPT
                    .key(&key)
                    .arg(now)
                    .arg(window_ms)
                    .arg(window_member(now))
                    .arg(WINDOW_TTL_SLACK_MS)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok((count, oldest, now))
    }

    /// Delete every ban key (SCAN + DEL), returning how many were removed
    async fn clear_bans(&self) -> Result<usize, CacheError> {
        let mut conn = self.connection().await?;
        let pattern = self.keys.ban_pattern();
        let mut cursor = 0u64;
        let mut removed = 0usize;

        loop {
            let mut scan = redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SYNC_BATCH_SIZE);
            let page = scan.query_async::<_, (u64, Vec<String>)>(&mut conn);
            let (next_cursor, keys) = match tokio::time::timeout(self.op_timeout, page).await {
                Ok(result) => result.map_err(|e| self.classify("sync_banned_ips", e))?,
                Err(_) => {
                    self.mark_not_ready("sync_banned_ips", "scan timed out");
                    return Err(CacheError::NotReady);
                }
            };

            if !keys.is_empty() {
                let deleted: usize = self
                    .run("sync_banned_ips", |mut conn| async move { conn.del(keys).await })
                    .await?;
                removed += deleted;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl EnforcementCache for RedisEnforcementCache {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn is_banned(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError> {
        let mut invocation = IS_BANNED_SCRIPT.prepare_invoke();
        invocation
            .key(self.keys.ban_set(&BanScope::Global))
            .key(self.keys.ban_expiry(&BanScope::Global));
        if let BanScope::Host(_) = scope {
            invocation.key(self.keys.ban_set(scope)).key(self.keys.ban_expiry(scope));
        }
        invocation.arg(ip).arg(now_ms());

        let banned: i64 = self
            .run("is_banned", |mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(banned == 1)
    }

    async fn ban(&self, ip: &str, scope: &BanScope, ttl: Duration) -> Result<(), CacheError> {
        let set = self.keys.ban_set(scope);
        let expiry = self.keys.ban_expiry(scope);
        let mut pipe = redis::pipe();
        pipe.atomic().sadd(&set, ip).ignore();
        if ttl.is_zero() {
            pipe.hdel(&expiry, ip).ignore();
        } else {
            pipe.hset(&expiry, ip, now_ms() + millis(ttl)).ignore();
        }

        self.run("ban", |mut conn| async move { pipe.query_async::<_, ()>(&mut conn).await })
            .await?;
        debug!(ip, scope = %scope, ttl_secs = ttl.as_secs(), "Ban written to enforcement cache");
        Ok(())
    }

    async fn unban(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError> {
        let set = self.keys.ban_set(scope);
        let expiry = self.keys.ban_expiry(scope);
        let mut pipe = redis::pipe();
        pipe.atomic().srem(&set, ip).hdel(&expiry, ip).ignore();

        let (removed,): (i64,) = self
            .run("unban", |mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult, CacheError> {
        let (count, oldest, now) = self
            .slide("check_rate_limit", self.keys.rate_window(key), window)
            .await?;
        Ok(RateLimitResult::from_window(count, limit, Some(oldest), now, window))
    }

    async fn record_auto_ban_event(&self, ip: &str, host_id: &str, window: Duration) -> Result<u64, CacheError> {
        let (count, _, _) = self
            .slide("record_auto_ban_event", self.keys.auto_ban(host_id, ip), window)
            .await?;
        Ok(count + 1)
    }

    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, CacheError> {
        let lock_key = self.keys.lock(key);
        let ttl_ms = millis(ttl).max(1);
        let reply: Option<String> = self
            .run("acquire_lock", |mut conn| async move {
                redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(holder)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, CacheError> {
        let lock_key = self.keys.lock(key);
        let released: i64 = self
            .run("release_lock", |mut conn| async move {
                RELEASE_LOCK_SCRIPT.key(&lock_key).arg(holder).invoke_async(&mut conn).await
            })
            .await?;
        Ok(released == 1)
    }

    async fn extend_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, CacheError> {
        let lock_key = self.keys.lock(key);
        let ttl_ms = millis(ttl).max(1);
        let extended: i64 = self
            .run("extend_lock", |mut conn| async move {
                EXTEND_LOCK_SCRIPT
                    .key(&lock_key)
                    .arg(holder)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(extended == 1)
    }

    async fn sync_banned_ips(&self, entries: &[BannedIpEntry]) -> Result<SyncReport, CacheError> {
        let removed = self.clear_bans().await?;
        debug!(removed, "Cleared ban keys before resync");

        let now = chrono::Utc::now();
        let now_millis = now_ms();
        let mut report = SyncReport {
            total: entries.len(),
            ..Default::default()
        };

        let live: Vec<(&BannedIpEntry, Option<u64>)> = entries
            .iter()
            .filter_map(|entry| match entry.remaining_ttl_at(now) {
                Some(remaining) if remaining.is_zero() => None,
                Some(remaining) => Some((entry, Some(now_millis + millis(remaining)))),
                None => Some((entry, None)),
            })
            .collect();
        report.skipped_expired = entries.len() - live.len();

        for batch in live.chunks(SYNC_BATCH_SIZE) {
            let mut pipe = redis::pipe();
            for (entry, expires) in batch {
                pipe.sadd(self.keys.ban_set(&entry.scope), &entry.ip).ignore();
                if let Some(expires) = expires {
                    pipe.hset(self.keys.ban_expiry(&entry.scope), &entry.ip, *expires).ignore();
                }
            }

            let result = self
                .run("sync_banned_ips", |mut conn| async move { pipe.query_async::<_, ()>(&mut conn).await })
                .await;
            if let Err(e) = result {
                error!(
                    applied = report.applied,
                    total = report.total,
                    error = %e,
                    "Ban resync partially applied"
                );
                return Err(CacheError::PartialSync {
                    applied: report.applied,
                    total: report.total,
                    reason: e.to_string(),
                });
            }
            report.applied += batch.len();
        }

        info!(
            applied = report.applied,
            skipped_expired = report.skipped_expired,
            "Banned IPs resynced to enforcement cache"
        );
        Ok(report)
    }

    async fn get_policy(&self, host_id: &str) -> Result<Option<String>, CacheError> {
        let key = self.keys.policy(host_id);
        self.run("get_policy", |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn put_policy(&self, host_id: &str, artifact: &str, ttl: Duration) -> Result<(), CacheError> {
        let key = self.keys.policy(host_id);
        let ttl_secs = ttl.as_secs().max(1);
        self.run("put_policy", |mut conn| async move {
            conn.set_ex::<_, _, ()>(key, artifact, ttl_secs).await
        })
        .await
    }

    async fn invalidate_policy(&self, host_id: &str) -> Result<(), CacheError> {
        let key = self.keys.policy(host_id);
        self.run("invalidate_policy", |mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn blacklist_token(&self, token_id: &str, remaining: Duration) -> Result<(), CacheError> {
        if !self.is_ready() {
            return Err(CacheError::NotReady);
        }
        let ttl_ms = millis(remaining);
        if ttl_ms == 0 {
            return Ok(());
        }
        let key = self.keys.token(token_id);
        self.run("blacklist_token", |mut conn| async move {
            redis::cmd("SET")
                .arg(&key)
                .arg(1)
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn is_token_blacklisted(&self, token_id: &str) -> Result<bool, CacheError> {
        let key = self.keys.token(token_id);
        self.run("is_token_blacklisted", |mut conn| async move { conn.exists(key).await })
            .await
    }
}
