//! Distributed Enforcement Cache
//!
//! Short-lived enforcement state shared by every process that answers "is
//! this request allowed": bans, sliding-window counters, WAF auto-ban
//! counters, compiled-policy copies, a token blacklist and advisory locks.
//!
//! Every implementation is fail-open. When the backing store is not ready,
//! operations return [`CacheError::NotReady`] and callers treat that as "no
//! additional restriction from this layer" (see [`FailOpen`]).

pub mod memory_cache;
pub mod redis_cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::policy::{BanScope, BannedIpEntry};

pub use memory_cache::MemoryEnforcementCache;
pub use redis_cache::RedisEnforcementCache;

/// Namespace prepended to every cache key unless configured otherwise
pub const DEFAULT_KEY_PREFIX: &str = "aegis";

/// Key marking `token_id` as revoked. Compiled challenge stages read it
/// directly, so the layout is shared with the proxy side.
pub fn token_blacklist_key(prefix: &str, token_id: &str) -> String {
    format!("{}:token:blacklist:{}", prefix, token_id)
}

/// Errors returned by enforcement cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Store unreachable; callers fail open
    #[error("enforcement cache is not ready")]
    NotReady,

    /// A resync applied only part of its batches. Safe to re-run.
    #[error("ban resync partially applied ({applied}/{total} entries): {reason}")]
    PartialSync {
        applied: usize,
        total: usize,
        reason: String,
    },

    #[error("enforcement cache backend error: {0}")]
    Backend(String),
}

/// Outcome of one sliding-window check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Pre-insertion count was below the limit
    pub allowed: bool,
    /// Requests in the window including this one
    pub current_count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Unix millis at which the oldest counted request leaves the window
    pub reset_at_ms: u64,
}

impl RateLimitResult {
    pub(crate) fn from_window(pre_count: u64, limit: u64, oldest_ms: Option<u64>, now_ms: u64, window: Duration) -> Self {
        let current_count = pre_count + 1;
        let window_ms = window.as_millis() as u64;
        Self {
            allowed: pre_count < limit,
            current_count,
            limit,
            remaining: limit.saturating_sub(current_count),
            reset_at_ms: oldest_ms.unwrap_or(now_ms) + window_ms,
        }
    }
}

/// Progress of a full ban resync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entries received from the system of record
    pub total: usize,
    /// Entries written to the cache
    pub applied: usize,
    /// Entries dropped because they had already expired
    pub skipped_expired: usize,
}

/// Shared runtime enforcement state
#[async_trait]
pub trait EnforcementCache: Send + Sync {
    /// Whether the backing store is currently reachable
    fn is_ready(&self) -> bool;

    /// True if `ip` is globally banned or, for a host scope, banned on that
    /// host. The global set is checked first and is absolute.
    async fn is_banned(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError>;

    /// Ban `ip`. A zero TTL is permanent and records no expiry marker.
    async fn ban(&self, ip: &str, scope: &BanScope, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a ban and its expiry marker; returns whether one existed
    async fn unban(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError>;

    /// Sliding-window check-and-record for `key`
    async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult, CacheError>;

    /// Record one WAF event for `ip` on `host_id`; returns the in-window count
    async fn record_auto_ban_event(&self, ip: &str, host_id: &str, window: Duration) -> Result<u64, CacheError>;

    /// Set-if-absent. Contention is `Ok(false)`, never an error.
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Compare-and-delete; a non-holder's release is a no-op returning false
    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, CacheError>;

    /// Compare-and-extend; a non-holder's extend is a no-op returning false
    async fn extend_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Replace every ban with `entries`, recomputing TTLs from `expires_at`
    async fn sync_banned_ips(&self, entries: &[BannedIpEntry]) -> Result<SyncReport, CacheError>;

    async fn get_policy(&self, host_id: &str) -> Result<Option<String>, CacheError>;

    async fn put_policy(&self, host_id: &str, artifact: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn invalidate_policy(&self, host_id: &str) -> Result<(), CacheError>;

    /// Blacklist a token for its remaining lifetime; zero is a no-op
    async fn blacklist_token(&self, token_id: &str, remaining: Duration) -> Result<(), CacheError>;

    async fn is_token_blacklisted(&self, token_id: &str) -> Result<bool, CacheError>;
}

/// Fail-open resolution of cache results on the request path
pub trait FailOpen<T> {
    /// Return the value, or `fallback` when the cache is unavailable or erroring
    fn or_fail_open(self, fallback: T, operation: &str) -> T;
}

impl<T> FailOpen<T> for Result<T, CacheError> {
    fn or_fail_open(self, fallback: T, operation: &str) -> T {
        match self {
            Ok(value) => value,
            Err(CacheError::NotReady) => {
                debug!(operation, "Enforcement cache not ready, failing open");
                fallback
            }
            Err(e) => {
                warn!(operation, error = %e, "Enforcement cache error, failing open");
                fallback
            }
        }
    }
}

/// Current Unix time in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
