//! In-process enforcement cache.
//!
//! Same semantics as the Redis implementation, for tests and single-node
//! deployments. A readiness switch simulates a store outage.
//!
//! Expired entries are dropped when their key is read and by a sweep that
//! runs every [`DEFAULT_SWEEP_EVERY`] operations, so keys that are never
//! touched again do not accumulate.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{now_ms, CacheError, EnforcementCache, RateLimitResult, SyncReport};
use crate::lock_utils::lock_or_recover;
use crate::policy::{BanScope, BannedIpEntry};

/// Operations between two sweeps of expired state
pub const DEFAULT_SWEEP_EVERY: u64 = 1024;

/// Ban set: ip -> expiry marker (unix ms), `None` for permanent
type BanSet = HashMap<String, Option<u64>>;

/// Sliding window: request timestamps (unix ms), oldest first
#[derive(Default)]
struct Window {
    window_ms: u64,
    entries: VecDeque<u64>,
}

impl Window {
    /// Every entry has left the window
    fn is_stale(&self, now: u64) -> bool {
        self.entries
            .back()
            .map_or(true, |newest| *newest <= now.saturating_sub(self.window_ms))
    }
}

#[derive(Default)]
struct MemoryState {
    global_bans: BanSet,
    host_bans: HashMap<String, BanSet>,
    windows: HashMap<String, Window>,
    /// key -> (holder, expires_at_ms)
    locks: HashMap<String, (String, u64)>,
    /// host -> (artifact, expires_at_ms)
    policies: HashMap<String, (String, u64)>,
    /// token -> expires_at_ms
    tokens: HashMap<String, u64>,
    ops_since_sweep: u64,
}

impl MemoryState {
    fn ban_set(&mut self, scope: &BanScope) -> &mut BanSet {
        match scope {
            BanScope::Global => &mut self.global_bans,
            BanScope::Host(host) => self.host_bans.entry(host.clone()).or_default(),
        }
    }

    /// Membership with lazy removal of expired entries
    fn check_ban(set: &mut BanSet, ip: &str, now: u64) -> bool {
        match set.get(ip) {
            Some(Some(expires)) if *expires <= now => {
                set.remove(ip);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Trim, count, insert. Returns (pre-insertion count, oldest remaining).
    fn slide(&mut self, key: &str, now: u64, window: Duration) -> (u64, Option<u64>) {
        let window_ms = window.as_millis() as u64;
        let slot = self.windows.entry(key.to_string()).or_default();
        slot.window_ms = window_ms;
        let cutoff = now.saturating_sub(window_ms);
        while slot.entries.front().map_or(false, |ts| *ts <= cutoff) {
            slot.entries.pop_front();
        }
        let count = slot.entries.len() as u64;
        slot.entries.push_back(now);
        (count, slot.entries.front().copied())
    }

    /// Drop every expired ban, window, lock, policy copy and token.
    /// Returns the number of keys removed.
    fn sweep(&mut self, now: u64) -> usize {
        let before = self.key_count();
        let live = |expires: &Option<u64>| expires.map_or(true, |t| t > now);

        self.global_bans.retain(|_, expires| live(expires));
        for set in self.host_bans.values_mut() {
            set.retain(|_, expires| live(expires));
        }
        self.host_bans.retain(|_, set| !set.is_empty());
        self.windows.retain(|_, window| !window.is_stale(now));
        self.locks.retain(|_, (_, expires)| *expires > now);
        self.policies.retain(|_, (_, expires)| *expires > now);
        self.tokens.retain(|_, expires| *expires > now);

        before - self.key_count()
    }

    fn key_count(&self) -> usize {
        self.global_bans.len()
            + self.host_bans.values().map(HashMap::len).sum::<usize>()
            + self.windows.len()
            + self.locks.len()
            + self.policies.len()
            + self.tokens.len()
    }
}

/// Enforcement cache held entirely in process memory
pub struct MemoryEnforcementCache {
    state: Mutex<MemoryState>,
    ready: AtomicBool,
    sweep_every: u64,
}

impl Default for MemoryEnforcementCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnforcementCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ready: AtomicBool::new(true),
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }

    /// Sweep expired state every `ops` operations
    pub fn with_sweep_every(mut self, ops: u64) -> Self {
        self.sweep_every = ops.max(1);
        self
    }

    /// Drop all expired state now; returns the number of keys removed
    pub fn sweep_expired(&self) -> usize {
        let mut state = lock_or_recover(&self.state, "memory cache");
        state.ops_since_sweep = 0;
        state.sweep(now_ms())
    }

    /// Keys currently held, expired or not
    pub fn key_count(&self) -> usize {
        lock_or_recover(&self.state, "memory cache").key_count()
    }

    /// Lock the state, sweeping first when the operation budget is spent
    fn locked(&self) -> MutexGuard<'_, MemoryState> {
        let mut state = lock_or_recover(&self.state, "memory cache");
        state.ops_since_sweep += 1;
        if state.ops_since_sweep >= self.sweep_every {
            state.ops_since_sweep = 0;
            let removed = state.sweep(now_ms());
            if removed > 0 {
                debug!(removed, "Swept expired enforcement state");
            }
        }
        state
    }

    /// Toggle readiness to simulate the store going away and coming back
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn ensure_ready(&self) -> Result<(), CacheError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::NotReady)
        }
    }
}

#[async_trait]
impl EnforcementCache for MemoryEnforcementCache {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn is_banned(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let mut state = self.locked();

        if MemoryState::check_ban(&mut state.global_bans, ip, now) {
            return Ok(true);
        }
        match scope {
            BanScope::Global => Ok(false),
            BanScope::Host(host) => Ok(state
                .host_bans
                .get_mut(host)
                .map_or(false, |set| MemoryState::check_ban(set, ip, now))),
        }
    }

    async fn ban(&self, ip: &str, scope: &BanScope, ttl: Duration) -> Result<(), CacheError> {
        self.ensure_ready()?;
        let expires = if ttl.is_zero() {
            None
        } else {
            Some(now_ms() + ttl.as_millis() as u64)
        };
        let mut state = self.locked();
        state.ban_set(scope).insert(ip.to_string(), expires);
        Ok(())
    }

    async fn unban(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let mut state = self.locked();
        let existed = state.ban_set(scope).remove(ip).is_some();
        if let BanScope::Host(host) = scope {
            if state.host_bans.get(host).map_or(false, HashMap::is_empty) {
                state.host_bans.remove(host);
            }
        }
        Ok(existed)
    }

    async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let (count, oldest) = {
            let mut state = self.locked();
            state.slide(&format!("rl:{}", key), now, window)
        };
        Ok(RateLimitResult::from_window(count, limit, oldest, now, window))
    }

    async fn record_auto_ban_event(&self, ip: &str, host_id: &str, window: Duration) -> Result<u64, CacheError> {
        self.ensure_ready()?;
        let mut state = self.locked();
        let (count, _) = state.slide(&format!("autoban:{}:{}", host_id, ip), now_ms(), window);
        Ok(count + 1)
    }

    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let mut state = self.locked();
        match state.locks.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                state
                    .locks
                    .insert(key.to_string(), (holder.to_string(), now + ttl.as_millis() as u64));
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let mut state = self.locked();
        match state.locks.get(key) {
            Some((current, expires)) if current == holder && *expires > now => {
                state.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let mut state = self.locked();
        match state.locks.get_mut(key) {
            Some((current, expires)) if current == holder && *expires > now => {
                *expires = now + ttl.as_millis() as u64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sync_banned_ips(&self, entries: &[BannedIpEntry]) -> Result<SyncReport, CacheError> {
        self.ensure_ready()?;
        let now = chrono::Utc::now();
        let now_millis = now_ms();
        let mut report = SyncReport {
            total: entries.len(),
            ..Default::default()
        };

        let mut state = self.locked();
        state.global_bans.clear();
        state.host_bans.clear();

        for entry in entries {
            let expires = match entry.remaining_ttl_at(now) {
                Some(remaining) if remaining.is_zero() => {
                    report.skipped_expired += 1;
                    continue;
                }
                Some(remaining) => Some(now_millis + remaining.as_millis() as u64),
                None => None,
            };
            state.ban_set(&entry.scope).insert(entry.ip.clone(), expires);
            report.applied += 1;
        }

        Ok(report)
    }

    async fn get_policy(&self, host_id: &str) -> Result<Option<String>, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let mut state = self.locked();
        match state.policies.get(host_id) {
            Some((artifact, expires)) if *expires > now => Ok(Some(artifact.clone())),
            Some(_) => {
                state.policies.remove(host_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put_policy(&self, host_id: &str, artifact: &str, ttl: Duration) -> Result<(), CacheError> {
        self.ensure_ready()?;
        let expires = now_ms() + ttl.as_millis() as u64;
        let mut state = self.locked();
        state
            .policies
            .insert(host_id.to_string(), (artifact.to_string(), expires));
        Ok(())
    }

    async fn invalidate_policy(&self, host_id: &str) -> Result<(), CacheError> {
        self.ensure_ready()?;
        let mut state = self.locked();
        state.policies.remove(host_id);
        Ok(())
    }

    async fn blacklist_token(&self, token_id: &str, remaining: Duration) -> Result<(), CacheError> {
        self.ensure_ready()?;
        if remaining.is_zero() {
            return Ok(());
        }
        let expires = now_ms() + remaining.as_millis() as u64;
        let mut state = self.locked();
        state.tokens.insert(token_id.to_string(), expires);
        Ok(())
    }

    async fn is_token_blacklisted(&self, token_id: &str) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let now = now_ms();
        let mut state = self.locked();
        match state.tokens.get(token_id) {
            Some(expires) if *expires > now => Ok(true),
            Some(_) => {
                state.tokens.remove(token_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_global_ban_is_absolute() {
        let cache = MemoryEnforcementCache::new();
        let host = BanScope::Host("1".into());

        cache.ban("1.2.3.4", &BanScope::Global, Duration::ZERO).await.unwrap();
        assert!(cache.is_banned("1.2.3.4", &host).await.unwrap());
        assert!(cache.is_banned("1.2.3.4", &BanScope::Global).await.unwrap());

        cache.ban("5.6.7.8", &host, Duration::ZERO).await.unwrap();
        assert!(cache.is_banned("5.6.7.8", &host).await.unwrap());
        assert!(!cache.is_banned("5.6.7.8", &BanScope::Global).await.unwrap());
        assert!(!cache.is_banned("5.6.7.8", &BanScope::Host("2".into())).await.unwrap());
    }

    #[tokio::test]
    async fn test_unban() {
        let cache = MemoryEnforcementCache::new();
        cache.ban("1.2.3.4", &BanScope::Global, Duration::from_secs(60)).await.unwrap();
        assert!(cache.unban("1.2.3.4", &BanScope::Global).await.unwrap());
        assert!(!cache.unban("1.2.3.4", &BanScope::Global).await.unwrap());
        assert!(!cache.is_banned("1.2.3.4", &BanScope::Global).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_ready_signals() {
        let cache = MemoryEnforcementCache::new();
        cache.set_ready(false);
        assert!(!cache.is_ready());
        assert!(matches!(
            cache.is_banned("1.2.3.4", &BanScope::Global).await,
            Err(CacheError::NotReady)
        ));
        cache.set_ready(true);
        assert!(!cache.is_banned("1.2.3.4", &BanScope::Global).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_replaces_bans_and_skips_expired() {
        let cache = MemoryEnforcementCache::new();
        cache.ban("9.9.9.9", &BanScope::Global, Duration::ZERO).await.unwrap();

        let mut expired = BannedIpEntry::new("2.2.2.2", BanScope::Global, "old", Duration::from_secs(1));
        expired.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(10));
        let entries = vec![
            BannedIpEntry::new("1.1.1.1", BanScope::Global, "manual", Duration::ZERO),
            BannedIpEntry::new("3.3.3.3", BanScope::Host("4".into()), "f2b", Duration::from_secs(60)),
            expired,
        ];

        let report = cache.sync_banned_ips(&entries).await.unwrap();
        assert_eq!(report, SyncReport { total: 3, applied: 2, skipped_expired: 1 });
        assert!(!cache.is_banned("9.9.9.9", &BanScope::Global).await.unwrap());
        assert!(cache.is_banned("1.1.1.1", &BanScope::Global).await.unwrap());
        assert!(cache.is_banned("3.3.3.3", &BanScope::Host("4".into())).await.unwrap());
        assert!(!cache.is_banned("2.2.2.2", &BanScope::Global).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_ban_counter() {
        let cache = MemoryEnforcementCache::new();
        for expected in 1..=3 {
            let count = cache
                .record_auto_ban_event("1.2.3.4", "h1", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
        let other = cache
            .record_auto_ban_event("1.2.3.4", "h2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_keys_never_touched_again() {
        let cache = MemoryEnforcementCache::new();
        let short = Duration::from_millis(50);
        for i in 0..20 {
            cache.check_rate_limit(&format!("7:ip:10.0.0.{}", i), 10, short).await.unwrap();
        }
        cache.record_auto_ban_event("10.0.0.1", "7", short).await.unwrap();
        cache.ban("10.0.0.2", &BanScope::Host("7".into()), short).await.unwrap();
        cache.acquire_lock("job", "A", short).await.unwrap();
        cache.blacklist_token("t1", short).await.unwrap();
        cache.put_policy("7", "artifact", short).await.unwrap();
        cache.ban("10.0.0.3", &BanScope::Global, Duration::ZERO).await.unwrap();
        cache.check_rate_limit("7:ip:10.0.0.99", 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.key_count(), 27);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.sweep_expired(), 25);
        assert_eq!(cache.key_count(), 2);
        assert!(cache.is_banned("10.0.0.3", &BanScope::Global).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_runs_on_operation_budget() {
        let cache = MemoryEnforcementCache::new().with_sweep_every(4);
        cache.check_rate_limit("stale", 10, Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..3 {
            cache.check_rate_limit("live", 10, Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(cache.key_count(), 1);
    }

    #[tokio::test]
    async fn test_unban_drops_empty_host_set() {
        let cache = MemoryEnforcementCache::new();
        let host = BanScope::Host("9".into());
        cache.ban("1.2.3.4", &host, Duration::ZERO).await.unwrap();
        assert!(cache.unban("1.2.3.4", &host).await.unwrap());
        assert_eq!(cache.key_count(), 0);
    }

    #[tokio::test]
    async fn test_policy_cache_and_tokens() {
        let cache = MemoryEnforcementCache::new();
        cache.put_policy("1", "artifact", Duration::from_secs(300)).await.unwrap();
        assert_eq!(cache.get_policy("1").await.unwrap().as_deref(), Some("artifact"));
        cache.invalidate_policy("1").await.unwrap();
        assert_eq!(cache.get_policy("1").await.unwrap(), None);

        cache.blacklist_token("t1", Duration::ZERO).await.unwrap();
        assert!(!cache.is_token_blacklisted("t1").await.unwrap());
        cache.blacklist_token("t1", Duration::from_secs(30)).await.unwrap();
        assert!(cache.is_token_blacklisted("t1").await.unwrap());
    }
}
