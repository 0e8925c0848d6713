// Enforcement cache integration tests
//
// Every property runs against the in-process cache; the same checks run
// against a live Redis/DragonflyDB when the ignored tests are enabled

use aegis_control_plane::config::CacheConfig;
use aegis_control_plane::enforcement::{
    CacheError, EnforcementCache, FailOpen, MemoryEnforcementCache, RedisEnforcementCache,
};
use aegis_control_plane::policy::{BanScope, BannedIpEntry};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

async fn check_rate_limit_window(cache: &dyn EnforcementCache, key: &str) {
    for i in 0..10 {
        let result = cache.check_rate_limit(key, 10, Duration::from_secs(1)).await.unwrap();
        assert!(result.allowed, "call {} should be allowed", i + 1);
        assert_eq!(result.current_count, i + 1);
    }
    let eleventh = cache.check_rate_limit(key, 10, Duration::from_secs(1)).await.unwrap();
    assert!(!eleventh.allowed);
    assert_eq!(eleventh.remaining, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let later = cache.check_rate_limit(key, 10, Duration::from_secs(1)).await.unwrap();
    assert!(later.allowed);
}

async fn check_ban_expiry(cache: &dyn EnforcementCache) {
    cache.ban("1.2.3.4", &BanScope::Global, Duration::from_secs(1)).await.unwrap();
    assert!(cache.is_banned("1.2.3.4", &BanScope::Global).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!cache.is_banned("1.2.3.4", &BanScope::Global).await.unwrap());
}

async fn check_lock_protocol(cache: &dyn EnforcementCache) {
    let ttl = Duration::from_secs(5);
    assert!(cache.acquire_lock("job", "A", ttl).await.unwrap());
    assert!(!cache.acquire_lock("job", "B", ttl).await.unwrap());

    assert!(!cache.release_lock("job", "B").await.unwrap());
    assert!(!cache.extend_lock("job", "B", ttl).await.unwrap());
    assert!(!cache.acquire_lock("job", "B", ttl).await.unwrap());

    assert!(cache.extend_lock("job", "A", ttl).await.unwrap());
    assert!(cache.release_lock("job", "A").await.unwrap());
    assert!(cache.acquire_lock("job", "B", ttl).await.unwrap());
    assert!(cache.release_lock("job", "B").await.unwrap());
}

#[tokio::test]
async fn test_memory_rate_limit_window() {
    let cache = MemoryEnforcementCache::new();
    check_rate_limit_window(&cache, "k").await;
}

#[tokio::test]
async fn test_memory_ban_expiry() {
    let cache = MemoryEnforcementCache::new();
    check_ban_expiry(&cache).await;
}

#[tokio::test]
async fn test_memory_lock_protocol() {
    let cache = MemoryEnforcementCache::new();
    check_lock_protocol(&cache).await;
}

#[tokio::test]
async fn test_memory_lock_expires() {
    let cache = MemoryEnforcementCache::new();
    assert!(cache.acquire_lock("job", "A", Duration::from_millis(100)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cache.acquire_lock("job", "B", Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_rate_limit_never_over_admits() {
    let cache = Arc::new(MemoryEnforcementCache::new());
    let calls = (0..50).map(|_| {
        let cache = cache.clone();
        async move {
            cache
                .check_rate_limit("burst", 10, Duration::from_secs(10))
                .await
                .unwrap()
                .allowed
        }
    });

    let allowed = join_all(calls).await.into_iter().filter(|a| *a).count();
    assert_eq!(allowed, 10);
}

#[tokio::test]
async fn test_host_ban_does_not_leak_to_other_hosts() {
    let cache = MemoryEnforcementCache::new();
    let host_a = BanScope::Host("a".into());
    let host_b = BanScope::Host("b".into());

    cache.ban("10.0.0.1", &host_a, Duration::ZERO).await.unwrap();
    assert!(cache.is_banned("10.0.0.1", &host_a).await.unwrap());
    assert!(!cache.is_banned("10.0.0.1", &host_b).await.unwrap());
    assert!(!cache.is_banned("10.0.0.1", &BanScope::Global).await.unwrap());

    cache.ban("10.0.0.1", &BanScope::Global, Duration::ZERO).await.unwrap();
    assert!(cache.is_banned("10.0.0.1", &host_b).await.unwrap());
}

#[tokio::test]
async fn test_outage_fails_open() {
    let cache = MemoryEnforcementCache::new();
    cache.ban("1.2.3.4", &BanScope::Global, Duration::ZERO).await.unwrap();
    cache.set_ready(false);

    let result = cache.is_banned("1.2.3.4", &BanScope::Global).await;
    assert!(matches!(result, Err(CacheError::NotReady)));
    assert!(!cache
        .is_banned("1.2.3.4", &BanScope::Global)
        .await
        .or_fail_open(false, "is_banned"));

    let limited = cache
        .check_rate_limit("k", 1, Duration::from_secs(1))
        .await
        .map(|r| r.allowed)
        .or_fail_open(true, "check_rate_limit");
    assert!(limited);
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let cache = MemoryEnforcementCache::new();
    let entries = vec![
        BannedIpEntry::new("1.1.1.1", BanScope::Global, "manual", Duration::ZERO),
        BannedIpEntry::new("2.2.2.2", BanScope::Host("7".into()), "waf", Duration::from_secs(600)),
    ];

    cache.ban("9.9.9.9", &BanScope::Global, Duration::ZERO).await.unwrap();
    let first = cache.sync_banned_ips(&entries).await.unwrap();
    let second = cache.sync_banned_ips(&entries).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.applied, 2);

    assert!(!cache.is_banned("9.9.9.9", &BanScope::Global).await.unwrap());
    assert!(cache.is_banned("2.2.2.2", &BanScope::Host("7".into())).await.unwrap());
}

#[tokio::test]
async fn test_redis_unreachable_is_not_ready() {
    let config = CacheConfig {
        url: "redis://127.0.0.1:1/0".to_string(),
        connect_attempts: 1,
        backoff_ms: 1,
        op_timeout_ms: 200,
        ..Default::default()
    };
    let cache = RedisEnforcementCache::connect(&config).await.unwrap();
    assert!(!cache.is_ready());
    assert!(matches!(
        cache.is_banned("1.2.3.4", &BanScope::Global).await,
        Err(CacheError::NotReady)
    ));
}

fn live_config() -> CacheConfig {
    CacheConfig {
        key_prefix: format!("aegis-test-{:08x}", rand::random::<u32>()),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore] // Requires Redis/DragonflyDB
async fn test_redis_rate_limit_window() {
    let cache = RedisEnforcementCache::connect(&live_config()).await.unwrap();
    check_rate_limit_window(&cache, "k").await;
}

#[tokio::test]
#[ignore] // Requires Redis/DragonflyDB
async fn test_redis_ban_expiry() {
    let cache = RedisEnforcementCache::connect(&live_config()).await.unwrap();
    check_ban_expiry(&cache).await;
}

#[tokio::test]
#[ignore] // Requires Redis/DragonflyDB
async fn test_redis_lock_protocol() {
    let cache = RedisEnforcementCache::connect(&live_config()).await.unwrap();
    check_lock_protocol(&cache).await;
}
