// Control plane integration tests
//
// YAML policy directory + in-process cache + recording engine, exercised
// through the handler-facing operations

use aegis_control_plane::compiler::{ArtifactStore, Compiler};
use aegis_control_plane::control_plane::{ControlPlane, ControlPlaneError};
use aegis_control_plane::enforcement::{EnforcementCache, MemoryEnforcementCache};
use aegis_control_plane::policy::BanScope;
use aegis_control_plane::policy_store::{PolicyStore, YamlDirPolicyStore};
use aegis_control_plane::reload::{ProxyEngine, ReloadError, ReloadOrchestrator};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingEngine {
    reloads: AtomicUsize,
}

#[async_trait]
impl ProxyEngine for RecordingEngine {
    async fn test_config(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    policy_dir: TempDir,
    artifact_dir: TempDir,
    cache: Arc<MemoryEnforcementCache>,
    engine: Arc<RecordingEngine>,
    store: Arc<YamlDirPolicyStore>,
    control_plane: ControlPlane,
}

fn write_host(dir: &Path, file: &str, yaml: &str) {
    std::fs::create_dir_all(dir.join("hosts")).unwrap();
    std::fs::write(dir.join("hosts").join(file), yaml).unwrap();
}

fn harness() -> Harness {
    let policy_dir = TempDir::new().unwrap();
    let artifact_dir = TempDir::new().unwrap();

    write_host(
        policy_dir.path(),
        "shop.yaml",
        "id: \"1\"\ndomains: [shop.example.com]\nwaf:\n  paranoia_level: 2\n",
    );
    write_host(
        policy_dir.path(),
        "blog.yaml",
        "id: \"2\"\ndomains: [blog.example.com]\ngeo:\n  countries: [RU]\n",
    );

    let cache = Arc::new(MemoryEnforcementCache::new());
    let engine = Arc::new(RecordingEngine::default());
    let store = Arc::new(YamlDirPolicyStore::new(policy_dir.path()));
    let compiler = Compiler::new(
        ArtifactStore::new(artifact_dir.path()),
        "global_banned_ips.conf",
        cache.clone(),
    );
    let orchestrator = ReloadOrchestrator::new(engine.clone(), Duration::from_millis(50), Duration::from_secs(5));
    let control_plane = ControlPlane::new(store.clone(), compiler, orchestrator, cache.clone())
        .with_policy_ttl(Duration::from_secs(300));

    Harness {
        policy_dir,
        artifact_dir,
        cache,
        engine,
        store,
        control_plane,
    }
}

fn artifacts(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_compile_all_writes_every_enabled_host() {
    let h = harness();
    let report = h.control_plane.compile_all().await.unwrap();

    assert_eq!(report.compiled, vec!["1".to_string(), "2".to_string()]);
    assert!(report.failed.is_empty());
    assert!(report.reload.is_some());
    assert_eq!(h.engine.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        artifacts(&h.artifact_dir),
        vec![
            "blog_example_com.conf".to_string(),
            "global_banned_ips.conf".to_string(),
            "shop_example_com.conf".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_compile_all_removes_disabled_hosts() {
    let h = harness();
    h.control_plane.compile_all().await.unwrap();

    write_host(
        h.policy_dir.path(),
        "blog.yaml",
        "id: \"2\"\ndomains: [blog.example.com]\nenabled: false\n",
    );
    let report = h.control_plane.compile_all().await.unwrap();

    assert_eq!(report.removed, vec!["2".to_string()]);
    assert!(!artifacts(&h.artifact_dir).contains(&"blog_example_com.conf".to_string()));
    assert!(artifacts(&h.artifact_dir).contains(&"global_banned_ips.conf".to_string()));
}

#[tokio::test]
async fn test_compile_all_reports_invalid_host_and_continues() {
    let h = harness();
    write_host(
        h.policy_dir.path(),
        "broken.yaml",
        "id: \"3\"\ndomains: [broken.example.com]\ngeo:\n  allowed_ips: [\"10.0.0.0/40\"]\n",
    );

    let report = h.control_plane.compile_all().await.unwrap();
    assert_eq!(report.compiled.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "3");
    assert!(report.failed[0].1.contains("geo.allowed_ips[0]"));
}

#[tokio::test]
async fn test_policy_changed_debounces_reload() {
    let h = harness();
    h.control_plane.policy_changed("1").await.unwrap();
    h.control_plane.policy_changed("2").await.unwrap();
    assert_eq!(h.engine.reloads.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.engine.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_policy_changed_for_deleted_host_removes_artifact() {
    let h = harness();
    h.control_plane.compile_and_write("2").await.unwrap();
    std::fs::remove_file(h.policy_dir.path().join("hosts/blog.yaml")).unwrap();

    let artifact = h.control_plane.policy_changed("2").await.unwrap();
    assert!(artifact.is_none());
    assert!(artifacts(&h.artifact_dir).is_empty());
}

#[tokio::test]
async fn test_compile_unknown_host_is_error() {
    let h = harness();
    let err = h.control_plane.compile_and_write("404").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::Store(_)));
}

#[tokio::test]
async fn test_cached_artifact_read_through_and_invalidation() {
    let h = harness();
    assert_eq!(h.cache.get_policy("1").await.unwrap(), None);

    let text = h.control_plane.cached_artifact("1").await.unwrap();
    assert!(text.contains("# host_id: 1"));
    assert_eq!(h.cache.get_policy("1").await.unwrap().as_deref(), Some(text.as_str()));

    h.control_plane.compile_and_write("1").await.unwrap();
    assert_eq!(h.cache.get_policy("1").await.unwrap(), None);
}

#[tokio::test]
async fn test_global_ban_lands_in_store_cache_and_artifact() {
    let h = harness();
    h.control_plane
        .ban("198.51.100.7", BanScope::Global, Duration::from_secs(600), "manual")
        .await
        .unwrap();

    assert!(h.control_plane.is_banned("198.51.100.7", &BanScope::Host("1".into())).await.unwrap());
    assert_eq!(h.store.list_banned_ips().await.unwrap().len(), 1);
    let global = std::fs::read_to_string(h.artifact_dir.path().join("global_banned_ips.conf")).unwrap();
    assert!(global.contains("deny 198.51.100.7;"));

    assert!(h.control_plane.unban("198.51.100.7", BanScope::Global).await.unwrap());
    assert!(!h.control_plane.is_banned("198.51.100.7", &BanScope::Global).await.unwrap());
    let global = std::fs::read_to_string(h.artifact_dir.path().join("global_banned_ips.conf")).unwrap();
    assert!(!global.contains("198.51.100.7"));
}

#[tokio::test]
async fn test_startup_survives_cache_outage() {
    let h = harness();
    h.control_plane
        .ban("203.0.113.9", BanScope::Host("1".into()), Duration::ZERO, "manual")
        .await
        .unwrap();
    h.cache.set_ready(false);

    let report = h.control_plane.startup().await.unwrap();
    assert_eq!(report.compiled.len(), 2);

    h.cache.set_ready(true);
    let sync = h.control_plane.sync_banned_ips().await.unwrap();
    assert_eq!(sync.applied, 1);
    assert!(h.control_plane.is_banned_or_allow("203.0.113.9", &BanScope::Host("1".into())).await);
}

#[tokio::test]
async fn test_host_rate_limit_uses_profile() {
    let h = harness();
    write_host(
        h.policy_dir.path(),
        "api.yaml",
        "id: \"4\"\ndomains: [api.example.com]\nrate_limit:\n  rps: 2\n  burst: 1\n",
    );
    let host = h.store.get_host_security_profile("4").await.unwrap();

    let mut allowed = 0;
    for _ in 0..5 {
        let result = h.control_plane.check_host_rate_limit(&host, "192.0.2.1", "/").await.unwrap();
        if result.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);

    let unlimited = h.store.get_host_security_profile("1").await.unwrap();
    assert!(h.control_plane.check_host_rate_limit(&unlimited, "192.0.2.1", "/").await.is_none());
}

/// Engine whose config test rejects any artifact routing `/evil`
struct StrictEngine {
    artifact_dir: PathBuf,
    reloads: AtomicUsize,
}

#[async_trait]
impl ProxyEngine for StrictEngine {
    async fn test_config(&self) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(&self.artifact_dir)? {
            let path = entry?.path();
            if std::fs::read_to_string(&path)?.contains("/evil") {
                anyhow::bail!("invalid directive in {}", path.display());
            }
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_rejected_edit_is_rolled_back_and_later_edits_apply() {
    let policy_dir = TempDir::new().unwrap();
    let artifact_dir = TempDir::new().unwrap();
    write_host(policy_dir.path(), "shop.yaml", "id: \"1\"\ndomains: [shop.example.com]\n");
    write_host(
        policy_dir.path(),
        "blog.yaml",
        "id: \"2\"\ndomains: [blog.example.com]\ngeo:\n  countries: [RU]\n",
    );

    let cache = Arc::new(MemoryEnforcementCache::new());
    let engine = Arc::new(StrictEngine {
        artifact_dir: artifact_dir.path().to_path_buf(),
        reloads: AtomicUsize::new(0),
    });
    let compiler = Compiler::new(ArtifactStore::new(artifact_dir.path()), "global_banned_ips.conf", cache.clone());
    let orchestrator = ReloadOrchestrator::new(engine.clone(), Duration::from_millis(50), Duration::from_secs(5));
    let control_plane = ControlPlane::new(
        Arc::new(YamlDirPolicyStore::new(policy_dir.path())),
        compiler,
        orchestrator,
        cache,
    );

    control_plane.compile_all().await.unwrap();
    let shop_path = artifact_dir.path().join("shop_example_com.conf");
    let accepted = std::fs::read(&shop_path).unwrap();

    write_host(
        policy_dir.path(),
        "shop.yaml",
        "id: \"1\"\ndomains: [shop.example.com]\nuri_block:\n  rules:\n    - pattern: /evil\n      match_type: prefix\n",
    );
    control_plane.policy_changed("1").await.unwrap();
    let err = control_plane.flush().await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::Reload(ReloadError::Validation(_))));
    assert_eq!(std::fs::read(&shop_path).unwrap(), accepted);

    write_host(
        policy_dir.path(),
        "blog.yaml",
        "id: \"2\"\ndomains: [blog.example.com]\ngeo:\n  countries: [CN]\n",
    );
    control_plane.policy_changed("2").await.unwrap();
    let outcome = control_plane.flush().await.unwrap();
    assert!(outcome.is_some());
    assert_eq!(engine.reloads.load(Ordering::SeqCst), 2);

    let blog = std::fs::read_to_string(artifact_dir.path().join("blog_example_com.conf")).unwrap();
    assert!(blog.contains("^(CN)$"));
    assert_eq!(std::fs::read(&shop_path).unwrap(), accepted);
}
