//! Handler-facing facade.
//!
//! Wires the policy store, compiler, reload orchestrator and enforcement
//! cache together. Compile and apply failures are returned to the caller;
//! cache unavailability is absorbed here and never fails a request.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compiler::render::GLOBAL_ARTIFACT_ID;
use crate::compiler::{CompileError, Compiler, ConfigArtifact};
use crate::config::MIN_POLICY_TTL_SECS;
use crate::enforcement::{CacheError, EnforcementCache, FailOpen, RateLimitResult, SyncReport};
use crate::patterns::IpSpec;
use crate::policy::{BanScope, BannedIpEntry, Fail2banAction, HostSecurityProfile};
use crate::policy_store::{PolicyStore, StoreError};
use crate::reload::{ReloadError, ReloadOrchestrator, ReloadOutcome};

const BAN_RESYNC_LOCK: &str = "ban-resync";

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid ban target '{ip}': {reason}")]
    InvalidBanTarget { ip: String, reason: String },
}

/// Result of a full recompile
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileAllReport {
    pub compiled: Vec<String>,
    /// Host ids whose artifacts were removed (disabled or deleted hosts)
    pub removed: Vec<String>,
    /// Hosts that failed to compile, with the reason; their previous
    /// artifact is left in place
    pub failed: Vec<(String, String)>,
    #[serde(skip)]
    pub reload: Option<ReloadOutcome>,
}

pub struct ControlPlane {
    store: Arc<dyn PolicyStore>,
    compiler: Compiler,
    orchestrator: ReloadOrchestrator,
    cache: Arc<dyn EnforcementCache>,
    policy_ttl: Duration,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        compiler: Compiler,
        orchestrator: ReloadOrchestrator,
        cache: Arc<dyn EnforcementCache>,
    ) -> Self {
        orchestrator.track_artifacts(compiler.store().clone());
        Self {
            store,
            compiler,
            orchestrator,
            cache,
            policy_ttl: Duration::from_secs(MIN_POLICY_TTL_SECS),
        }
    }

    /// Lifetime of compiled-policy copies in the cache
    pub fn with_policy_ttl(mut self, ttl: Duration) -> Self {
        self.policy_ttl = ttl;
        self
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn orchestrator(&self) -> &ReloadOrchestrator {
        &self.orchestrator
    }

    pub fn cache(&self) -> &Arc<dyn EnforcementCache> {
        &self.cache
    }

    // =========================================================================
    // COMPILATION
    // =========================================================================

    /// Compile a host from the store and write its artifact.
    ///
    /// A disabled host has its artifact removed and yields `None`.
    pub async fn compile_and_write(&self, host_id: &str) -> Result<Option<ConfigArtifact>, ControlPlaneError> {
        let host = self.store.get_host_security_profile(host_id).await?;
        if !host.enabled {
            self.compiler.remove_artifact(host_id).await?;
            return Ok(None);
        }
        let global = self.store.get_global_security_profile().await?;
        let (artifact, _) = self.compiler.compile_and_write(&host, &global).await?;
        Ok(Some(artifact))
    }

    pub async fn remove_artifact(&self, host_id: &str) -> Result<bool, ControlPlaneError> {
        Ok(self.compiler.remove_artifact(host_id).await?)
    }

    /// Change notification: recompile one host and schedule a debounced reload
    pub async fn policy_changed(&self, host_id: &str) -> Result<Option<ConfigArtifact>, ControlPlaneError> {
        let artifact = match self.compile_and_write(host_id).await {
            Err(ControlPlaneError::Store(StoreError::HostNotFound(_))) => {
                info!(host_id, "Host no longer exists, removing artifact");
                self.compiler.remove_artifact(host_id).await?;
                None
            }
            other => other?,
        };
        self.orchestrator.request_reload();
        Ok(artifact)
    }

    /// Render the global banned-IP artifact from the store
    pub async fn compile_global(&self) -> Result<bool, ControlPlaneError> {
        let bans = self.store.list_banned_ips().await?;
        Ok(self.compiler.compile_global(&bans).await?)
    }

    /// Compile every enabled host, drop artifacts of hosts that are gone or
    /// disabled, refresh the global artifact and reload immediately.
    pub async fn compile_all(&self) -> Result<CompileAllReport, ControlPlaneError> {
        let global = self.store.get_global_security_profile().await?;
        let mut report = CompileAllReport::default();
        let mut enabled = BTreeSet::new();

        for host_id in self.store.list_host_ids().await? {
            let host = self.store.get_host_security_profile(&host_id).await?;
            if !host.enabled {
                continue;
            }
            enabled.insert(host_id.clone());
            match self.compiler.compile_and_write(&host, &global).await {
                Ok(_) => report.compiled.push(host_id),
                Err(CompileError::Io(e)) => return Err(CompileError::Io(e).into()),
                Err(e) => report.failed.push((host_id, e.to_string())),
            }
        }

        for file_name in self.compiler.list_artifacts().await? {
            let owner = match self.compiler.artifact_owner(&file_name).await? {
                Some(owner) => owner,
                None => {
                    debug!(file = %file_name, "Artifact without host header left untouched");
                    continue;
                }
            };
            if owner == GLOBAL_ARTIFACT_ID || enabled.contains(&owner) || report.removed.contains(&owner) {
                continue;
            }
            if self.compiler.remove_artifact(&owner).await? {
                report.removed.push(owner);
            }
        }

        self.compile_global().await?;
        report.reload = Some(self.orchestrator.request_reload_immediate().await?);

        info!(
            compiled = report.compiled.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Compiled all hosts"
        );
        Ok(report)
    }

    /// Resync bans into the cache, then compile everything
    pub async fn startup(&self) -> Result<CompileAllReport, ControlPlaneError> {
        match self.sync_banned_ips().await {
            Ok(report) => info!(
                total = report.total,
                applied = report.applied,
                skipped_expired = report.skipped_expired,
                "Banned IPs resynced"
            ),
            Err(ControlPlaneError::Cache(CacheError::NotReady)) => {
                warn!("Enforcement cache not ready at startup, skipping ban resync")
            }
            Err(ControlPlaneError::Cache(e)) => {
                error!(error = %e, "Ban resync failed, continuing with compile")
            }
            Err(e) => return Err(e),
        }
        self.compile_all().await
    }

    /// Compiled artifact text, read through the cache
    pub async fn cached_artifact(&self, host_id: &str) -> Result<String, ControlPlaneError> {
        if let Some(text) = self.cache.get_policy(host_id).await.or_fail_open(None, "get_policy") {
            debug!(host_id, "Compiled policy served from cache");
            return Ok(text);
        }

        let host = self.store.get_host_security_profile(host_id).await?;
        let global = self.store.get_global_security_profile().await?;
        let artifact = self.compiler.compile(&host, &global)?;
        self.cache
            .put_policy(host_id, &artifact.contents, self.policy_ttl)
            .await
            .or_fail_open((), "put_policy");
        Ok(artifact.contents)
    }

    // =========================================================================
    // RELOAD
    // =========================================================================

    pub fn request_reload(&self) {
        self.orchestrator.request_reload();
    }

    pub async fn request_reload_immediate(&self) -> Result<ReloadOutcome, ControlPlaneError> {
        Ok(self.orchestrator.request_reload_immediate().await?)
    }

    pub async fn flush(&self) -> Result<Option<ReloadOutcome>, ControlPlaneError> {
        Ok(self.orchestrator.flush().await?)
    }

    // =========================================================================
    // BANS
    // =========================================================================

    /// Persist a ban, then apply it to the cache. A zero TTL is permanent.
    ///
    /// Global bans also refresh the global artifact and schedule a reload.
    pub async fn ban(
        &self,
        ip: &str,
        scope: BanScope,
        ttl: Duration,
        reason: &str,
    ) -> Result<BannedIpEntry, ControlPlaneError> {
        let spec = IpSpec::parse(ip).map_err(|e| ControlPlaneError::InvalidBanTarget {
            ip: ip.to_string(),
            reason: e.to_string(),
        })?;
        let ip = spec.canonical();

        let entry = BannedIpEntry::new(ip.clone(), scope.clone(), reason, ttl);
        self.store.save_banned_ip(entry.clone()).await?;
        self.cache.ban(&ip, &scope, ttl).await.or_fail_open((), "ban");

        info!(%ip, %scope, ttl_secs = ttl.as_secs(), reason, "IP banned");
        if scope == BanScope::Global {
            self.compile_global().await?;
            self.orchestrator.request_reload();
        }
        Ok(entry)
    }

    /// Lift a ban from both the store and the cache
    pub async fn unban(&self, ip: &str, scope: BanScope) -> Result<bool, ControlPlaneError> {
        let ip = IpSpec::parse(ip).map(|s| s.canonical()).unwrap_or_else(|_| ip.to_string());

        let stored = self.store.delete_banned_ip(&ip, &scope).await?;
        let cached = self.cache.unban(&ip, &scope).await.or_fail_open(false, "unban");

        if stored || cached {
            info!(%ip, %scope, "IP unbanned");
            if scope == BanScope::Global {
                self.compile_global().await?;
                self.orchestrator.request_reload();
            }
        }
        Ok(stored || cached)
    }

    /// Raw cache answer; `Err(NotReady)` when the cache is down
    pub async fn is_banned(&self, ip: &str, scope: &BanScope) -> Result<bool, CacheError> {
        self.cache.is_banned(ip, scope).await
    }

    /// Request-path check: an unavailable cache means "not banned"
    pub async fn is_banned_or_allow(&self, ip: &str, scope: &BanScope) -> bool {
        self.cache.is_banned(ip, scope).await.or_fail_open(false, "is_banned")
    }

    pub async fn sync_banned_ips(&self) -> Result<SyncReport, ControlPlaneError> {
        let bans = self.store.list_banned_ips().await?;
        Ok(self.cache.sync_banned_ips(&bans).await?)
    }

    /// Drift recovery across replicas: resync only if this holder wins the
    /// resync lock. `Ok(None)` when another replica holds it or the cache is down.
    pub async fn resync_bans_exclusive(&self, holder: &str, lock_ttl: Duration) -> Result<Option<SyncReport>, ControlPlaneError> {
        let acquired = self
            .cache
            .acquire_lock(BAN_RESYNC_LOCK, holder, lock_ttl)
            .await
            .or_fail_open(false, "acquire_lock");
        if !acquired {
            debug!(holder, "Ban resync lock held elsewhere");
            return Ok(None);
        }

        let result = self.sync_banned_ips().await;
        self.cache
            .release_lock(BAN_RESYNC_LOCK, holder)
            .await
            .or_fail_open(false, "release_lock");
        result.map(Some)
    }

    // =========================================================================
    // RATE LIMITING AND AUTOMATIC BANS
    // =========================================================================

    pub async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult, CacheError> {
        self.cache.check_rate_limit(key, limit, window).await
    }

    /// Apply a host's rate limit to one request. `None` means no limit
    /// applies: the host has none configured or the cache is unavailable.
    pub async fn check_host_rate_limit(
        &self,
        host: &HostSecurityProfile,
        client_ip: &str,
        uri: &str,
    ) -> Option<RateLimitResult> {
        let config = host.rate_limit.as_ref()?;
        let key = config.limiter_key(&host.id, client_ip, uri);
        self.cache
            .check_rate_limit(&key, config.window_limit(), Duration::from_secs(1))
            .await
            .map(Some)
            .or_fail_open(None, "check_rate_limit")
    }

    /// Count a WAF hit; bans the IP on the host once the auto-ban threshold
    /// is reached. Returns whether a ban was issued.
    pub async fn record_waf_event(&self, ip: &str, host: &HostSecurityProfile) -> Result<bool, ControlPlaneError> {
        let auto_ban = match host.waf.as_ref().filter(|w| w.enabled).and_then(|w| w.auto_ban.as_ref()) {
            Some(auto_ban) => auto_ban,
            None => return Ok(false),
        };

        let count = self
            .cache
            .record_auto_ban_event(ip, &host.id, Duration::from_secs(auto_ban.window_secs))
            .await
            .or_fail_open(0, "record_auto_ban_event");
        if count < auto_ban.threshold {
            return Ok(false);
        }

        warn!(%ip, host_id = %host.id, count, threshold = auto_ban.threshold, "WAF auto-ban threshold reached");
        self.ban(
            ip,
            BanScope::Host(host.id.clone()),
            Duration::from_secs(auto_ban.ban_secs),
            "waf auto-ban",
        )
        .await?;
        Ok(true)
    }

    /// Count a failed response for fail2ban. Returns whether a ban was issued.
    pub async fn record_failed_response(
        &self,
        ip: &str,
        host: &HostSecurityProfile,
        status: u16,
    ) -> Result<bool, ControlPlaneError> {
        let config = match host.fail2ban.as_ref() {
            Some(config) if config.fail_codes.contains(&status) => config,
            _ => return Ok(false),
        };

        let key = format!("f2b:{}:{}", host.id, ip);
        let result = self
            .cache
            .check_rate_limit(&key, u64::from(config.max_retries), Duration::from_secs(config.find_time))
            .await
            .map(Some)
            .or_fail_open(None, "fail2ban");
        let count = match result {
            Some(result) => result.current_count,
            None => return Ok(false),
        };
        if count < u64::from(config.max_retries) {
            return Ok(false);
        }

        let scope = match config.action {
            Fail2banAction::BanHost => BanScope::Host(host.id.clone()),
            Fail2banAction::BanGlobal => BanScope::Global,
        };
        warn!(%ip, host_id = %host.id, count, %scope, "Fail2ban retry limit reached");
        self.ban(ip, scope, Duration::from_secs(config.ban_time), "fail2ban").await?;
        Ok(true)
    }

    // =========================================================================
    // TOKENS
    // =========================================================================

    /// Revoke a token for the rest of its lifetime; expired tokens are ignored
    pub async fn blacklist_token(&self, token_id: &str, remaining: Duration) {
        if remaining.is_zero() {
            return;
        }
        self.cache
            .blacklist_token(token_id, remaining)
            .await
            .or_fail_open((), "blacklist_token");
    }

    pub async fn is_token_blacklisted(&self, token_id: &str) -> bool {
        self.cache
            .is_token_blacklisted(token_id)
            .await
            .or_fail_open(false, "is_token_blacklisted")
    }
}
