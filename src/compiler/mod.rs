//! Config Compiler
//!
//! Turns a host's security profile (plus the global profile) into a
//! deterministic artifact for the proxy engine. [`compile`] is pure;
//! [`Compiler`] adds the side effects: atomic write, removal and cache
//! invalidation.

pub mod artifact;
pub mod pipeline;
pub mod render;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::enforcement::{EnforcementCache, FailOpen, DEFAULT_KEY_PREFIX};
use crate::patterns::artifact_file_name;
use crate::policy::{BannedIpEntry, GlobalSecurityProfile, HostSecurityProfile, ValidationError};

pub use artifact::ArtifactStore;
pub use pipeline::{CompileMode, Pipeline, Stage};

/// Kind prefix used in fallback artifact names
const HOST_ARTIFACT_KIND: &str = "host";

#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed rule, always attributable to one rule
    #[error("invalid rule '{rule}': {reason}")]
    Validation { rule: String, reason: String },

    #[error("host {host_id} has no domains")]
    NoDomains { host_id: String },

    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for CompileError {
    fn from(err: ValidationError) -> Self {
        CompileError::Validation {
            rule: err.rule,
            reason: err.reason,
        }
    }
}

/// Compiled configuration text for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub host_id: String,
    pub file_name: String,
    pub pipeline: Pipeline,
    pub contents: String,
}

/// Compile a host profile. Pure: no I/O, same input gives identical bytes.
pub fn compile(
    host: &HostSecurityProfile,
    global: &GlobalSecurityProfile,
    mode: CompileMode,
) -> Result<ConfigArtifact, CompileError> {
    compile_with_key_prefix(host, global, mode, DEFAULT_KEY_PREFIX)
}

/// [`compile`] for a cache namespaced under `key_prefix`; challenge stages
/// look revoked tokens up under it
pub fn compile_with_key_prefix(
    host: &HostSecurityProfile,
    global: &GlobalSecurityProfile,
    mode: CompileMode,
    key_prefix: &str,
) -> Result<ConfigArtifact, CompileError> {
    let primary = host.primary_domain().ok_or_else(|| CompileError::NoDomains {
        host_id: host.id.clone(),
    })?;

    host.validate()?;
    global.validate()?;

    let pipeline = Pipeline::for_profile(host);
    let contents = render::Renderer::new(host, global, pipeline, mode)
        .with_key_prefix(key_prefix)
        .render()?;

    Ok(ConfigArtifact {
        host_id: host.id.clone(),
        file_name: artifact_file_name(HOST_ARTIFACT_KIND, Some(primary), &host.id),
        pipeline,
        contents,
    })
}

/// Owns the artifact directory and keeps the compiled-policy cache coherent
pub struct Compiler {
    store: ArtifactStore,
    global_file_name: String,
    mode: CompileMode,
    key_prefix: String,
    cache: Arc<dyn EnforcementCache>,
}

impl Compiler {
    pub fn new(store: ArtifactStore, global_file_name: impl Into<String>, cache: Arc<dyn EnforcementCache>) -> Self {
        Self {
            store,
            global_file_name: global_file_name.into(),
            mode: CompileMode::Enforce,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            cache,
        }
    }

    pub fn with_mode(mut self, mode: CompileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Key namespace of the enforcement cache the proxy side reads
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Compile without writing
    pub fn compile(&self, host: &HostSecurityProfile, global: &GlobalSecurityProfile) -> Result<ConfigArtifact, CompileError> {
        compile_with_key_prefix(host, global, self.mode, &self.key_prefix)
    }

    /// Compile and atomically write a host's artifact, then invalidate the
    /// cached copy. Returns the artifact and whether the file changed.
    pub async fn compile_and_write(
        &self,
        host: &HostSecurityProfile,
        global: &GlobalSecurityProfile,
    ) -> Result<(ConfigArtifact, bool), CompileError> {
        let artifact = match self.compile(host, global) {
            Ok(artifact) => artifact,
            Err(CompileError::Validation { rule, reason }) => {
                warn!(host_id = %host.id, %rule, %reason, "Policy rejected by compiler");
                return Err(CompileError::Validation { rule, reason });
            }
            Err(e) => return Err(e),
        };

        let changed = self.store.write_atomic(&artifact.file_name, &artifact.contents).await?;

        // A domain change between compiles leaves the old file behind
        for stale in self.store.remove_host(&host.id, Some(&artifact.file_name)).await? {
            info!(host_id = %host.id, file = %stale, "Removed stale artifact after rename");
        }
        self.cache
            .invalidate_policy(&host.id)
            .await
            .or_fail_open((), "invalidate_policy");

        info!(
            host_id = %host.id,
            file = %artifact.file_name,
            pipeline = %artifact.pipeline,
            changed,
            "Compiled host artifact"
        );
        Ok((artifact, changed))
    }

    /// Remove every artifact owned by `host_id`; returns whether any existed
    pub async fn remove_artifact(&self, host_id: &str) -> Result<bool, CompileError> {
        let removed = self.store.remove_host(host_id, None).await?;
        self.cache
            .invalidate_policy(host_id)
            .await
            .or_fail_open((), "invalidate_policy");

        if removed.is_empty() {
            debug!(host_id, "No artifact to remove");
        } else {
            info!(host_id, files = ?removed, "Removed host artifact");
        }
        Ok(!removed.is_empty())
    }

    /// Render and write the global banned-IP artifact; returns whether it changed
    pub async fn compile_global(&self, bans: &[BannedIpEntry]) -> Result<bool, CompileError> {
        let contents = render::render_global_bans(bans, chrono::Utc::now())?;
        let changed = self.store.write_atomic(&self.global_file_name, &contents).await?;
        info!(file = %self.global_file_name, changed, "Compiled global banned-IP artifact");
        Ok(changed)
    }

    /// Artifact names currently on disk
    pub async fn list_artifacts(&self) -> Result<Vec<String>, CompileError> {
        Ok(self.store.list().await?)
    }

    /// Host id recorded in an artifact header
    pub async fn artifact_owner(&self, file_name: &str) -> Result<Option<String>, CompileError> {
        Ok(self.store.owner_of(file_name).await?)
    }

    pub fn global_file_name(&self) -> &str {
        &self.global_file_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::MemoryEnforcementCache;
    use crate::policy::{GeoConfig, GeoMode, WafConfig};
    use tempfile::TempDir;

    fn host(id: &str, domain: &str) -> HostSecurityProfile {
        HostSecurityProfile::new(id, vec![domain.to_string()])
    }

    fn compiler(dir: &TempDir) -> (Compiler, Arc<MemoryEnforcementCache>) {
        let cache = Arc::new(MemoryEnforcementCache::new());
        let compiler = Compiler::new(ArtifactStore::new(dir.path()), "global_banned_ips.conf", cache.clone());
        (compiler, cache)
    }

    #[test]
    fn test_zero_domains_is_input_error() {
        let h = HostSecurityProfile::new("3", vec![]);
        let err = compile(&h, &GlobalSecurityProfile::default(), CompileMode::Enforce).unwrap_err();
        assert!(matches!(err, CompileError::NoDomains { ref host_id } if host_id == "3"));
    }

    #[test]
    fn test_file_name_from_first_domain() {
        let artifact = compile(&host("3", "Shop.Example.com"), &GlobalSecurityProfile::default(), CompileMode::Enforce).unwrap();
        assert_eq!(artifact.file_name, "shop_example_com.conf");
        assert_eq!(artifact.pipeline, Pipeline::DirectBlock);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut h = host("3", "example.com");
        h.geo = Some(GeoConfig {
            mode: GeoMode::Blacklist,
            countries: vec!["RU".into(), "CN".into(), "cn".into()],
            allowed_ips: vec!["10.2.0.0/16".into(), "10.1.0.0/16".into()],
            ..Default::default()
        });
        h.waf = Some(WafConfig::default());
        let global = GlobalSecurityProfile::default();

        let a = compile(&h, &global, CompileMode::Enforce).unwrap();
        let b = compile(&h, &global, CompileMode::Enforce).unwrap();
        assert_eq!(a.contents, b.contents);
        assert!(a.contents.contains("\"^(CN|RU)$\""));
    }

    #[tokio::test]
    async fn test_compile_and_write_invalidates_cache() {
        let dir = TempDir::new().unwrap();
        let (compiler, cache) = compiler(&dir);
        cache.put_policy("3", "stale", std::time::Duration::from_secs(300)).await.unwrap();

        let (artifact, changed) = compiler
            .compile_and_write(&host("3", "example.com"), &GlobalSecurityProfile::default())
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(cache.get_policy("3").await.unwrap(), None);

        let (_, changed) = compiler
            .compile_and_write(&host("3", "example.com"), &GlobalSecurityProfile::default())
            .await
            .unwrap();
        assert!(!changed);

        let on_disk = std::fs::read_to_string(dir.path().join(&artifact.file_name)).unwrap();
        assert_eq!(on_disk, artifact.contents);
    }

    #[tokio::test]
    async fn test_compile_and_write_survives_cache_outage() {
        let dir = TempDir::new().unwrap();
        let (compiler, cache) = compiler(&dir);
        cache.set_ready(false);

        let result = compiler
            .compile_and_write(&host("3", "example.com"), &GlobalSecurityProfile::default())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_domain_change_replaces_old_file() {
        let dir = TempDir::new().unwrap();
        let (compiler, _) = compiler(&dir);
        let global = GlobalSecurityProfile::default();

        compiler.compile_and_write(&host("3", "old.example.com"), &global).await.unwrap();
        compiler.compile_and_write(&host("3", "new.example.com"), &global).await.unwrap();

        assert_eq!(compiler.list_artifacts().await.unwrap(), vec!["new_example_com.conf".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_artifact() {
        let dir = TempDir::new().unwrap();
        let (compiler, _) = compiler(&dir);
        compiler
            .compile_and_write(&host("3", "example.com"), &GlobalSecurityProfile::default())
            .await
            .unwrap();

        assert!(compiler.remove_artifact("3").await.unwrap());
        assert!(!compiler.remove_artifact("3").await.unwrap());
        assert!(compiler.list_artifacts().await.unwrap().is_empty());
    }
}
