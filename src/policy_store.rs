//! Policy Store seam
//!
//! The control plane reads host and global profiles from the system of
//! record and persists bans there. Two implementations: an in-memory store
//! for tests and embedding, and a directory of YAML documents:
//!
//! ```text
//! <dir>/hosts/*.yaml   one HostSecurityProfile per file
//! <dir>/global.yaml    GlobalSecurityProfile (optional)
//! <dir>/bans.yaml      list of BannedIpEntry (optional)
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::lock_utils::lock_or_recover;
use crate::policy::{BanScope, BannedIpEntry, GlobalSecurityProfile, HostSecurityProfile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("policy store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// System of record for security policy
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_host_security_profile(&self, host_id: &str) -> Result<HostSecurityProfile, StoreError>;

    async fn get_global_security_profile(&self) -> Result<GlobalSecurityProfile, StoreError>;

    /// Every known host id, enabled or not, sorted
    async fn list_host_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn list_banned_ips(&self) -> Result<Vec<BannedIpEntry>, StoreError>;

    /// Insert or replace the ban for `(ip, scope)`
    async fn save_banned_ip(&self, entry: BannedIpEntry) -> Result<(), StoreError>;

    /// Returns whether a ban existed
    async fn delete_banned_ip(&self, ip: &str, scope: &BanScope) -> Result<bool, StoreError>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Default)]
struct MemoryState {
    hosts: BTreeMap<String, HostSecurityProfile>,
    global: GlobalSecurityProfile,
    bans: Vec<BannedIpEntry>,
}

#[derive(Default)]
pub struct MemoryPolicyStore {
    state: Mutex<MemoryState>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_host(&self, profile: HostSecurityProfile) {
        lock_or_recover(&self.state, "memory policy store")
            .hosts
            .insert(profile.id.clone(), profile);
    }

    pub fn remove_host(&self, host_id: &str) -> bool {
        lock_or_recover(&self.state, "memory policy store")
            .hosts
            .remove(host_id)
            .is_some()
    }

    pub fn set_global(&self, global: GlobalSecurityProfile) {
        lock_or_recover(&self.state, "memory policy store").global = global;
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get_host_security_profile(&self, host_id: &str) -> Result<HostSecurityProfile, StoreError> {
        lock_or_recover(&self.state, "memory policy store")
            .hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| StoreError::HostNotFound(host_id.to_string()))
    }

    async fn get_global_security_profile(&self) -> Result<GlobalSecurityProfile, StoreError> {
        Ok(lock_or_recover(&self.state, "memory policy store").global.clone())
    }

    async fn list_host_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock_or_recover(&self.state, "memory policy store")
            .hosts
            .keys()
            .cloned()
            .collect())
    }

    async fn list_banned_ips(&self) -> Result<Vec<BannedIpEntry>, StoreError> {
        Ok(lock_or_recover(&self.state, "memory policy store").bans.clone())
    }

    async fn save_banned_ip(&self, entry: BannedIpEntry) -> Result<(), StoreError> {
        let mut state = lock_or_recover(&self.state, "memory policy store");
        upsert_ban(&mut state.bans, entry);
        Ok(())
    }

    async fn delete_banned_ip(&self, ip: &str, scope: &BanScope) -> Result<bool, StoreError> {
        let mut state = lock_or_recover(&self.state, "memory policy store");
        Ok(remove_ban(&mut state.bans, ip, scope))
    }
}

fn upsert_ban(bans: &mut Vec<BannedIpEntry>, entry: BannedIpEntry) {
    match bans.iter_mut().find(|b| b.ip == entry.ip && b.scope == entry.scope) {
        Some(existing) => *existing = entry,
        None => bans.push(entry),
    }
}

fn remove_ban(bans: &mut Vec<BannedIpEntry>, ip: &str, scope: &BanScope) -> bool {
    let before = bans.len();
    bans.retain(|b| !(b.ip == ip && &b.scope == scope));
    bans.len() != before
}

// =============================================================================
// YAML DIRECTORY STORE
// =============================================================================

const HOSTS_DIR: &str = "hosts";
const GLOBAL_FILE: &str = "global.yaml";
const BANS_FILE: &str = "bans.yaml";

/// Policy store backed by a directory of YAML documents
pub struct YamlDirPolicyStore {
    dir: PathBuf,
    // Serializes read-modify-write of bans.yaml
    bans_gate: tokio::sync::Mutex<()>,
}

impl YamlDirPolicyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            bans_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load_hosts(&self) -> Result<Vec<HostSecurityProfile>, StoreError> {
        let hosts_dir = self.dir.join(HOSTS_DIR);
        let mut entries = match fs::read_dir(&hosts_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut hosts: Vec<HostSecurityProfile> = Vec::with_capacity(paths.len());
        for path in paths {
            let profile: HostSecurityProfile = match read_yaml(&path).await? {
                Some(profile) => profile,
                None => continue,
            };
            if hosts.iter().any(|h| h.id == profile.id) {
                warn!(host_id = %profile.id, file = %path.display(), "Duplicate host id in policy directory, ignoring file");
                continue;
            }
            hosts.push(profile);
        }
        Ok(hosts)
    }

    async fn load_bans(&self) -> Result<Vec<BannedIpEntry>, StoreError> {
        Ok(read_yaml(&self.dir.join(BANS_FILE)).await?.unwrap_or_default())
    }

    async fn store_bans(&self, bans: &[BannedIpEntry]) -> Result<(), StoreError> {
        let path = self.dir.join(BANS_FILE);
        let contents = serde_yaml::to_string(bans).map_err(|e| StoreError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{}.tmp-{}", BANS_FILE, std::process::id()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        debug!(count = bans.len(), "Persisted banned IPs");
        Ok(())
    }
}

async fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&text).map(Some).map_err(|e| StoreError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl PolicyStore for YamlDirPolicyStore {
    async fn get_host_security_profile(&self, host_id: &str) -> Result<HostSecurityProfile, StoreError> {
        self.load_hosts()
            .await?
            .into_iter()
            .find(|h| h.id == host_id)
            .ok_or_else(|| StoreError::HostNotFound(host_id.to_string()))
    }

    async fn get_global_security_profile(&self) -> Result<GlobalSecurityProfile, StoreError> {
        Ok(read_yaml(&self.dir.join(GLOBAL_FILE)).await?.unwrap_or_default())
    }

    async fn list_host_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.load_hosts().await?.into_iter().map(|h| h.id).collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_banned_ips(&self) -> Result<Vec<BannedIpEntry>, StoreError> {
        self.load_bans().await
    }

    async fn save_banned_ip(&self, entry: BannedIpEntry) -> Result<(), StoreError> {
        let _gate = self.bans_gate.lock().await;
        let mut bans = self.load_bans().await?;
        upsert_ban(&mut bans, entry);
        self.store_bans(&bans).await
    }

    async fn delete_banned_ip(&self, ip: &str, scope: &BanScope) -> Result<bool, StoreError> {
        let _gate = self.bans_gate.lock().await;
        let mut bans = self.load_bans().await?;
        if !remove_ban(&mut bans, ip, scope) {
            return Ok(false);
        }
        self.store_bans(&bans).await?;
        Ok(true)
    }
}
