//! On-disk artifact directory.
//!
//! Single writer (the compiler), many readers (the proxy engine). Writes go
//! to a hidden temp file in the same directory and are renamed over the
//! target, so a reader sees either the old file or the new one.
//!
//! Every change is journaled with the contents it replaced until the reload
//! orchestrator takes the journal. If the engine rejects the result, the
//! journal is rolled back and the last accepted files return.

use rand::Rng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::render::HOST_ID_HEADER;

/// File name -> contents before the first unapplied change; `None` marks a
/// file that did not exist
pub type PendingChanges = BTreeMap<String, Option<String>>;

/// Artifact directory owned by the compiler
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    pending: Arc<Mutex<PendingChanges>>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Arc::new(Mutex::new(PendingChanges::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Write `contents` to `file_name` atomically.
    ///
    /// Returns `false` without touching the file when the current contents
    /// are already identical.
    pub async fn write_atomic(&self, file_name: &str, contents: &str) -> std::io::Result<bool> {
        let mut pending = self.pending.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let target = self.path_of(file_name);

        let existing = self.read(file_name).await?;
        if let Some(existing) = &existing {
            if existing == contents {
                debug!("Artifact {} unchanged", target.display());
                return Ok(false);
            }
            if let (Some(old_owner), Some(new_owner)) =
                (header_host_id(existing), header_host_id(contents))
            {
                if old_owner != new_owner {
                    warn!(
                        file = %target.display(),
                        old_host = %old_owner,
                        new_host = %new_owner,
                        "Artifact file name collision: overwriting another host's artifact"
                    );
                }
            }
        }

        self.replace(file_name, contents).await?;
        pending.entry(file_name.to_string()).or_insert(existing);

        debug!("Wrote artifact {}", target.display());
        Ok(true)
    }

    /// Temp file + `sync_all` + rename over the target
    async fn replace(&self, file_name: &str, contents: &str) -> std::io::Result<()> {
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = self
            .dir
            .join(format!(".{}.tmp-{}-{:08x}", file_name, std::process::id(), suffix));

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, self.path_of(file_name)).await
        }
        .await;

        if result.is_err() {
            fs::remove_file(&tmp).await.ok();
        }
        result
    }

    /// Current contents of an artifact, `None` if it does not exist
    pub async fn read(&self, file_name: &str) -> std::io::Result<Option<String>> {
        match fs::read_to_string(self.path_of(file_name)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete an artifact; missing files are not an error
    pub async fn remove(&self, file_name: &str) -> std::io::Result<bool> {
        let mut pending = self.pending.lock().await;
        let existing = match self.read(file_name).await? {
            Some(existing) => existing,
            None => return Ok(false),
        };
        if !remove_if_present(&self.path_of(file_name)).await? {
            return Ok(false);
        }
        pending.entry(file_name.to_string()).or_insert(Some(existing));
        Ok(true)
    }

    /// Take the journal of changes since the last call
    pub async fn take_pending(&self) -> PendingChanges {
        std::mem::take(&mut *self.pending.lock().await)
    }

    /// Put taken changes back, e.g. when their fate is unknown. Older
    /// entries win over anything journaled since.
    pub async fn requeue(&self, changes: PendingChanges) {
        self.pending.lock().await.extend(changes);
    }

    /// Restore the contents recorded in `changes`, deleting files that did
    /// not exist before. Files rewritten since `changes` was taken are left
    /// alone and their journal entry now points at the restored contents.
    /// Returns the files put back on disk.
    pub async fn roll_back(&self, changes: PendingChanges) -> Vec<String> {
        let mut pending = self.pending.lock().await;
        let mut restored = Vec::new();

        for (file_name, previous) in changes {
            if let Some(slot) = pending.get_mut(&file_name) {
                *slot = previous;
                continue;
            }

            let result = match &previous {
                Some(contents) => self.replace(&file_name, contents).await,
                None => remove_if_present(&self.path_of(&file_name)).await.map(|_| ()),
            };
            match result {
                Ok(()) => restored.push(file_name),
                Err(e) => {
                    error!(file = %file_name, error = %e, "Failed to restore artifact, will retry on next rollback");
                    pending.insert(file_name, previous);
                }
            }
        }

        restored
    }

    /// Names of all `.conf` artifacts, sorted
    pub async fn list(&self) -> std::io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".conf") && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Owning host id recorded in an artifact's header
    pub async fn owner_of(&self, file_name: &str) -> std::io::Result<Option<String>> {
        Ok(self
            .read(file_name)
            .await?
            .and_then(|text| header_host_id(&text).map(str::to_string)))
    }

    /// Remove every artifact whose header names `host_id`, except `keep`.
    ///
    /// Scanning headers rather than recomputing the file name means a host
    /// whose domains changed since its last compile is still cleaned up.
    pub async fn remove_host(&self, host_id: &str, keep: Option<&str>) -> std::io::Result<Vec<String>> {
        let mut removed = Vec::new();
        for name in self.list().await? {
            if Some(name.as_str()) == keep {
                continue;
            }
            if self.owner_of(&name).await?.as_deref() == Some(host_id) && self.remove(&name).await? {
                removed.push(name);
            }
        }
        Ok(removed)
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Parse the `# host_id:` header from the first few lines of an artifact
pub fn header_host_id(text: &str) -> Option<&str> {
    text.lines()
        .take(8)
        .find_map(|line| line.strip_prefix(HOST_ID_HEADER))
        .map(str::trim)
}
