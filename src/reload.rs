//! Reload Orchestrator
//!
//! Coalesces policy-change notifications into proxy engine reloads.
//!
//! ```text
//! Idle --request_reload--> PendingDebounce --timer--> Applying --> Idle
//!   \__________request_reload_immediate / flush________/
//! ```
//!
//! At most one reload is ever scheduled: re-arming replaces the pending
//! timer. Applies are serialized per process, so a reload requested while
//! one is in flight waits for it and then runs against the latest artifacts.
//!
//! With an [`ArtifactStore`] attached, every apply takes the store's change
//! journal first. A configuration the engine rejects is rolled back on disk
//! so the files match what the engine is still running.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::compiler::artifact::{ArtifactStore, PendingChanges};
use crate::config::ReloadConfig;
use crate::lock_utils::lock_or_recover;

/// Proxy engine control surface
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Validate the full configuration currently on disk
    async fn test_config(&self) -> anyhow::Result<()>;

    /// Ask the engine to load the configuration on disk
    async fn reload(&self) -> anyhow::Result<()>;
}

/// Engine driven through shell commands (`nginx -t`, `nginx -s reload`)
#[derive(Debug, Clone)]
pub struct CommandEngine {
    test_command: Vec<String>,
    reload_command: Vec<String>,
}

impl CommandEngine {
    pub fn new(test_command: &str, reload_command: &str) -> Self {
        Self {
            test_command: split_command(test_command),
            reload_command: split_command(reload_command),
        }
    }

    pub fn from_config(config: &ReloadConfig) -> Self {
        Self::new(&config.test_command, &config.reload_command)
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

async fn run_command(argv: &[String]) -> anyhow::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty engine command"))?;

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to run `{}`: {}", argv.join(" "), e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("`{}` exited with {}: {}", argv.join(" "), output.status, stderr.trim())
    }
}

#[async_trait]
impl ProxyEngine for CommandEngine {
    async fn test_config(&self) -> anyhow::Result<()> {
        run_command(&self.test_command).await
    }

    async fn reload(&self) -> anyhow::Result<()> {
        run_command(&self.reload_command).await
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReloadError {
    /// Engine rejected the configuration; the previous one stays active
    #[error("proxy engine rejected the configuration: {0}")]
    Validation(String),

    #[error("proxy engine reload failed: {0}")]
    Reload(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadState {
    Idle,
    PendingDebounce,
    Applying,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadStats {
    /// Successful reloads since start, monotonic
    pub reload_count: u64,
    pub failed_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Result of one successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub reload_number: u64,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Default)]
struct Schedule {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    engine: Arc<dyn ProxyEngine>,
    debounce: Duration,
    timeout: Duration,
    schedule: Mutex<Schedule>,
    apply_gate: tokio::sync::Mutex<()>,
    applying: AtomicBool,
    stats: Mutex<ReloadStats>,
    artifacts: Mutex<Option<ArtifactStore>>,
}

/// Debounced, serialized proxy reloads. Cheap to clone.
#[derive(Clone)]
pub struct ReloadOrchestrator {
    inner: Arc<Inner>,
}

impl ReloadOrchestrator {
    pub fn new(engine: Arc<dyn ProxyEngine>, debounce: Duration, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                debounce,
                timeout,
                schedule: Mutex::new(Schedule::default()),
                apply_gate: tokio::sync::Mutex::new(()),
                applying: AtomicBool::new(false),
                stats: Mutex::new(ReloadStats::default()),
                artifacts: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(engine: Arc<dyn ProxyEngine>, config: &ReloadConfig) -> Self {
        Self::new(engine, config.debounce(), config.timeout())
    }

    /// Roll back changes in `store` whenever the engine rejects them
    pub fn track_artifacts(&self, store: ArtifactStore) {
        *lock_or_recover(&self.inner.artifacts, "tracked artifacts") = Some(store);
    }

    /// Arm the debounce timer, or re-arm it if one is pending.
    ///
    /// Failures of the resulting apply are logged, never returned.
    pub fn request_reload(&self) {
        let mut schedule = lock_or_recover(&self.inner.schedule, "reload schedule");
        if let Some(timer) = schedule.timer.take() {
            timer.abort();
            debug!("Reload debounce timer re-armed");
        }
        schedule.generation += 1;
        let generation = schedule.generation;

        let inner = Arc::clone(&self.inner);
        schedule.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            if !inner.claim(generation) {
                return;
            }
            if let Err(e) = inner.apply().await {
                error!(error = %e, "Debounced reload failed, previous configuration remains active");
            }
        }));
    }

    /// Cancel any pending timer and apply now, returning the outcome
    pub async fn request_reload_immediate(&self) -> Result<ReloadOutcome, ReloadError> {
        if self.cancel_pending() {
            debug!("Pending debounced reload superseded by immediate reload");
        }
        self.apply_now().await
    }

    /// Run an armed-but-not-fired reload now. `Ok(None)` when nothing was pending.
    pub async fn flush(&self) -> Result<Option<ReloadOutcome>, ReloadError> {
        if !self.cancel_pending() {
            return Ok(None);
        }
        self.apply_now().await.map(Some)
    }

    pub fn state(&self) -> ReloadState {
        if self.inner.applying.load(Ordering::SeqCst) {
            return ReloadState::Applying;
        }
        let schedule = lock_or_recover(&self.inner.schedule, "reload schedule");
        if schedule.timer.is_some() {
            ReloadState::PendingDebounce
        } else {
            ReloadState::Idle
        }
    }

    pub fn stats(&self) -> ReloadStats {
        lock_or_recover(&self.inner.stats, "reload stats").clone()
    }

    /// Drop the pending timer; returns whether one was armed
    fn cancel_pending(&self) -> bool {
        let mut schedule = lock_or_recover(&self.inner.schedule, "reload schedule");
        schedule.generation += 1;
        match schedule.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Apply on a detached task so a dropped caller cannot cut it short
    async fn apply_now(&self) -> Result<ReloadOutcome, ReloadError> {
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.apply().await }).await {
            Ok(result) => result,
            Err(e) => Err(ReloadError::Reload(format!("apply task failed: {}", e))),
        }
    }
}

impl Inner {
    /// Take ownership of the schedule slot if `generation` is still current
    fn claim(&self, generation: u64) -> bool {
        let mut schedule = lock_or_recover(&self.schedule, "reload schedule");
        if schedule.generation != generation {
            return false;
        }
        // Detach rather than abort: this is the running task's own handle
        schedule.timer.take();
        true
    }

    async fn apply(&self) -> Result<ReloadOutcome, ReloadError> {
        let _gate = self.apply_gate.lock().await;
        self.applying.store(true, Ordering::SeqCst);
        let started = Instant::now();

        let artifacts = lock_or_recover(&self.artifacts, "tracked artifacts").clone();
        let changes = match &artifacts {
            Some(store) => store.take_pending().await,
            None => PendingChanges::new(),
        };

        let result = self.test_and_reload().await;
        if let Some(store) = &artifacts {
            settle_changes(store, changes, &result).await;
        }
        self.applying.store(false, Ordering::SeqCst);

        let mut stats = lock_or_recover(&self.stats, "reload stats");
        match result {
            Ok(()) => {
                stats.reload_count += 1;
                let completed_at = Utc::now();
                stats.last_success_at = Some(completed_at);
                let outcome = ReloadOutcome {
                    reload_number: stats.reload_count,
                    completed_at,
                    duration: started.elapsed(),
                };
                info!(
                    reload_number = outcome.reload_number,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Proxy engine reloaded"
                );
                Ok(outcome)
            }
            Err(e) => {
                stats.failed_count += 1;
                stats.last_error = Some(e.to_string());
                warn!(error = %e, failed_count = stats.failed_count, "Proxy engine reload rejected");
                Err(e)
            }
        }
    }

    async fn test_and_reload(&self) -> Result<(), ReloadError> {
        match tokio::time::timeout(self.timeout, self.engine.test_config()).await {
            Err(_) => {
                return Err(ReloadError::Timeout {
                    stage: "config test",
                    after: self.timeout,
                })
            }
            Ok(Err(e)) => return Err(ReloadError::Validation(format!("{:#}", e))),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout(self.timeout, self.engine.reload()).await {
            Err(_) => Err(ReloadError::Timeout {
                stage: "reload",
                after: self.timeout,
            }),
            Ok(Err(e)) => Err(ReloadError::Reload(format!("{:#}", e))),
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Keep accepted changes, restore rejected ones, requeue undecided ones
async fn settle_changes(store: &ArtifactStore, changes: PendingChanges, result: &Result<(), ReloadError>) {
    match result {
        Ok(()) | Err(ReloadError::Reload(_)) | Err(ReloadError::Timeout { stage: "reload", .. }) => {}
        Err(ReloadError::Validation(_)) => {
            let restored = store.roll_back(changes).await;
            if !restored.is_empty() {
                warn!(files = ?restored, "Rolled back artifacts rejected by the proxy engine");
            }
        }
        Err(ReloadError::Timeout { .. }) => store.requeue(changes).await,
    }
}
