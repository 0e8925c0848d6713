use aegis_control_plane::compiler::{ArtifactStore, CompileMode, Compiler};
use aegis_control_plane::config::ControlPlaneConfig;
use aegis_control_plane::control_plane::ControlPlane;
use aegis_control_plane::enforcement::{EnforcementCache, RedisEnforcementCache};
use aegis_control_plane::policy::BanScope;
use aegis_control_plane::policy_store::YamlDirPolicyStore;
use aegis_control_plane::reload::{CommandEngine, ReloadOrchestrator};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Interval between reconnect attempts while the cache is unreachable
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Drift recovery: periodic ban resync, one replica at a time
const BAN_RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const BAN_RESYNC_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "aegis-control-plane")]
#[command(author = "AEGIS Team")]
#[command(version = "0.1.0")]
#[command(about = "AEGIS security policy compiler and reload orchestrator", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Render deny actions as markers only
    #[arg(long, global = true)]
    monitor: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resync bans, compile every host, then serve until interrupted
    Run,

    /// Compile one host and reload immediately
    Compile {
        /// Host id
        host: String,
    },

    /// Compile every enabled host and reload immediately
    CompileAll,

    /// Remove a host's artifact and reload
    Remove {
        /// Host id
        host: String,
    },

    /// Ban an IP globally or on one host
    Ban {
        ip: String,

        /// Restrict the ban to this host id
        #[arg(long)]
        host: Option<String>,

        /// Ban duration in seconds; 0 is permanent
        #[arg(long, default_value = "0")]
        ttl: u64,

        #[arg(long, default_value = "manual")]
        reason: String,
    },

    /// Lift a ban
    Unban {
        ip: String,

        #[arg(long)]
        host: Option<String>,
    },

    /// Rebuild cached bans from the policy store
    SyncBans,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ControlPlaneConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    let cache = Arc::new(
        RedisEnforcementCache::connect(&config.cache)
            .await
            .context("Failed to create enforcement cache client")?,
    );
    let mode = if cli.monitor { CompileMode::Monitor } else { CompileMode::Enforce };
    let control_plane = build_control_plane(&config, cache.clone(), mode);

    match cli.command {
        Commands::Run => run(control_plane, cache).await?,
        Commands::Compile { host } => {
            match control_plane.compile_and_write(&host).await? {
                Some(artifact) => info!(host_id = %host, file = %artifact.file_name, "Artifact written"),
                None => info!(host_id = %host, "Host disabled, artifact removed"),
            }
            control_plane.request_reload_immediate().await?;
        }
        Commands::CompileAll => {
            let report = control_plane.compile_all().await?;
            for (host_id, reason) in &report.failed {
                error!(%host_id, %reason, "Host failed to compile");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Remove { host } => {
            if control_plane.remove_artifact(&host).await? {
                control_plane.request_reload_immediate().await?;
            }
        }
        Commands::Ban { ip, host, ttl, reason } => {
            let entry = control_plane
                .ban(&ip, scope_of(host), Duration::from_secs(ttl), &reason)
                .await?;
            control_plane.flush().await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::Unban { ip, host } => {
            let existed = control_plane.unban(&ip, scope_of(host)).await?;
            control_plane.flush().await?;
            println!("{}", if existed { "unbanned" } else { "not banned" });
        }
        Commands::SyncBans => {
            let report = control_plane.sync_banned_ips().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn build_control_plane(
    config: &ControlPlaneConfig,
    cache: Arc<RedisEnforcementCache>,
    mode: CompileMode,
) -> ControlPlane {
    let cache: Arc<dyn EnforcementCache> = cache;
    let compiler = Compiler::new(
        ArtifactStore::new(&config.artifacts.dir),
        config.artifacts.global_file_name.clone(),
        cache.clone(),
    )
    .with_mode(mode)
    .with_key_prefix(config.cache.key_prefix.clone());
    let engine = Arc::new(CommandEngine::from_config(&config.reload));
    let orchestrator = ReloadOrchestrator::from_config(engine, &config.reload);
    let store = Arc::new(YamlDirPolicyStore::new(&config.policy.dir));

    ControlPlane::new(store, compiler, orchestrator, cache).with_policy_ttl(config.cache.policy_ttl())
}

fn scope_of(host: Option<String>) -> BanScope {
    match host {
        Some(id) => BanScope::Host(id),
        None => BanScope::Global,
    }
}

async fn run(control_plane: ControlPlane, cache: Arc<RedisEnforcementCache>) -> Result<()> {
    info!("AEGIS control plane starting");
    let reconnect = cache.spawn_reconnect_task(RECONNECT_INTERVAL);

    let report = control_plane.startup().await.context("Startup compile failed")?;
    info!(
        compiled = report.compiled.len(),
        removed = report.removed.len(),
        failed = report.failed.len(),
        "Startup complete"
    );

    let holder = format!("control-plane-{}-{:08x}", std::process::id(), rand::random::<u32>());
    let mut resync = tokio::time::interval(BAN_RESYNC_INTERVAL);
    resync.tick().await;

    loop {
        tokio::select! {
            _ = resync.tick() => {
                match control_plane.resync_bans_exclusive(&holder, BAN_RESYNC_LOCK_TTL).await {
                    Ok(Some(report)) => info!(applied = report.applied, total = report.total, "Periodic ban resync complete"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Periodic ban resync failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown requested");
                break;
            }
        }
    }

    if let Err(e) = control_plane.flush().await {
        error!(error = %e, "Final reload failed");
    }
    reconnect.abort();
    Ok(())
}
