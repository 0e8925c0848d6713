// Library interface for the AEGIS control plane
// Compiles host security policy into proxy artifacts, coordinates reloads
// and serves the shared enforcement state

pub mod compiler;
pub mod config;
pub mod control_plane;
pub mod enforcement;
pub mod lock_utils;
pub mod patterns;
pub mod policy;
pub mod policy_store;
pub mod reload;

pub use compiler::{compile, CompileError, CompileMode, Compiler, ConfigArtifact, Pipeline, Stage};
pub use config::ControlPlaneConfig;
pub use control_plane::{CompileAllReport, ControlPlane, ControlPlaneError};
pub use enforcement::{CacheError, EnforcementCache, FailOpen, RateLimitResult};
pub use policy::{BanScope, BannedIpEntry, GlobalSecurityProfile, HostSecurityProfile};
pub use policy_store::{PolicyStore, StoreError};
pub use reload::{ProxyEngine, ReloadError, ReloadOrchestrator, ReloadState};
