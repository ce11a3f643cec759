mod clock;
mod component;
mod config;
mod error;
mod event;
mod layout;
mod manifest;
mod plan;
mod reference;
mod run;
mod strategy;
mod version;

pub use clock::{current_unix_timestamp, Clock, ManualClock, SystemClock};
pub use component::{ComponentHold, ComponentRecord, InstallMethod};
pub use config::{
    expand_url_template, pin_env_var, CacheConfig, ComponentConfig, EngineConfig, HealthConfig,
    RegistryConfig, RetentionConfig, StackwardConfig, OFFLINE_ENV, PIN_ENV_PREFIX, TOKEN_ENV,
};
pub use error::UpgradeError;
pub use event::{Event, EventKind, EventSink, JsonlEventSink, MemoryEventSink};
pub use layout::HostLayout;
pub use manifest::{ComponentManifest, ManifestBreakingChange};
pub use plan::{PlanEntry, RiskLevel, UpgradePlan};
pub use reference::{
    BreakingChangeRecord, CompatibilityRule, RollbackPoint, Severity, VersionCacheEntry,
};
pub use run::{
    run_id_for, ComponentStep, RunOptions, RunOutcome, RunState, StepStatus, UpgradeRun,
};
pub use strategy::Strategy;
pub use version::{is_downgrade, parse_version};
