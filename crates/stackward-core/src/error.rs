use thiserror::Error;

use crate::plan::RiskLevel;

/// Failure taxonomy of the upgrade engine.
///
/// Plumbing errors travel as `anyhow::Error`; anything the orchestrator must
/// branch on is one of these variants, recoverable with [`UpgradeError::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("no version could be resolved for '{component}': {detail}")]
    VersionUnresolved { component: String, detail: String },

    #[error("compatibility check rejected '{component}' {from} -> {to}: {reason}")]
    CompatibilityRejected {
        component: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("upgrade of '{component}' to {to} is {risk} risk and requires manual approval")]
    ManualApprovalRequired {
        component: String,
        to: String,
        risk: RiskLevel,
    },

    #[error("download failed for '{component}' from {url}: {detail}")]
    DownloadFailed {
        component: String,
        url: String,
        detail: String,
    },

    #[error("checksum verification failed for '{component}': {detail}")]
    ChecksumMismatch { component: String, detail: String },

    #[error("install of '{component}' failed: {detail}")]
    InstallFailed { component: String, detail: String },

    #[error("snapshot of '{component}' failed: {detail}")]
    SnapshotFailed { component: String, detail: String },

    #[error("rollback of '{component}' to {rollback_id} failed: {detail}")]
    RollbackFailed {
        component: String,
        rollback_id: String,
        detail: String,
    },

    #[error("'{component}' requires manual intervention: {detail}")]
    ManualInterventionRequired { component: String, detail: String },

    #[error("another upgrade run is active (run_id={run_id} pid={owner_pid})")]
    ConcurrentRunDetected { run_id: String, owner_pid: u32 },

    #[error("'{component}' is on hold: {reason}")]
    ComponentHeld { component: String, reason: String },

    #[error("component '{0}' is not managed")]
    UnknownComponent(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    Store(String),
}

impl UpgradeError {
    /// Only failures at or after the service stop leave something to undo.
    pub fn requires_rollback(&self) -> bool {
        matches!(self, Self::InstallFailed { .. })
    }

    /// Failures strictly before the service stop; nothing was mutated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed { .. } | Self::ChecksumMismatch { .. }
        )
    }

    /// Outcomes that block the plan step instead of failing it.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::CompatibilityRejected { .. }
                | Self::ManualApprovalRequired { .. }
                | Self::ComponentHeld { .. }
        )
    }

    pub fn component(&self) -> Option<&str> {
        match self {
            Self::VersionUnresolved { component, .. }
            | Self::CompatibilityRejected { component, .. }
            | Self::ManualApprovalRequired { component, .. }
            | Self::DownloadFailed { component, .. }
            | Self::ChecksumMismatch { component, .. }
            | Self::InstallFailed { component, .. }
            | Self::SnapshotFailed { component, .. }
            | Self::RollbackFailed { component, .. }
            | Self::ManualInterventionRequired { component, .. }
            | Self::ComponentHeld { component, .. } => Some(component),
            Self::UnknownComponent(component) => Some(component),
            Self::ConcurrentRunDetected { .. } | Self::Config(_) | Self::Store(_) => None,
        }
    }

    pub fn classify(err: &anyhow::Error) -> Option<&UpgradeError> {
        err.chain().find_map(|cause| cause.downcast_ref::<UpgradeError>())
    }
}
