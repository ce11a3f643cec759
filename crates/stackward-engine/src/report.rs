use std::fmt;

use serde::Serialize;
use stackward_core::{
    ComponentRecord, RiskLevel, RollbackPoint, RunOutcome, RunState, StepStatus, UpgradeRun,
};
use stackward_installer::CleanupReport;
use stackward_registry::SweepReport;
use stackward_store::LockStatus;

/// Process exit status of an engine command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Failure,
    /// Manual approval required, rejected, or held.
    Blocked,
}

impl ExitStatus {
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Blocked => 2,
        }
    }

    /// Failure outranks blocked, which outranks success.
    pub fn worst(self, other: ExitStatus) -> ExitStatus {
        match (self, other) {
            (Self::Failure, _) | (_, Self::Failure) => Self::Failure,
            (Self::Blocked, _) | (_, Self::Blocked) => Self::Blocked,
            _ => Self::Success,
        }
    }
}

/// Where a component ended up after planning or applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    UpToDate,
    /// Would be upgraded; only reported by previews.
    Planned,
    Upgraded,
    AwaitingApproval,
    Rejected,
    Held,
    Skipped,
    Unresolved,
    Failed,
    RolledBack,
    ManualIntervention,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "up-to-date",
            Self::Planned => "planned",
            Self::Upgraded => "upgraded",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Rejected => "rejected",
            Self::Held => "held",
            Self::Skipped => "skipped",
            Self::Unresolved => "unresolved",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
            Self::ManualIntervention => "manual-intervention",
        }
    }

    pub fn from_step(status: StepStatus) -> Self {
        match status {
            StepStatus::Completed => Self::Upgraded,
            StepStatus::AwaitingApproval => Self::AwaitingApproval,
            StepStatus::Rejected => Self::Rejected,
            StepStatus::Failed => Self::Failed,
            StepStatus::RolledBack => Self::RolledBack,
            StepStatus::ManualIntervention => Self::ManualIntervention,
            StepStatus::Skipped => Self::Skipped,
            StepStatus::Pending
            | StepStatus::BackingUp
            | StepStatus::BackedUp
            | StepStatus::Upgrading
            | StepStatus::Validating
            | StepStatus::RollingBack => Self::Planned,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Unresolved | Self::Failed | Self::RolledBack | Self::ManualIntervention => {
                ExitStatus::Failure
            }
            Self::AwaitingApproval | Self::Rejected | Self::Held => ExitStatus::Blocked,
            Self::UpToDate | Self::Planned | Self::Upgraded | Self::Skipped => ExitStatus::Success,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentReport {
    pub component: String,
    pub disposition: Disposition,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub risk: Option<RiskLevel>,
    pub rollback_id: Option<String>,
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ComponentReport {
    pub fn new(component: &str, disposition: Disposition) -> Self {
        Self {
            component: component.to_string(),
            disposition,
            from_version: None,
            to_version: None,
            risk: None,
            rollback_id: None,
            detail: None,
            warnings: Vec::new(),
        }
    }
}

/// Result of `apply`, `resume` and `ensure_upgraded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// `None` when nothing was persisted: previews and no-op runs.
    pub run_id: Option<String>,
    pub plan_id: Option<u64>,
    /// `None` for previews.
    pub outcome: Option<RunOutcome>,
    pub dry_run: bool,
    /// The run was interrupted earlier and has been driven to completion.
    pub resumed: bool,
    pub components: Vec<ComponentReport>,
}

impl ApplyReport {
    pub fn exit_status(&self) -> ExitStatus {
        self.components
            .iter()
            .fold(ExitStatus::Success, |status, component| {
                status.worst(component.disposition.exit_status())
            })
    }

    pub fn component(&self, name: &str) -> Option<&ComponentReport> {
        self.components
            .iter()
            .find(|component| component.component == name)
    }

    pub fn rolled_back(&self) -> Vec<&str> {
        self.with_disposition(Disposition::RolledBack)
    }

    pub fn needing_intervention(&self) -> Vec<&str> {
        self.with_disposition(Disposition::ManualIntervention)
    }

    fn with_disposition(&self, disposition: Disposition) -> Vec<&str> {
        self.components
            .iter()
            .filter(|component| component.disposition == disposition)
            .map(|component| component.component.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckEntry {
    pub component: String,
    pub installed_version: Option<String>,
    pub available_version: Option<String>,
    pub source: Option<String>,
    pub held: bool,
    pub error: Option<String>,
}

impl CheckEntry {
    pub fn update_available(&self) -> bool {
        match (&self.installed_version, &self.available_version) {
            (Some(installed), Some(available)) => installed != available,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub component: String,
    pub rollback_id: Option<String>,
    pub from_version: String,
    pub to_version: String,
    /// The chosen point already matches the installed version.
    pub not_needed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plan_id: u64,
    pub state: RunState,
    pub outcome: Option<RunOutcome>,
    pub started_at_unix: u64,
    pub completed_at_unix: Option<u64>,
    pub owner_pid: u32,
    pub steps: Vec<(String, StepStatus)>,
}

impl From<&UpgradeRun> for RunSummary {
    fn from(run: &UpgradeRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            plan_id: run.plan.plan_id,
            state: run.state,
            outcome: run.outcome,
            started_at_unix: run.started_at_unix,
            completed_at_unix: run.completed_at_unix,
            owner_pid: run.owner_pid,
            steps: run
                .steps
                .iter()
                .map(|step| (step.component.clone(), step.status))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LockView {
    Free,
    Held { pid: u32, run_id: Option<String> },
    Stale { pid: u32, run_id: Option<String> },
    Corrupt,
    Empty,
}

impl From<LockStatus> for LockView {
    fn from(status: LockStatus) -> Self {
        match status {
            LockStatus::Free => Self::Free,
            LockStatus::Held(owner) => Self::Held {
                pid: owner.pid,
                run_id: owner.run_id,
            },
            LockStatus::Stale(owner) => Self::Stale {
                pid: owner.pid,
                run_id: owner.run_id,
            },
            LockStatus::Corrupt => Self::Corrupt,
            LockStatus::Empty => Self::Empty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub component: String,
    /// `None` for configured components that were never installed or adopted.
    pub record: Option<ComponentRecord>,
    pub rollback_points: usize,
    pub latest_point: Option<RollbackPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub components: Vec<ComponentStatus>,
    pub active_run: Option<RunSummary>,
    pub last_run: Option<RunSummary>,
    pub lock: LockView,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub removed_points: Vec<String>,
    pub retained_points: usize,
    pub cache_removed: usize,
    pub cache_retained_offline: usize,
    pub scratch_entries_removed: usize,
}

impl CleanupSummary {
    pub fn new(rollback: CleanupReport, cache: SweepReport, scratch_entries_removed: usize) -> Self {
        Self {
            removed_points: rollback.removed,
            retained_points: rollback.retained,
            cache_removed: cache.removed,
            cache_retained_offline: cache.retained_offline,
            scratch_entries_removed,
        }
    }
}
