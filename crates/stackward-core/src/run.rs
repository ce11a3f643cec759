use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::plan::UpgradePlan;

/// Run-level state of the upgrade state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Planning,
    BackingUp,
    Upgrading,
    Validating,
    Completed,
    RollingBack,
    RolledBack,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Planning => "PLANNING",
            Self::BackingUp => "BACKING_UP",
            Self::Upgrading => "UPGRADING",
            Self::Validating => "VALIDATING",
            Self::Completed => "COMPLETED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// States from which a new run may be started.
    pub fn allows_new_run(&self) -> bool {
        matches!(self, Self::Idle) || self.is_terminal()
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        match (self, next) {
            (Idle | Completed | RolledBack | Failed, Planning) => true,
            (Planning, BackingUp) => true,
            (BackingUp, Upgrading) => true,
            (Upgrading, Validating) => true,
            (Upgrading | Validating, RollingBack) => true,
            // the next component in the plan starts its own backup
            (Planning | BackingUp | Upgrading | Validating | RollingBack, BackingUp) => true,
            // an install interrupted before the swap is retried in place
            (Upgrading, Upgrading) => true,
            (from, Completed | RolledBack | Failed) => !from.is_terminal() && *from != Idle,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-component sub-status inside a run. This is the only record of how far
/// a component got; resumption reads nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    BackingUp,
    BackedUp,
    Upgrading,
    Validating,
    Completed,
    /// Not attempted: dependency unresolved, component held, or the plan was
    /// aborted after an earlier failure.
    Skipped,
    /// Medium/high risk without operator approval.
    AwaitingApproval,
    /// Compatibility, blacklist, or downgrade rejection.
    Rejected,
    /// Failed before anything was mutated.
    Failed,
    RollingBack,
    RolledBack,
    ManualIntervention,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::BackingUp => "backing_up",
            Self::BackedUp => "backed_up",
            Self::Upgrading => "upgrading",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::ManualIntervention => "manual_intervention",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Skipped
                | Self::AwaitingApproval
                | Self::Rejected
                | Self::Failed
                | Self::RolledBack
                | Self::ManualIntervention
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::RolledBack | Self::ManualIntervention
        )
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::Rejected)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStep {
    pub component: String,
    pub status: StepStatus,
    #[serde(default)]
    pub rollback_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub detail: Option<String>,
    pub updated_at_unix: u64,
}

impl ComponentStep {
    pub fn pending(component: &str, now_unix: u64) -> Self {
        Self {
            component: component.to_string(),
            status: StepStatus::Pending,
            rollback_id: None,
            attempts: 0,
            detail: None,
            updated_at_unix: now_unix,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NoOp,
    RolledBack,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NoOp => "no_op",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn terminal_state(&self) -> RunState {
        match self {
            Self::Completed | Self::NoOp => RunState::Completed,
            Self::RolledBack => RunState::RolledBack,
            Self::Failed => RunState::Failed,
        }
    }
}

/// Operator choices captured at run start so a resumed run behaves the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunOptions {
    pub allow_risky: bool,
    pub force: bool,
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRun {
    pub run_id: String,
    pub plan: UpgradePlan,
    pub state: RunState,
    pub current_index: usize,
    pub steps: Vec<ComponentStep>,
    pub started_at_unix: u64,
    #[serde(default)]
    pub completed_at_unix: Option<u64>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    pub owner_pid: u32,
    #[serde(default)]
    pub options: RunOptions,
}

impl UpgradeRun {
    pub fn new(
        run_id: String,
        plan: UpgradePlan,
        options: RunOptions,
        started_at_unix: u64,
        owner_pid: u32,
    ) -> Self {
        let steps = plan
            .entries
            .iter()
            .map(|entry| ComponentStep::pending(&entry.component, started_at_unix))
            .collect();
        Self {
            run_id,
            plan,
            state: RunState::Idle,
            current_index: 0,
            steps,
            started_at_unix,
            completed_at_unix: None,
            outcome: None,
            owner_pid,
            options,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves the run to `next`, refusing transitions the state machine does
    /// not allow.
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(anyhow!(
                "run {} cannot move from {} to {}",
                self.run_id,
                self.state,
                next
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn step(&self, component: &str) -> Option<&ComponentStep> {
        self.steps.iter().find(|step| step.component == component)
    }

    /// Outcome implied by the settled steps.
    pub fn derive_outcome(&self) -> RunOutcome {
        if self.steps.iter().any(|step| {
            matches!(
                step.status,
                StepStatus::Failed | StepStatus::ManualIntervention
            )
        }) {
            return RunOutcome::Failed;
        }
        if self
            .steps
            .iter()
            .any(|step| step.status == StepStatus::RolledBack)
        {
            return RunOutcome::RolledBack;
        }
        if self
            .steps
            .iter()
            .all(|step| step.status != StepStatus::Completed)
        {
            return RunOutcome::NoOp;
        }
        RunOutcome::Completed
    }
}

pub fn run_id_for(started_at_unix: u64, pid: u32) -> String {
    format!("run-{started_at_unix}-{pid}")
}
