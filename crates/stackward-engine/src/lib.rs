mod artifact;
mod engine;
mod executor;
mod planner;
mod report;

pub use artifact::download_spec;
pub use engine::{Engine, EngineParts, RollbackTarget};
pub use executor::ApplyOptions;
pub use planner::{PlanOptions, Proposal};
pub use report::{
    ApplyReport, CheckEntry, CleanupSummary, ComponentReport, ComponentStatus, Disposition,
    ExitStatus, LockView, RollbackReport, RunSummary, StatusReport,
};

#[cfg(test)]
mod tests;
