mod compat;
mod evaluate;
mod order;
mod resolve;
mod sources;

pub use compat::{compatibility_violations, Violation};
pub use evaluate::{
    distance_risk, Check, Decision, EvaluationInput, EvaluationOptions, Evaluator, Verdict,
};
pub use order::order_plan_entries;
pub use resolve::{Resolution, Resolver};
pub use sources::{
    ConfigFallbackSource, ManifestSource, OverrideSource, PinSource, ResolveRequest,
    StrategySource, VersionSource,
};
