use std::collections::BTreeMap;
use std::fmt;

use semver::Version;
use stackward_core::{is_downgrade, BreakingChangeRecord, CompatibilityRule, RiskLevel, Severity};
use tracing::debug;

use crate::compat::compatibility_violations;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvaluationOptions {
    /// Bypasses downgrade, compatibility, and blacklist denials.
    pub force: bool,
    /// Operator approval for medium and high risk.
    pub allow_risky: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    ManualReview,
    Deny,
    NoChange,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::ManualReview => "manual_review",
            Self::Deny => "deny",
            Self::NoChange => "no_change",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub approved: bool,
    pub decision: Decision,
    pub risk: RiskLevel,
    pub checks: Vec<Check>,
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|check| !check.passed)
    }

    /// Details of the failed checks, joined for display.
    pub fn reason(&self) -> String {
        let reasons = self
            .failed_checks()
            .map(|check| check.detail.as_str())
            .collect::<Vec<_>>();
        if reasons.is_empty() {
            format!("{} risk", self.risk)
        } else {
            reasons.join("; ")
        }
    }
}

pub struct EvaluationInput<'a> {
    pub component: &'a str,
    /// `None` for a fresh install.
    pub from: Option<&'a Version>,
    pub to: &'a Version,
    /// Installed versions with earlier approved plan entries projected in.
    pub installed: &'a BTreeMap<String, Version>,
    pub blacklist: &'a [Version],
}

pub struct Evaluator {
    rules: Vec<CompatibilityRule>,
    breaking: Vec<BreakingChangeRecord>,
}

impl Evaluator {
    pub fn new(rules: Vec<CompatibilityRule>, breaking: Vec<BreakingChangeRecord>) -> Self {
        Self { rules, breaking }
    }

    pub fn rules(&self) -> &[CompatibilityRule] {
        &self.rules
    }

    pub fn evaluate(&self, input: &EvaluationInput<'_>, options: EvaluationOptions) -> Verdict {
        let component = input.component;
        let to = input.to;
        let mut checks = Vec::new();
        let mut warnings = Vec::new();

        if input.from == Some(to) {
            return Verdict {
                approved: true,
                decision: Decision::NoChange,
                risk: RiskLevel::Low,
                checks,
                warnings,
            };
        }

        let mut risk = match input.from {
            Some(from) => distance_risk(from, to),
            None if !to.pre.is_empty() => RiskLevel::Medium,
            None => RiskLevel::Low,
        };
        let mut hard_failure = false;

        if let Some(from) = input.from {
            let downgrade = is_downgrade(from, to);
            checks.push(Check {
                name: "downgrade",
                passed: !downgrade,
                detail: if downgrade {
                    format!("{component} {to} is older than installed {from}")
                } else {
                    format!("{from} -> {to} moves forward")
                },
            });
            if downgrade {
                risk = risk.escalate(RiskLevel::High);
                hard_failure = true;
            }

            let crossed = self
                .breaking
                .iter()
                .filter(|record| record.crossed_by(component, from, to))
                .collect::<Vec<_>>();
            for record in &crossed {
                let floor = match record.severity {
                    Severity::Minor => RiskLevel::Medium,
                    Severity::Major | Severity::Critical => RiskLevel::High,
                };
                risk = risk.escalate(floor);
                warnings.push(format!(
                    "{} breaking change in {}: {}",
                    record.severity.as_str(),
                    record.to_version,
                    record.description
                ));
            }
            checks.push(Check {
                name: "breaking_changes",
                passed: crossed.is_empty(),
                detail: if crossed.is_empty() {
                    "no recorded breaking changes crossed".to_string()
                } else {
                    format!("{} recorded breaking change(s) crossed", crossed.len())
                },
            });
        }

        let violations = compatibility_violations(&self.rules, component, to, input.installed);
        checks.push(Check {
            name: "compatibility",
            passed: violations.is_empty(),
            detail: if violations.is_empty() {
                "compatible with installed components".to_string()
            } else {
                violations
                    .iter()
                    .map(|violation| violation.detail.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            },
        });
        if !violations.is_empty() {
            risk = risk.escalate(RiskLevel::High);
            hard_failure = true;
        }

        let blacklisted = input.blacklist.contains(to);
        checks.push(Check {
            name: "blacklist",
            passed: !blacklisted,
            detail: if blacklisted {
                format!("{component} {to} is blacklisted")
            } else {
                "target not blacklisted".to_string()
            },
        });
        if blacklisted {
            risk = risk.escalate(RiskLevel::High);
            hard_failure = true;
        }

        let all_passed = checks.iter().all(|check| check.passed);
        let decision = if hard_failure && !options.force {
            Decision::Deny
        } else if risk == RiskLevel::Low && all_passed {
            Decision::Approve
        } else if options.allow_risky || options.force {
            if hard_failure {
                warnings.push("failed checks overridden by force".to_string());
            }
            Decision::Approve
        } else {
            Decision::ManualReview
        };

        debug!(component, %to, %risk, %decision, "evaluated transition");
        Verdict {
            approved: decision == Decision::Approve,
            decision,
            risk,
            checks,
            warnings,
        }
    }
}

/// Risk implied by version distance alone. A major bump is high, skipping
/// more than one minor release is medium, anything smaller is low. A
/// prerelease target raises the level by one.
pub fn distance_risk(from: &Version, to: &Version) -> RiskLevel {
    let base = if to.major != from.major {
        RiskLevel::High
    } else if to.minor.abs_diff(from.minor) > 1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    if to.pre.is_empty() {
        base
    } else {
        base.bump()
    }
}
