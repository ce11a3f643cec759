use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use semver::Version;
use stackward_core::{
    parse_version, ComponentConfig, ComponentRecord, PlanEntry, RiskLevel, UpgradeError,
};
use stackward_resolver::{
    order_plan_entries, Decision, EvaluationInput, EvaluationOptions, ResolveRequest,
};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::report::{ApplyReport, CheckEntry, ComponentReport, Disposition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Restricts planning to these components. Empty means all configured.
    pub components: Vec<String>,
    /// Exact version for the single selected component.
    pub version_override: Option<String>,
    pub allow_risky: bool,
    pub force: bool,
}

/// An evaluated but not yet persisted plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub created_at_unix: u64,
    /// Every component whose target differs from what is installed, in
    /// execution order, including blocked ones.
    pub entries: Vec<PlanEntry>,
    /// Plan entries first, in order, then the rest in config order.
    pub components: Vec<ComponentReport>,
}

impl Proposal {
    pub fn report(&self, component: &str) -> Option<&ComponentReport> {
        self.components
            .iter()
            .find(|report| report.component == component)
    }

    /// Entries that would actually be installed.
    pub fn actionable(&self) -> usize {
        self.components
            .iter()
            .filter(|report| report.disposition == Disposition::Planned)
            .count()
    }

    /// Reports for components with no plan entry.
    pub(crate) fn outside_plan(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components.iter().filter(|report| {
            !self
                .entries
                .iter()
                .any(|entry| entry.component == report.component)
        })
    }

    pub fn preview(&self) -> ApplyReport {
        ApplyReport {
            run_id: None,
            plan_id: None,
            outcome: None,
            dry_run: true,
            resumed: false,
            components: self.components.clone(),
        }
    }
}

impl Engine {
    /// Resolves the latest available version of each component without
    /// evaluating or planning anything.
    pub fn check(&self, components: &[String]) -> Result<Vec<CheckEntry>> {
        let records = self.records()?;
        let mut entries = Vec::new();
        for config in self.select_components(components)? {
            let record = records.get(&config.name);
            let mut entry = CheckEntry {
                component: config.name.clone(),
                installed_version: record.map(|record| record.installed_version.clone()),
                available_version: None,
                source: None,
                held: record.is_some_and(ComponentRecord::is_held),
                error: None,
            };
            match self.resolver.resolve(config, None) {
                Ok(resolution) => {
                    entry.available_version = Some(resolution.version.to_string());
                    entry.source = Some(resolution.source);
                }
                Err(err) => entry.error = Some(format!("{err:#}")),
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Resolves targets, orders them by their requirements, and evaluates
    /// each transition against the installed set with earlier approved
    /// entries projected in.
    pub fn plan(&self, options: &PlanOptions) -> Result<Proposal> {
        let selected = self.select_components(&options.components)?;
        if options.version_override.is_some() && selected.len() != 1 {
            return Err(UpgradeError::Config(
                "a version override needs exactly one component".to_string(),
            )
            .into());
        }

        let records = self.records()?;
        let mut installed = BTreeMap::new();
        for record in records.values() {
            match parse_version(&record.installed_version) {
                Ok(version) => {
                    installed.insert(record.name.clone(), version);
                }
                Err(err) => warn!(
                    component = %record.name,
                    error = %format!("{err:#}"),
                    "installed version is not semver; ignored for compatibility checks"
                ),
            }
        }

        let mut reports: BTreeMap<String, ComponentReport> = BTreeMap::new();
        let mut candidates = Vec::new();
        let mut unavailable = BTreeSet::new();
        for config in &selected {
            let name = config.name.as_str();
            let record = records.get(name);
            let request = ResolveRequest {
                component: config,
                strategy: config.strategy,
                version_override: options.version_override.as_deref(),
            };
            let resolution = match self.resolver.resolve_request(&request) {
                Ok(resolution) => resolution,
                Err(err) => {
                    warn!(component = name, error = %format!("{err:#}"), "no target version");
                    let mut report = ComponentReport::new(name, Disposition::Unresolved);
                    report.from_version = record.map(|record| record.installed_version.clone());
                    report.detail = Some(format!("{err:#}"));
                    reports.insert(name.to_string(), report);
                    unavailable.insert(name.to_string());
                    continue;
                }
            };

            let target = resolution.version;
            let mut report = ComponentReport::new(name, Disposition::UpToDate);
            report.from_version = record.map(|record| record.installed_version.clone());
            report.to_version = Some(target.to_string());
            report.detail = Some(format!("resolved from {}", resolution.source));

            let current = installed.get(name);
            if let Some(hold) = record.and_then(|record| record.hold.as_ref()) {
                report.disposition = Disposition::Held;
                report.detail = Some(format!("on hold: {}", hold.reason));
            }
            if current != Some(&target) {
                candidates.push(PlanEntry {
                    component: name.to_string(),
                    from_version: record.map(|record| record.installed_version.clone()),
                    to_version: target.to_string(),
                    risk: RiskLevel::Low,
                });
            }
            reports.insert(name.to_string(), report);
        }

        let mut entries = order_plan_entries(candidates, self.evaluator.rules());
        let mut projected = installed.clone();
        for entry in &mut entries {
            let Some(report) = reports.get_mut(&entry.component) else {
                continue;
            };
            if report.disposition == Disposition::Held {
                continue;
            }
            let to = parse_version(&entry.to_version)?;

            if let Some(missing) = self.blocked_requirement(&entry.component, &to, &unavailable) {
                report.disposition = Disposition::Skipped;
                report.detail = Some(format!("requirement '{missing}' has no usable target"));
                unavailable.insert(entry.component.clone());
                continue;
            }

            let Some(config) = self.config.component(&entry.component) else {
                continue;
            };
            let blacklist = blacklist_versions(config);
            let from = installed.get(&entry.component).cloned();
            let verdict = self.evaluator.evaluate(
                &EvaluationInput {
                    component: &entry.component,
                    from: from.as_ref(),
                    to: &to,
                    installed: &projected,
                    blacklist: &blacklist,
                },
                EvaluationOptions {
                    force: options.force,
                    allow_risky: options.allow_risky,
                },
            );
            entry.risk = verdict.risk;
            report.risk = Some(verdict.risk);
            report.warnings = verdict.warnings.clone();

            match verdict.decision {
                Decision::Approve => {
                    report.disposition = Disposition::Planned;
                    projected.insert(entry.component.clone(), to);
                }
                Decision::NoChange => report.disposition = Disposition::UpToDate,
                Decision::ManualReview => {
                    report.disposition = Disposition::AwaitingApproval;
                    report.detail = Some(
                        UpgradeError::ManualApprovalRequired {
                            component: entry.component.clone(),
                            to: entry.to_version.clone(),
                            risk: verdict.risk,
                        }
                        .to_string(),
                    );
                }
                Decision::Deny => {
                    report.disposition = Disposition::Rejected;
                    report.detail = Some(
                        UpgradeError::CompatibilityRejected {
                            component: entry.component.clone(),
                            from: entry
                                .from_version
                                .clone()
                                .unwrap_or_else(|| "none".to_string()),
                            to: entry.to_version.clone(),
                            reason: verdict.reason(),
                        }
                        .to_string(),
                    );
                }
            }
        }

        let mut ordered = Vec::with_capacity(reports.len());
        for entry in &entries {
            if let Some(report) = reports.remove(&entry.component) {
                ordered.push(report);
            }
        }
        for config in &selected {
            if let Some(report) = reports.remove(&config.name) {
                ordered.push(report);
            }
        }

        let proposal = Proposal {
            created_at_unix: self.clock.now_unix(),
            entries,
            components: ordered,
        };
        info!(
            entries = proposal.entries.len(),
            actionable = proposal.actionable(),
            "upgrade plan evaluated"
        );
        Ok(proposal)
    }

    /// First requirement of `component` at `target` that is in `unavailable`.
    fn blocked_requirement(
        &self,
        component: &str,
        target: &Version,
        unavailable: &BTreeSet<String>,
    ) -> Option<String> {
        self.evaluator
            .rules()
            .iter()
            .filter(|rule| rule.applies_to(component, target))
            .find(|rule| unavailable.contains(&rule.requires))
            .map(|rule| rule.requires.clone())
    }

    pub(crate) fn select_components(&self, names: &[String]) -> Result<Vec<&ComponentConfig>> {
        if names.is_empty() {
            return Ok(self.config.components.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.config.component(name).ok_or_else(|| {
                    anyhow::Error::from(UpgradeError::UnknownComponent(name.clone()))
                })
            })
            .collect()
    }

    pub(crate) fn records(&self) -> Result<BTreeMap<String, ComponentRecord>> {
        Ok(self
            .store
            .components()?
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect())
    }
}

fn blacklist_versions(config: &ComponentConfig) -> Vec<Version> {
    config
        .blacklist
        .iter()
        .filter_map(|raw| parse_version(raw).ok())
        .collect()
}
