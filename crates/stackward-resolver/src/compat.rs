use std::collections::BTreeMap;

use semver::Version;
use stackward_core::CompatibilityRule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: CompatibilityRule,
    pub detail: String,
}

/// Checks `component` at `target` against `installed` in both directions:
/// rules the target imposes on other components, and rules installed
/// components impose on this one. A version with no applicable rule is
/// unconstrained.
pub fn compatibility_violations(
    rules: &[CompatibilityRule],
    component: &str,
    target: &Version,
    installed: &BTreeMap<String, Version>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for rule in rules.iter().filter(|rule| rule.applies_to(component, target)) {
        if rule.requires == component {
            continue;
        }
        match installed.get(&rule.requires) {
            Some(version) if rule.requires_req.matches(version) => {}
            Some(version) => violations.push(Violation {
                rule: rule.clone(),
                detail: format!(
                    "{component} {target} requires {} {}, installed {version}",
                    rule.requires, rule.requires_req
                ),
            }),
            None => violations.push(Violation {
                rule: rule.clone(),
                detail: format!(
                    "{component} {target} requires {} {}, which is not installed",
                    rule.requires, rule.requires_req
                ),
            }),
        }
    }

    for rule in rules
        .iter()
        .filter(|rule| rule.requires == component && rule.component != component)
    {
        let Some(dependent_version) = installed.get(&rule.component) else {
            continue;
        };
        if rule.version_req.matches(dependent_version) && !rule.requires_req.matches(target) {
            violations.push(Violation {
                rule: rule.clone(),
                detail: format!(
                    "installed {} {dependent_version} requires {component} {}, target is {target}",
                    rule.component, rule.requires_req
                ),
            });
        }
    }

    violations
}
