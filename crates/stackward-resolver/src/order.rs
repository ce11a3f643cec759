use std::collections::{BTreeMap, BTreeSet};

use stackward_core::{parse_version, CompatibilityRule, PlanEntry};
use tracing::warn;

/// Orders plan entries so that a component's requirements are upgraded
/// before it. Independent entries keep name order; entries caught in a
/// cycle are appended in name order.
pub fn order_plan_entries(entries: Vec<PlanEntry>, rules: &[CompatibilityRule]) -> Vec<PlanEntry> {
    let mut by_name: BTreeMap<String, PlanEntry> = entries
        .into_iter()
        .map(|entry| (entry.component.clone(), entry))
        .collect();

    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
    let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, entry) in &by_name {
        let deps = parse_version(&entry.to_version)
            .map(|target| {
                rules
                    .iter()
                    .filter(|rule| rule.applies_to(name, &target))
                    .map(|rule| rule.requires.clone())
                    .filter(|dep| dep != name && by_name.contains_key(dep))
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        in_degree.insert(name.clone(), deps.len());
        for dep in deps {
            reverse.entry(dep).or_default().insert(name.clone());
        }
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter_map(|(name, degree)| (*degree == 0).then_some(name.clone()))
        .collect();
    let mut ordered = Vec::with_capacity(by_name.len());

    while let Some(next) = ready.pop_first() {
        if let Some(children) = reverse.get(&next) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(child.clone());
                    }
                }
            }
        }
        if let Some(entry) = by_name.remove(&next) {
            ordered.push(entry);
        }
    }

    if !by_name.is_empty() {
        warn!(
            components = %by_name.keys().cloned().collect::<Vec<_>>().join(", "),
            "compatibility requirements form a cycle; upgrading in name order"
        );
        ordered.extend(by_name.into_values());
    }

    ordered
}
