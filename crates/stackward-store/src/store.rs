use anyhow::Result;
use stackward_core::{
    BreakingChangeRecord, CompatibilityRule, ComponentRecord, RollbackPoint, UpgradeRun,
    VersionCacheEntry,
};

/// Persisted engine state.
///
/// Writers are serialized by the host lock, so implementations only need to
/// make each individual write atomic.
pub trait StateStore: Send + Sync {
    fn components(&self) -> Result<Vec<ComponentRecord>>;

    fn component(&self, name: &str) -> Result<Option<ComponentRecord>> {
        Ok(self
            .components()?
            .into_iter()
            .find(|record| record.name == name))
    }

    /// Inserts or replaces the record with the same name.
    fn put_component(&self, record: &ComponentRecord) -> Result<()>;

    /// Allocates the next monotonic plan id.
    fn next_plan_id(&self) -> Result<u64>;

    fn save_run(&self, run: &UpgradeRun) -> Result<()>;

    fn load_run(&self, run_id: &str) -> Result<Option<UpgradeRun>>;

    /// All runs, oldest first.
    fn runs(&self) -> Result<Vec<UpgradeRun>>;

    /// The most recent run that has not reached a terminal state.
    fn active_run(&self) -> Result<Option<UpgradeRun>> {
        Ok(self.runs()?.into_iter().rev().find(|run| !run.is_terminal()))
    }

    fn put_rollback_point(&self, point: &RollbackPoint) -> Result<()>;

    fn rollback_point(&self, id: &str) -> Result<Option<RollbackPoint>> {
        Ok(self
            .rollback_points(None)?
            .into_iter()
            .find(|point| point.id == id))
    }

    /// Points oldest first, optionally restricted to one component.
    fn rollback_points(&self, component: Option<&str>) -> Result<Vec<RollbackPoint>>;

    fn remove_rollback_point(&self, id: &str) -> Result<()>;

    fn cache_entry(&self, component: &str, key: &str) -> Result<Option<VersionCacheEntry>> {
        Ok(self
            .cache_entries()?
            .into_iter()
            .find(|entry| entry.component == component && entry.cache_key == key))
    }

    fn cache_entries(&self) -> Result<Vec<VersionCacheEntry>>;

    /// Inserts or replaces the entry with the same component and key.
    fn put_cache_entry(&self, entry: &VersionCacheEntry) -> Result<()>;

    fn remove_cache_entries(&self, component: &str, keys: Option<&[String]>) -> Result<usize>;

    fn compatibility_rules(&self) -> Result<Vec<CompatibilityRule>>;

    fn replace_compatibility_rules(&self, rules: &[CompatibilityRule]) -> Result<()>;

    fn breaking_changes(&self) -> Result<Vec<BreakingChangeRecord>>;

    fn replace_breaking_changes(&self, records: &[BreakingChangeRecord]) -> Result<()>;
}

pub(crate) fn sort_runs(runs: &mut [UpgradeRun]) {
    runs.sort_by(|left, right| {
        left.started_at_unix
            .cmp(&right.started_at_unix)
            .then_with(|| left.run_id.cmp(&right.run_id))
    });
}

pub(crate) fn sort_points(points: &mut [RollbackPoint]) {
    points.sort_by(|left, right| {
        left.created_at_unix
            .cmp(&right.created_at_unix)
            .then_with(|| left.id.cmp(&right.id))
    });
}

pub(crate) fn upsert_component(records: &mut Vec<ComponentRecord>, record: &ComponentRecord) {
    match records.iter_mut().find(|existing| existing.name == record.name) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
    records.sort_by(|left, right| left.name.cmp(&right.name));
}

pub(crate) fn upsert_cache_entry(entries: &mut Vec<VersionCacheEntry>, entry: &VersionCacheEntry) {
    match entries.iter_mut().find(|existing| {
        existing.component == entry.component && existing.cache_key == entry.cache_key
    }) {
        Some(existing) => *existing = entry.clone(),
        None => entries.push(entry.clone()),
    }
}

pub(crate) fn retain_cache_entries(
    entries: &mut Vec<VersionCacheEntry>,
    component: &str,
    keys: Option<&[String]>,
) -> usize {
    let before = entries.len();
    entries.retain(|entry| {
        let matches = entry.component == component
            && keys.map_or(true, |keys| keys.iter().any(|key| key == &entry.cache_key));
        !matches
    });
    before - entries.len()
}
