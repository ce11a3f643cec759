use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use stackward_core::{
    BreakingChangeRecord, CompatibilityRule, ComponentRecord, RollbackPoint, UpgradeRun,
    VersionCacheEntry,
};

use crate::store::{
    retain_cache_entries, sort_points, sort_runs, upsert_cache_entry, upsert_component,
    StateStore,
};

#[derive(Debug, Default)]
struct Tables {
    components: Vec<ComponentRecord>,
    next_plan_id: u64,
    runs: BTreeMap<String, UpgradeRun>,
    rollback_points: Vec<RollbackPoint>,
    cache: Vec<VersionCacheEntry>,
    compatibility: Vec<CompatibilityRule>,
    breaking: Vec<BreakingChangeRecord>,
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory state store lock poisoned"))
    }
}

impl StateStore for MemoryStateStore {
    fn components(&self) -> Result<Vec<ComponentRecord>> {
        Ok(self.tables()?.components.clone())
    }

    fn put_component(&self, record: &ComponentRecord) -> Result<()> {
        upsert_component(&mut self.tables()?.components, record);
        Ok(())
    }

    fn next_plan_id(&self) -> Result<u64> {
        let mut tables = self.tables()?;
        tables.next_plan_id += 1;
        Ok(tables.next_plan_id)
    }

    fn save_run(&self, run: &UpgradeRun) -> Result<()> {
        self.tables()?.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> Result<Option<UpgradeRun>> {
        Ok(self.tables()?.runs.get(run_id).cloned())
    }

    fn runs(&self) -> Result<Vec<UpgradeRun>> {
        let mut runs = self.tables()?.runs.values().cloned().collect::<Vec<_>>();
        sort_runs(&mut runs);
        Ok(runs)
    }

    fn put_rollback_point(&self, point: &RollbackPoint) -> Result<()> {
        let mut tables = self.tables()?;
        tables.rollback_points.retain(|existing| existing.id != point.id);
        tables.rollback_points.push(point.clone());
        sort_points(&mut tables.rollback_points);
        Ok(())
    }

    fn rollback_points(&self, component: Option<&str>) -> Result<Vec<RollbackPoint>> {
        Ok(self
            .tables()?
            .rollback_points
            .iter()
            .filter(|point| component.map_or(true, |name| point.component == name))
            .cloned()
            .collect())
    }

    fn remove_rollback_point(&self, id: &str) -> Result<()> {
        self.tables()?.rollback_points.retain(|point| point.id != id);
        Ok(())
    }

    fn cache_entries(&self) -> Result<Vec<VersionCacheEntry>> {
        Ok(self.tables()?.cache.clone())
    }

    fn put_cache_entry(&self, entry: &VersionCacheEntry) -> Result<()> {
        upsert_cache_entry(&mut self.tables()?.cache, entry);
        Ok(())
    }

    fn remove_cache_entries(&self, component: &str, keys: Option<&[String]>) -> Result<usize> {
        Ok(retain_cache_entries(
            &mut self.tables()?.cache,
            component,
            keys,
        ))
    }

    fn compatibility_rules(&self) -> Result<Vec<CompatibilityRule>> {
        Ok(self.tables()?.compatibility.clone())
    }

    fn replace_compatibility_rules(&self, rules: &[CompatibilityRule]) -> Result<()> {
        self.tables()?.compatibility = rules.to_vec();
        Ok(())
    }

    fn breaking_changes(&self) -> Result<Vec<BreakingChangeRecord>> {
        Ok(self.tables()?.breaking.clone())
    }

    fn replace_breaking_changes(&self, records: &[BreakingChangeRecord]) -> Result<()> {
        self.tables()?.breaking = records.to_vec();
        Ok(())
    }
}
