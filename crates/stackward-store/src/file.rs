use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stackward_core::{
    BreakingChangeRecord, CompatibilityRule, ComponentRecord, HostLayout, RollbackPoint,
    UpgradeRun, VersionCacheEntry,
};
use tracing::debug;

use crate::fs_utils::atomic_write;
use crate::store::{
    retain_cache_entries, sort_points, sort_runs, upsert_cache_entry, upsert_component,
    StateStore,
};

const COMPONENTS_TABLE: &str = "installed_components";
const ROLLBACK_TABLE: &str = "rollback_points";
const CACHE_TABLE: &str = "version_cache";
const COMPATIBILITY_TABLE: &str = "compatibility_matrix";
const BREAKING_TABLE: &str = "breaking_changes";
const META_TABLE: &str = "meta";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreMeta {
    next_plan_id: u64,
}

/// JSON documents under `<state>/db/`, one file per table and one file per
/// run in `runs/` (the upgrade history).
#[derive(Debug, Clone)]
pub struct FileStateStore {
    layout: HostLayout,
}

impl FileStateStore {
    pub fn open(layout: HostLayout) -> Result<Self> {
        for dir in [layout.db_dir(), layout.runs_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    fn read_table<T: DeserializeOwned + Default>(&self, table: &str) -> Result<T> {
        let path = self.layout.table_path(table);
        read_json_document(&path).map(Option::unwrap_or_default)
    }

    fn write_table<T: Serialize>(&self, table: &str, value: &T) -> Result<()> {
        let path = self.layout.table_path(table);
        write_json_document(&path, value)?;
        debug!(table, "state table written");
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn components(&self) -> Result<Vec<ComponentRecord>> {
        self.read_table(COMPONENTS_TABLE)
    }

    fn put_component(&self, record: &ComponentRecord) -> Result<()> {
        let mut records: Vec<ComponentRecord> = self.read_table(COMPONENTS_TABLE)?;
        upsert_component(&mut records, record);
        self.write_table(COMPONENTS_TABLE, &records)
    }

    fn next_plan_id(&self) -> Result<u64> {
        let mut meta: StoreMeta = self.read_table(META_TABLE)?;
        meta.next_plan_id = meta
            .next_plan_id
            .checked_add(1)
            .ok_or_else(|| anyhow!("plan id space exhausted"))?;
        self.write_table(META_TABLE, &meta)?;
        Ok(meta.next_plan_id)
    }

    fn save_run(&self, run: &UpgradeRun) -> Result<()> {
        write_json_document(&self.layout.run_path(&run.run_id), run)
            .with_context(|| format!("failed to persist run {}", run.run_id))
    }

    fn load_run(&self, run_id: &str) -> Result<Option<UpgradeRun>> {
        read_json_document(&self.layout.run_path(run_id))
    }

    fn runs(&self) -> Result<Vec<UpgradeRun>> {
        let dir = self.layout.runs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(run) = read_json_document::<UpgradeRun>(&path)? {
                runs.push(run);
            }
        }
        sort_runs(&mut runs);
        Ok(runs)
    }

    fn put_rollback_point(&self, point: &RollbackPoint) -> Result<()> {
        let mut points: Vec<RollbackPoint> = self.read_table(ROLLBACK_TABLE)?;
        points.retain(|existing| existing.id != point.id);
        points.push(point.clone());
        sort_points(&mut points);
        self.write_table(ROLLBACK_TABLE, &points)
    }

    fn rollback_points(&self, component: Option<&str>) -> Result<Vec<RollbackPoint>> {
        let mut points: Vec<RollbackPoint> = self.read_table(ROLLBACK_TABLE)?;
        if let Some(component) = component {
            points.retain(|point| point.component == component);
        }
        sort_points(&mut points);
        Ok(points)
    }

    fn remove_rollback_point(&self, id: &str) -> Result<()> {
        let mut points: Vec<RollbackPoint> = self.read_table(ROLLBACK_TABLE)?;
        let before = points.len();
        points.retain(|point| point.id != id);
        if points.len() != before {
            self.write_table(ROLLBACK_TABLE, &points)?;
        }
        Ok(())
    }

    fn cache_entries(&self) -> Result<Vec<VersionCacheEntry>> {
        self.read_table(CACHE_TABLE)
    }

    fn put_cache_entry(&self, entry: &VersionCacheEntry) -> Result<()> {
        let mut entries: Vec<VersionCacheEntry> = self.read_table(CACHE_TABLE)?;
        upsert_cache_entry(&mut entries, entry);
        self.write_table(CACHE_TABLE, &entries)
    }

    fn remove_cache_entries(&self, component: &str, keys: Option<&[String]>) -> Result<usize> {
        let mut entries: Vec<VersionCacheEntry> = self.read_table(CACHE_TABLE)?;
        let removed = retain_cache_entries(&mut entries, component, keys);
        if removed > 0 {
            self.write_table(CACHE_TABLE, &entries)?;
        }
        Ok(removed)
    }

    fn compatibility_rules(&self) -> Result<Vec<CompatibilityRule>> {
        self.read_table(COMPATIBILITY_TABLE)
    }

    fn replace_compatibility_rules(&self, rules: &[CompatibilityRule]) -> Result<()> {
        self.write_table(COMPATIBILITY_TABLE, &rules)
    }

    fn breaking_changes(&self) -> Result<Vec<BreakingChangeRecord>> {
        self.read_table(BREAKING_TABLE)
    }

    fn replace_breaking_changes(&self, records: &[BreakingChangeRecord]) -> Result<()> {
        self.write_table(BREAKING_TABLE, &records)
    }
}

fn read_json_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed parsing state document {}", path.display()))?;
    Ok(Some(value))
}

fn write_json_document<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut encoded = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    encoded.push(b'\n');
    atomic_write(path, &encoded)
}
