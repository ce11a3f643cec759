use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use stackward_core::{Clock, HostLayout, VersionCacheEntry};
use stackward_store::{atomic_write, remove_file_if_exists, StateStore};
use tracing::debug;

/// Upstream release metadata.
pub const RELEASE_TTL_SECS: u64 = 15 * 60;
/// Derived metadata such as resolved versions.
pub const DERIVED_TTL_SECS: u64 = 24 * 60 * 60;

pub const RELEASES_KEY: &str = "releases";
/// Single release answered by the upstream's latest-release query.
pub const LATEST_RELEASE_KEY: &str = "release:latest";
/// Version last installed by the engine; read by the `locked` strategy.
pub const LOCKED_KEY: &str = "locked";

pub fn resolved_key(strategy: &str) -> String {
    format!("resolved:{strategy}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    /// Expired entries kept because they are a component's last copy.
    pub retained_offline: usize,
}

type EntryKey = (String, String);

/// Three-tier version cache: process memory, one JSON file per component on
/// disk, and the persisted store. A hit in a slower tier back-fills the
/// faster ones.
pub struct VersionCache {
    layout: HostLayout,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    offline: bool,
    memory: Mutex<HashMap<EntryKey, VersionCacheEntry>>,
}

impl VersionCache {
    pub fn new(
        layout: HostLayout,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        offline: bool,
    ) -> Self {
        Self {
            layout,
            store,
            clock,
            offline,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Returns the cached value, or `None` when absent or past its TTL.
    /// Offline, expired entries are still returned.
    pub fn get(&self, component: &str, key: &str) -> Result<Option<String>> {
        Ok(self.get_entry(component, key)?.map(|entry| entry.value))
    }

    pub fn get_entry(&self, component: &str, key: &str) -> Result<Option<VersionCacheEntry>> {
        let now = self.clock.now_unix();
        let usable = |entry: &VersionCacheEntry| self.offline || !entry.is_expired(now);
        let memory_key = (component.to_string(), key.to_string());

        if let Some(entry) = self.memory()?.get(&memory_key).filter(|entry| usable(entry)) {
            debug!(component, key, tier = "memory", "version cache hit");
            return Ok(Some(entry.clone()));
        }

        let disk = self.read_disk(component)?;
        if let Some(entry) = disk.get(key).filter(|entry| usable(entry)) {
            debug!(component, key, tier = "disk", "version cache hit");
            self.memory()?.insert(memory_key, entry.clone());
            return Ok(Some(entry.clone()));
        }

        if let Some(entry) = self
            .store
            .cache_entry(component, key)?
            .filter(|entry| usable(entry))
        {
            debug!(component, key, tier = "store", "version cache hit");
            let mut disk = disk;
            disk.insert(key.to_string(), entry.clone());
            self.write_disk(component, &disk)?;
            self.memory()?.insert(memory_key, entry.clone());
            return Ok(Some(entry));
        }

        debug!(component, key, "version cache miss");
        Ok(None)
    }

    pub fn set(&self, component: &str, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let entry = VersionCacheEntry {
            component: component.to_string(),
            cache_key: key.to_string(),
            value: value.to_string(),
            cached_at_unix: self.clock.now_unix(),
            ttl_secs,
        };

        self.memory()?
            .insert((component.to_string(), key.to_string()), entry.clone());
        let mut disk = self.read_disk(component)?;
        disk.insert(key.to_string(), entry.clone());
        self.write_disk(component, &disk)?;
        self.store.put_cache_entry(&entry)
    }

    pub fn invalidate(&self, component: &str) -> Result<()> {
        self.memory()?.retain(|(name, _), _| name != component);
        let path = self.layout.version_cache_path(component);
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        let removed = self.store.remove_cache_entries(component, None)?;
        debug!(component, removed, "version cache invalidated");
        Ok(())
    }

    /// Drops expired entries from every tier. Offline, a component's last
    /// remaining entry is kept even when expired.
    pub fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now_unix();
        let mut by_component: BTreeMap<String, BTreeMap<String, VersionCacheEntry>> =
            BTreeMap::new();
        for entry in self.store.cache_entries()? {
            by_component
                .entry(entry.component.clone())
                .or_default()
                .insert(entry.cache_key.clone(), entry);
        }
        for component in self.disk_components()? {
            let slot = by_component.entry(component.clone()).or_default();
            for (key, entry) in self.read_disk(&component)? {
                let newer = slot
                    .get(&key)
                    .map_or(true, |existing| entry.cached_at_unix > existing.cached_at_unix);
                if newer {
                    slot.insert(key, entry);
                }
            }
        }

        let mut report = SweepReport::default();
        for (component, entries) in by_component {
            let mut expired = entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .cloned()
                .collect::<Vec<_>>();
            if expired.is_empty() {
                continue;
            }

            if self.offline && expired.len() == entries.len() {
                expired.sort_by_key(|entry| entry.cached_at_unix);
                expired.pop();
                report.retained_offline += 1;
            }
            if expired.is_empty() {
                continue;
            }

            let keys = expired
                .iter()
                .map(|entry| entry.cache_key.clone())
                .collect::<Vec<_>>();
            self.store.remove_cache_entries(&component, Some(&keys))?;

            let mut disk = self.read_disk(&component)?;
            disk.retain(|key, _| !keys.contains(key));
            if disk.is_empty() {
                let path = self.layout.version_cache_path(&component);
                remove_file_if_exists(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            } else {
                self.write_disk(&component, &disk)?;
            }

            self.memory()?
                .retain(|(name, key), _| !(name == &component && keys.contains(key)));
            report.removed += keys.len();
        }

        debug!(
            removed = report.removed,
            retained_offline = report.retained_offline,
            "version cache swept"
        );
        Ok(report)
    }

    fn memory(&self) -> Result<MutexGuard<'_, HashMap<EntryKey, VersionCacheEntry>>> {
        self.memory
            .lock()
            .map_err(|_| anyhow!("version cache memory tier lock poisoned"))
    }

    fn read_disk(&self, component: &str) -> Result<BTreeMap<String, VersionCacheEntry>> {
        let path = self.layout.version_cache_path(component);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        match serde_json::from_slice::<Vec<VersionCacheEntry>>(&raw) {
            Ok(entries) => Ok(entries
                .into_iter()
                .map(|entry| (entry.cache_key.clone(), entry))
                .collect()),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "ignoring unreadable cache file");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_disk(
        &self,
        component: &str,
        entries: &BTreeMap<String, VersionCacheEntry>,
    ) -> Result<()> {
        let path = self.layout.version_cache_path(component);
        let encoded = serde_json::to_vec_pretty(&entries.values().collect::<Vec<_>>())
            .context("failed to encode version cache file")?;
        atomic_write(&path, &encoded)
    }

    fn disk_components(&self) -> Result<Vec<String>> {
        let dir = self.layout.version_cache_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };
        let mut components = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to read {}", dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                components.push(stem.to_string());
            }
        }
        Ok(components)
    }
}
