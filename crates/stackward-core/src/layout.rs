use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// On-disk layout under the engine's state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.db_dir().join("runs")
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.db_dir().join(format!("{table}.json"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn version_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("versions")
    }

    pub fn version_cache_path(&self, component: &str) -> PathBuf {
        self.version_cache_dir().join(format!("{component}.json"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn component_backups_dir(&self, component: &str) -> PathBuf {
        self.backups_dir().join(component)
    }

    pub fn backup_dir(&self, component: &str, rollback_id: &str) -> PathBuf {
        self.component_backups_dir(component).join(rollback_id)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn download_dir(&self, component: &str, version: &str) -> PathBuf {
        self.scratch_dir().join(format!("{component}-{version}"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("stackward.lock")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.db_dir(),
            self.runs_dir(),
            self.cache_dir(),
            self.version_cache_dir(),
            self.backups_dir(),
            self.scratch_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
