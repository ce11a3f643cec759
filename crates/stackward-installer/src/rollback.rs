use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use stackward_core::{
    Clock, ComponentRecord, HostLayout, RetentionConfig, RollbackPoint, UpgradeError,
};
use stackward_security::sha256_file_hex;
use stackward_store::{atomic_write, remove_file_if_exists, StateStore};
use tracing::{info, warn};

use crate::fs_ops::replace_file;
use crate::health::HealthChecker;
use crate::supervisor::{stop_gracefully, ServiceSupervisor, StopPolicy};

const BINARY_BACKUP: &str = "binary";
const CONFIG_BACKUP: &str = "config";
const POINT_MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub retained: usize,
}

/// Snapshots a component's files before they are replaced and puts them
/// back when an upgrade has to be undone.
pub struct RollbackManager {
    layout: HostLayout,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    supervisor: Arc<dyn ServiceSupervisor>,
    health: Arc<HealthChecker>,
    retention: RetentionConfig,
    stop: StopPolicy,
}

impl RollbackManager {
    pub fn new(
        layout: HostLayout,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        supervisor: Arc<dyn ServiceSupervisor>,
        health: Arc<HealthChecker>,
        retention: RetentionConfig,
        stop: StopPolicy,
    ) -> Self {
        Self {
            layout,
            store,
            clock,
            supervisor,
            health,
            retention,
            stop,
        }
    }

    /// Copies the live binary (and config, when present) into the backup
    /// dir, persists the point, and re-reads the copies to check them.
    pub fn create_snapshot(&self, record: &ComponentRecord, version: &str) -> Result<String> {
        self.create_snapshot_inner(record, version).map_err(|err| {
            UpgradeError::SnapshotFailed {
                component: record.name.clone(),
                detail: format!("{err:#}"),
            }
            .into()
        })
    }

    fn create_snapshot_inner(&self, record: &ComponentRecord, version: &str) -> Result<String> {
        if !record.binary_path.is_file() {
            return Err(anyhow!(
                "live binary {} does not exist",
                record.binary_path.display()
            ));
        }

        let now = self.clock.now_unix();
        let id = self.allocate_id(&record.name, now)?;
        let dir = self.layout.backup_dir(&record.name, &id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create backup dir {}", dir.display()))?;

        let binary_backup = dir.join(BINARY_BACKUP);
        let mut size_bytes = copy_file(&record.binary_path, &binary_backup)?;
        let binary_sha256 = sha256_file_hex(&binary_backup)?;

        let (config_backup, config_sha256) = match &record.config_path {
            Some(config_path) if config_path.is_file() => {
                let backup = dir.join(CONFIG_BACKUP);
                size_bytes += copy_file(config_path, &backup)?;
                let digest = sha256_file_hex(&backup)?;
                (Some(backup), Some(digest))
            }
            Some(config_path) => {
                warn!(
                    component = %record.name,
                    config = %config_path.display(),
                    "config file missing; snapshot covers the binary only"
                );
                (None, None)
            }
            None => (None, None),
        };

        let mut snapshot_record = record.clone();
        snapshot_record.installed_version = version.to_string();
        snapshot_record.hold = None;
        let point = RollbackPoint {
            id: id.clone(),
            component: record.name.clone(),
            version: version.to_string(),
            created_at_unix: now,
            binary_backup_path: binary_backup,
            config_backup_path: config_backup,
            state_snapshot: serde_json::to_string(&snapshot_record)
                .context("failed to encode component snapshot")?,
            binary_sha256,
            config_sha256,
            expires_at_unix: now.saturating_add(self.retention.max_age_secs()),
            size_bytes,
        };

        let manifest =
            serde_json::to_vec_pretty(&point).context("failed to encode rollback manifest")?;
        atomic_write(&dir.join(POINT_MANIFEST), &manifest)?;
        self.store.put_rollback_point(&point)?;

        if let Err(err) = self.verify(&point) {
            let _ = self.store.remove_rollback_point(&point.id);
            return Err(err.context("snapshot failed verification"));
        }

        info!(
            component = %record.name,
            rollback_id = %id,
            version,
            size_bytes,
            "rollback point created"
        );
        Ok(id)
    }

    fn allocate_id(&self, component: &str, now: u64) -> Result<String> {
        let existing = self.store.rollback_points(Some(component))?;
        let mut seq = existing.len() + 1;
        loop {
            let id = format!("{component}-{now}-{seq}");
            if existing.iter().all(|point| point.id != id)
                && !self.layout.backup_dir(component, &id).exists()
            {
                return Ok(id);
            }
            seq += 1;
        }
    }

    /// Checks that every backup file of `point` is readable and still hashes
    /// to the recorded digest.
    pub fn verify(&self, point: &RollbackPoint) -> Result<()> {
        verify_backup(&point.binary_backup_path, &point.binary_sha256)?;
        if let (Some(path), Some(digest)) = (&point.config_backup_path, &point.config_sha256) {
            verify_backup(path, digest)?;
        }
        Ok(())
    }

    pub fn point(&self, rollback_id: &str) -> Result<Option<RollbackPoint>> {
        self.store.rollback_point(rollback_id)
    }

    /// Points for `component`, newest first.
    pub fn points(&self, component: &str) -> Result<Vec<RollbackPoint>> {
        let mut points = self.store.rollback_points(Some(component))?;
        points.reverse();
        Ok(points)
    }

    pub fn latest_point(&self, component: &str) -> Result<Option<RollbackPoint>> {
        Ok(self.points(component)?.into_iter().next())
    }

    /// Restores `component` from `rollback_id` and waits for it to come back
    /// healthy. Any failure is `ManualInterventionRequired`; a failed restore
    /// is never retried from here.
    pub fn restore(
        &self,
        component: &str,
        rollback_id: &str,
        health_url: Option<&str>,
    ) -> Result<ComponentRecord> {
        self.restore_inner(component, rollback_id, health_url)
            .map_err(|err| {
                UpgradeError::ManualInterventionRequired {
                    component: component.to_string(),
                    detail: format!("restore from {rollback_id} failed: {err:#}"),
                }
                .into()
            })
    }

    fn restore_inner(
        &self,
        component: &str,
        rollback_id: &str,
        health_url: Option<&str>,
    ) -> Result<ComponentRecord> {
        let point = self
            .store
            .rollback_point(rollback_id)?
            .ok_or_else(|| anyhow!("rollback point {rollback_id} not found"))?;
        if point.component != component {
            return Err(anyhow!(
                "rollback point {rollback_id} belongs to '{}'",
                point.component
            ));
        }
        self.verify(&point)?;
        let mut record: ComponentRecord = serde_json::from_str(&point.state_snapshot)
            .with_context(|| format!("rollback point {rollback_id} has a corrupt snapshot"))?;

        let service = record.service_name.clone();
        stop_gracefully(self.supervisor.as_ref(), &service, self.stop)
            .with_context(|| format!("failed to stop {service}"))?;
        replace_file(&point.binary_backup_path, &record.binary_path, true)?;
        if let Some(config_path) = &record.config_path {
            match &point.config_backup_path {
                Some(backup) => replace_file(backup, config_path, false)?,
                // the snapshot saw no config, so one left now came from the upgrade
                None => remove_file_if_exists(config_path).with_context(|| {
                    format!("failed to remove {}", config_path.display())
                })?,
            }
        }

        record.hold = None;
        self.store.put_component(&record)?;

        self.supervisor
            .start(&service)
            .with_context(|| format!("failed to start {service}"))?;
        self.health.wait_healthy(&service, health_url)?;

        info!(
            component,
            rollback_id,
            version = %record.installed_version,
            "component restored"
        );
        Ok(record)
    }

    /// Drops points beyond `keep_last` per component or past their expiry.
    /// The newest point of every managed component is always kept.
    pub fn cleanup_expired(&self, managed: &[String]) -> Result<CleanupReport> {
        let now = self.clock.now_unix();
        let mut by_component: BTreeMap<String, Vec<RollbackPoint>> = BTreeMap::new();
        for point in self.store.rollback_points(None)? {
            by_component
                .entry(point.component.clone())
                .or_default()
                .push(point);
        }

        let mut report = CleanupReport::default();
        for (component, mut points) in by_component {
            points.reverse();
            let is_managed = managed.iter().any(|name| name == &component);
            for (index, point) in points.into_iter().enumerate() {
                let protected = is_managed && index == 0;
                let surplus = index >= self.retention.keep_last;
                if protected || !(surplus || point.is_expired(now)) {
                    report.retained += 1;
                    continue;
                }
                self.remove_point(&point)?;
                report.removed.push(point.id);
            }
        }

        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                retained = report.retained,
                "rollback retention applied"
            );
        }
        Ok(report)
    }

    /// Files first, then the record.
    fn remove_point(&self, point: &RollbackPoint) -> Result<()> {
        let dir = self.layout.backup_dir(&point.component, &point.id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", dir.display()));
            }
        }
        self.store.remove_rollback_point(&point.id)
    }
}

fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    fs::copy(src, dest)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))
}

fn verify_backup(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file_hex(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(anyhow!(
            "backup {} hashes to {actual}, recorded {expected}",
            path.display()
        ));
    }
    Ok(())
}
