use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use stackward_core::{
    parse_version, BreakingChangeRecord, Clock, CompatibilityRule, ComponentHold,
    ComponentManifest, ComponentRecord, Event, EventKind, EventSink, HostLayout,
    JsonlEventSink, RollbackPoint, StackwardConfig, SystemClock, UpgradeError, UpgradeRun,
};
use stackward_installer::{
    ArtifactFetcher, AtomicInstaller, HealthChecker, HttpFetcher, HttpProbe, InstallerSettings,
    LivenessProbe, RollbackManager, ServiceSupervisor, StopPolicy, SystemdSupervisor,
};
use stackward_registry::{HttpRegistry, ReleaseRegistry, VersionCache, LOCKED_KEY};
use stackward_resolver::{Evaluator, Resolver};
use stackward_store::{process_alive, FileStateStore, HostLock, LockOwner, StateStore};
use tracing::{info, warn};

use crate::report::{
    CleanupSummary, ComponentStatus, RollbackReport, RunSummary, StatusReport,
};

/// The locked version is only replaced by a later install, never aged out.
pub(crate) const LOCKED_TTL_SECS: u64 = u64::MAX;

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub config: StackwardConfig,
    pub layout: HostLayout,
    pub store: Arc<dyn StateStore>,
    pub registry: Arc<dyn ReleaseRegistry>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub supervisor: Arc<dyn ServiceSupervisor>,
    pub probe: Arc<dyn LivenessProbe>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    /// Liveness of a host lock owner.
    pub process_alive: fn(u32) -> bool,
    pub pid: u32,
}

impl EngineParts {
    /// Real collaborators: file store under `engine.state_dir`, HTTP registry
    /// and downloads, systemd, and the JSONL event log.
    pub fn system(config: StackwardConfig) -> Result<Self> {
        let layout = HostLayout::new(&config.engine.state_dir);
        layout.ensure_base_dirs()?;
        let store = Arc::new(FileStateStore::open(layout.clone())?);
        let registry = Arc::new(HttpRegistry::new(
            &config.registry,
            config.engine.offline,
            Duration::from_millis(config.engine.retry_backoff_ms),
        )?);
        let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
            config.engine.download_timeout_secs,
        ))?);
        let probe = Arc::new(HttpProbe::new(Duration::from_secs(
            config.health.timeout_secs.min(5),
        ))?);
        let events = Arc::new(JsonlEventSink::new(layout.events_path()));

        Ok(Self {
            config,
            layout,
            store,
            registry,
            fetcher,
            supervisor: Arc::new(SystemdSupervisor),
            probe,
            events,
            clock: Arc::new(SystemClock),
            process_alive,
            pid: std::process::id(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    Point(String),
    /// Newest point holding a version other than the installed one.
    Previous,
}

/// Upgrade orchestrator. Every mutating operation runs under the host lock.
pub struct Engine {
    pub(crate) config: StackwardConfig,
    pub(crate) layout: HostLayout,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) registry: Arc<dyn ReleaseRegistry>,
    pub(crate) cache: Arc<VersionCache>,
    pub(crate) resolver: Resolver,
    pub(crate) evaluator: Evaluator,
    pub(crate) installer: AtomicInstaller,
    pub(crate) rollback: RollbackManager,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock>,
    process_alive: fn(u32) -> bool,
    pub(crate) pid: u32,
}

impl Engine {
    pub fn open(config: StackwardConfig) -> Result<Self> {
        Self::new(EngineParts::system(config)?)
    }

    pub fn new(parts: EngineParts) -> Result<Self> {
        let EngineParts {
            config,
            layout,
            store,
            registry,
            fetcher,
            supervisor,
            probe,
            events,
            clock,
            process_alive,
            pid,
        } = parts;
        layout.ensure_base_dirs()?;

        let (rules, breaking) = seed_reference_data(&config, store.as_ref())?;
        let cache = Arc::new(VersionCache::new(
            layout.clone(),
            store.clone(),
            clock.clone(),
            config.engine.offline,
        ));
        let resolver = Resolver::standard(registry.clone(), cache.clone(), &config);
        let health = Arc::new(HealthChecker::from_config(
            supervisor.clone(),
            probe,
            &config.health,
        ));
        let installer = AtomicInstaller::new(
            layout.clone(),
            fetcher,
            supervisor.clone(),
            health.clone(),
            InstallerSettings::from_config(&config.engine, &config.health),
        );
        let rollback = RollbackManager::new(
            layout.clone(),
            store.clone(),
            clock.clone(),
            supervisor,
            health,
            config.retention.clone(),
            StopPolicy::from_config(&config.health),
        );

        Ok(Self {
            config,
            layout,
            store,
            registry,
            cache,
            resolver,
            evaluator: Evaluator::new(rules, breaking),
            installer,
            rollback,
            events,
            clock,
            process_alive,
            pid,
        })
    }

    pub fn config(&self) -> &StackwardConfig {
        &self.config
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub(crate) fn acquire_lock(&self) -> Result<HostLock> {
        let alive = self.process_alive;
        HostLock::acquire(
            &self.layout.lock_path(),
            LockOwner {
                pid: self.pid,
                run_id: None,
                acquired_at_unix: self.clock.now_unix(),
            },
            &alive,
        )
    }

    /// Mutations other than runs refuse to interleave with an interrupted
    /// run; it has to be resumed first.
    fn ensure_no_interrupted_run(&self, operation: &str) -> Result<()> {
        if let Some(run) = self.store.active_run()? {
            return Err(anyhow!(
                "cannot {operation}: run {} was interrupted (state={}); run `stackward resume` first",
                run.run_id,
                run.state
            ));
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Err(err) = self.events.emit(&event) {
            warn!(
                kind = event.kind.as_str(),
                component = %event.component,
                error = %format!("{err:#}"),
                "failed to record event"
            );
        }
    }

    pub(crate) fn record_locked_version(&self, component: &str, version: &str) {
        if let Err(err) = self
            .cache
            .set(component, LOCKED_KEY, version, LOCKED_TTL_SECS)
        {
            warn!(component, version, error = %format!("{err:#}"), "failed to record locked version");
        }
    }

    /// Marks `component` as needing an operator. `fallback` is recorded when
    /// the component has no record yet.
    pub(crate) fn place_hold(
        &self,
        component: &str,
        fallback: Option<ComponentRecord>,
        reason: &str,
        run_id: Option<&str>,
    ) -> Result<()> {
        let Some(mut record) = self.store.component(component)?.or(fallback) else {
            warn!(component, reason, "no record to hold");
            return Ok(());
        };
        record.hold = Some(ComponentHold {
            reason: reason.to_string(),
            run_id: run_id.map(ToString::to_string),
            since_unix: self.clock.now_unix(),
        });
        self.store.put_component(&record)?;
        warn!(component, reason, "component placed on hold");
        Ok(())
    }

    /// Restores `component` from a rollback point outside of any run.
    pub fn rollback_component(
        &self,
        component: &str,
        target: &RollbackTarget,
    ) -> Result<RollbackReport> {
        let lock = self.acquire_lock()?;
        self.ensure_no_interrupted_run("roll back")?;

        let record = self
            .store
            .component(component)?
            .ok_or_else(|| UpgradeError::UnknownComponent(component.to_string()))?;
        let point = match target {
            RollbackTarget::Point(id) => {
                let point = self.rollback.point(id)?.ok_or_else(|| {
                    UpgradeError::RollbackFailed {
                        component: component.to_string(),
                        rollback_id: id.clone(),
                        detail: "rollback point not found".to_string(),
                    }
                })?;
                if point.component != component {
                    return Err(UpgradeError::RollbackFailed {
                        component: component.to_string(),
                        rollback_id: id.clone(),
                        detail: format!("rollback point belongs to '{}'", point.component),
                    }
                    .into());
                }
                Some(point)
            }
            RollbackTarget::Previous => {
                let points = self.rollback.points(component)?;
                let older = points
                    .iter()
                    .find(|point| point.version != record.installed_version)
                    .cloned();
                match older {
                    Some(point) => Some(point),
                    None if record.is_held() => points.into_iter().next(),
                    None => None,
                }
            }
        };

        let Some(point) = point.filter(|point| {
            point.version != record.installed_version || record.is_held()
        }) else {
            info!(component, version = %record.installed_version, "no rollback needed");
            lock.release()?;
            return Ok(RollbackReport {
                component: component.to_string(),
                rollback_id: None,
                from_version: record.installed_version.clone(),
                to_version: record.installed_version,
                not_needed: true,
            });
        };

        self.rollback
            .verify(&point)
            .map_err(|err| UpgradeError::RollbackFailed {
                component: component.to_string(),
                rollback_id: point.id.clone(),
                detail: format!("{err:#}"),
            })?;

        let now = self.clock.now_unix();
        let run_id = format!("rollback-{now}-{}", self.pid);
        let health_url = self
            .config
            .component(component)
            .and_then(|config| config.health_url.clone());
        match self
            .rollback
            .restore(component, &point.id, health_url.as_deref())
        {
            Ok(restored) => {
                self.record_locked_version(component, &restored.installed_version);
                self.emit(
                    Event::new(EventKind::RollbackExecuted, &run_id, component, now)
                        .versions(
                            Some(record.installed_version.as_str()),
                            &restored.installed_version,
                        )
                        .detail(format!("manual rollback to {}", point.id)),
                );
                info!(
                    component,
                    rollback_id = %point.id,
                    version = %restored.installed_version,
                    "manual rollback complete"
                );
                lock.release()?;
                Ok(RollbackReport {
                    component: component.to_string(),
                    rollback_id: Some(point.id),
                    from_version: record.installed_version,
                    to_version: restored.installed_version,
                    not_needed: false,
                })
            }
            Err(err) => {
                let detail = format!("{err:#}");
                self.place_hold(component, None, &detail, Some(&run_id))?;
                self.emit(
                    Event::new(EventKind::ManualInterventionRequired, &run_id, component, now)
                        .detail(detail),
                );
                Err(err)
            }
        }
    }

    pub fn rollback_point(&self, id: &str) -> Result<Option<RollbackPoint>> {
        self.rollback.point(id)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let records = self.records()?;
        let mut names = self.config.component_names();
        for name in records.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        let mut components = Vec::with_capacity(names.len());
        for name in names {
            let points = self.rollback.points(&name)?;
            components.push(ComponentStatus {
                record: records.get(&name).cloned(),
                rollback_points: points.len(),
                latest_point: points.into_iter().next(),
                component: name,
            });
        }

        let runs = self.store.runs()?;
        let alive = self.process_alive;
        Ok(StatusReport {
            components,
            active_run: runs
                .iter()
                .rev()
                .find(|run| !run.is_terminal())
                .map(RunSummary::from),
            last_run: runs
                .iter()
                .rev()
                .find(|run| run.is_terminal())
                .map(RunSummary::from),
            lock: HostLock::inspect(&self.layout.lock_path(), &alive)?.into(),
        })
    }

    /// Most recent runs first.
    pub fn history(&self, limit: usize) -> Result<Vec<UpgradeRun>> {
        let mut runs = self.store.runs()?;
        runs.reverse();
        runs.truncate(limit);
        Ok(runs)
    }

    /// Applies rollback retention, sweeps the version cache, and clears
    /// leftover scratch downloads.
    pub fn cleanup(&self) -> Result<CleanupSummary> {
        let lock = self.acquire_lock()?;
        self.ensure_no_interrupted_run("clean up")?;

        let managed = self
            .store
            .components()?
            .into_iter()
            .map(|record| record.name)
            .collect::<Vec<_>>();
        let rollback = self.rollback.cleanup_expired(&managed)?;
        let cache = self.cache.sweep_expired()?;
        let scratch = clear_dir(&self.layout.scratch_dir())?;

        lock.release()?;
        let summary = CleanupSummary::new(rollback, cache, scratch);
        info!(
            points_removed = summary.removed_points.len(),
            cache_removed = summary.cache_removed,
            scratch_removed = summary.scratch_entries_removed,
            "cleanup complete"
        );
        Ok(summary)
    }

    /// Takes over a component that was installed outside the engine.
    pub fn adopt(&self, component: &str, version: &str) -> Result<ComponentRecord> {
        let config = self
            .config
            .component(component)
            .ok_or_else(|| UpgradeError::UnknownComponent(component.to_string()))?;
        let version = parse_version(version)
            .map_err(|err| UpgradeError::Config(format!("{err:#}")))?
            .to_string();

        let lock = self.acquire_lock()?;
        self.ensure_no_interrupted_run("adopt")?;
        if let Some(existing) = self.store.component(component)? {
            return Err(anyhow!(
                "'{component}' is already managed at {}",
                existing.installed_version
            ));
        }
        if !config.binary_path.is_file() {
            return Err(anyhow!(
                "cannot adopt '{component}': {} does not exist",
                config.binary_path.display()
            ));
        }

        let record = ComponentRecord::from_config(config, &version);
        self.store.put_component(&record)?;
        self.record_locked_version(component, &version);
        lock.release()?;
        info!(component, version = %version, "component adopted");
        Ok(record)
    }

    pub fn release_hold(&self, component: &str) -> Result<ComponentRecord> {
        let lock = self.acquire_lock()?;
        let mut record = self
            .store
            .component(component)?
            .ok_or_else(|| UpgradeError::UnknownComponent(component.to_string()))?;
        let Some(hold) = record.hold.take() else {
            return Err(anyhow!("'{component}' is not on hold"));
        };
        self.store.put_component(&record)?;
        lock.release()?;
        warn!(
            component,
            reason = %hold.reason,
            "hold released by operator"
        );
        Ok(record)
    }
}

/// Merges the reference data declared in config and component manifests
/// and writes it to the store when it changed.
fn seed_reference_data(
    config: &StackwardConfig,
    store: &dyn StateStore,
) -> Result<(Vec<CompatibilityRule>, Vec<BreakingChangeRecord>)> {
    let mut rules = config.compatibility.clone();
    let mut breaking = config.breaking_changes.clone();
    for component in &config.components {
        let Some(path) = &component.manifest else {
            continue;
        };
        let manifest = match ComponentManifest::load(path) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    component = %component.name,
                    error = %format!("{err:#}"),
                    "component manifest unreadable; its reference data is skipped"
                );
                continue;
            }
        };
        for rule in manifest.compatibility_rules()? {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
        for record in manifest.breaking_changes() {
            if !breaking.contains(&record) {
                breaking.push(record);
            }
        }
    }

    if store.compatibility_rules()? != rules {
        store.replace_compatibility_rules(&rules)?;
        info!(rules = rules.len(), "compatibility matrix seeded");
    }
    if store.breaking_changes()? != breaking {
        store.replace_breaking_changes(&breaking)?;
        info!(records = breaking.len(), "breaking change records seeded");
    }
    Ok((rules, breaking))
}

fn clear_dir(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read {}", dir.display()))?
            .path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.with_context(|| format!("failed to remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}
