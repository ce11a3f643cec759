use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use semver::VersionReq;
use stackward_core::{
    CompatibilityRule, ComponentConfig, ComponentHold, ComponentRecord, EventKind, HealthConfig,
    HostLayout, InstallMethod, ManualClock, MemoryEventSink, RunOutcome, RunState,
    StackwardConfig, StepStatus, Strategy, UpgradeError,
};
use stackward_installer::{ArtifactFetcher, LivenessProbe, ServiceSupervisor};
use stackward_registry::{RegistryError, Release, ReleaseAsset, ReleaseRegistry};
use stackward_security::sha256_hex;
use stackward_store::{HostLock, LockOwner, MemoryStateStore, StateStore};

use super::*;
use crate::artifact::select_host_asset;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A lock owner the test liveness probe always reports as running.
const OTHER_LIVE_PID: u32 = 4_000_001;
const DEAD_PID: u32 = 4_000_002;

fn test_alive(pid: u32) -> bool {
    pid == OTHER_LIVE_PID || pid == std::process::id()
}

fn host_asset_name(component: &str) -> String {
    format!(
        "{component}-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn release_url(component: &str, version: &str, file: &str) -> String {
    format!("https://releases.example.test/{component}/v{version}/{file}")
}

#[derive(Default)]
struct FakeRegistry {
    releases: Mutex<BTreeMap<String, Vec<Release>>>,
    rate_limited: AtomicBool,
    lookups: AtomicU32,
}

impl FakeRegistry {
    fn publish(&self, repo: &str, release: Release) {
        let mut releases = self.releases.lock().expect("lock");
        let list = releases.entry(repo.to_string()).or_default();
        list.retain(|existing| existing.tag_name != release.tag_name);
        list.push(release);
    }

    fn check_quota(&self) -> Result<(), RegistryError> {
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(RegistryError::RateLimited {
                reset_at_unix: Some(2_000_000),
            });
        }
        Ok(())
    }
}

impl ReleaseRegistry for FakeRegistry {
    fn latest_release(&self, repo: &str) -> Result<Release, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_quota()?;
        self.releases
            .lock()
            .expect("lock")
            .get(repo)
            .and_then(|releases| {
                releases
                    .iter()
                    .filter(|release| release.is_stable())
                    .max_by_key(|release| release.version().ok())
                    .cloned()
            })
            .ok_or_else(|| RegistryError::NotFound(format!("{repo}@latest")))
    }

    fn list_releases(&self, repo: &str) -> Result<Vec<Release>, RegistryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_quota()?;
        Ok(self
            .releases
            .lock()
            .expect("lock")
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    fn release_by_tag(&self, repo: &str, tag: &str) -> Result<Release, RegistryError> {
        self.check_quota()?;
        self.releases
            .lock()
            .expect("lock")
            .get(repo)
            .and_then(|releases| {
                releases
                    .iter()
                    .find(|release| release.tag_name == tag)
                    .cloned()
            })
            .ok_or_else(|| RegistryError::NotFound(format!("{repo}@{tag}")))
    }

    fn remaining_quota(&self) -> Option<u32> {
        None
    }
}

#[derive(Default)]
struct FakeFetcher {
    documents: Mutex<BTreeMap<String, Vec<u8>>>,
    crash_next: AtomicBool,
}

impl FakeFetcher {
    fn serve(&self, url: &str, body: &[u8]) {
        self.documents
            .lock()
            .expect("lock")
            .insert(url.to_string(), body.to_vec());
    }

    fn document(&self, url: &str) -> Result<Vec<u8>> {
        self.documents
            .lock()
            .expect("lock")
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("{url} returned HTTP 404"))
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<()> {
        if self.crash_next.swap(false, Ordering::SeqCst) {
            panic!("simulated crash while downloading {url}");
        }
        let body = self.document(url)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, body)?;
        Ok(())
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        Ok(String::from_utf8(self.document(url)?)?)
    }
}

#[derive(Default)]
struct FakeSupervisor {
    active: Mutex<BTreeSet<String>>,
    log: Mutex<Vec<String>>,
    crash_on_start: AtomicBool,
}

impl FakeSupervisor {
    fn mark_running(&self, service: &str) {
        self.active
            .lock()
            .expect("lock")
            .insert(service.to_string());
    }

    fn is_running(&self, service: &str) -> bool {
        self.active.lock().expect("lock").contains(service)
    }

    fn starts_of(&self, service: &str) -> usize {
        let wanted = format!("start {service}");
        self.log
            .lock()
            .expect("lock")
            .iter()
            .filter(|entry| **entry == wanted)
            .count()
    }
}

impl ServiceSupervisor for FakeSupervisor {
    fn start(&self, service: &str) -> Result<()> {
        if self.crash_on_start.swap(false, Ordering::SeqCst) {
            panic!("simulated crash while starting {service}");
        }
        self.log.lock().expect("lock").push(format!("start {service}"));
        self.mark_running(service);
        Ok(())
    }

    fn stop(&self, service: &str) -> Result<()> {
        self.log.lock().expect("lock").push(format!("stop {service}"));
        self.active.lock().expect("lock").remove(service);
        Ok(())
    }

    fn is_active(&self, service: &str) -> Result<bool> {
        Ok(self.is_running(service))
    }

    fn kill(&self, service: &str) -> Result<()> {
        self.log.lock().expect("lock").push(format!("kill {service}"));
        self.active.lock().expect("lock").remove(service);
        Ok(())
    }
}

/// Healthy unless the live binary of the probed component reads `broken`.
struct FakeProbe {
    live_dir: PathBuf,
}

impl LivenessProbe for FakeProbe {
    fn probe(&self, url: &str) -> Result<bool> {
        let component = url
            .rsplit('/')
            .nth(1)
            .ok_or_else(|| anyhow!("unexpected health url {url}"))?;
        Ok(fs::read(self.live_dir.join(component))
            .map(|body| body != b"broken")
            .unwrap_or(false))
    }
}

struct Harness {
    root: PathBuf,
    config: StackwardConfig,
    store: Arc<MemoryStateStore>,
    registry: Arc<FakeRegistry>,
    fetcher: Arc<FakeFetcher>,
    supervisor: Arc<FakeSupervisor>,
    probe: Arc<FakeProbe>,
    events: Arc<MemoryEventSink>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(label: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock must be after epoch")
            .as_nanos();
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let root = std::env::temp_dir().join(format!(
            "stackward-engine-{label}-{}-{nanos}-{seq}",
            std::process::id()
        ));
        fs::create_dir_all(root.join("live")).expect("must create live dir");

        let mut config = StackwardConfig::default();
        config.engine.state_dir = root.join("state");
        config.engine.download_attempts = 1;
        config.engine.retry_backoff_ms = 1;
        config.health = HealthConfig {
            timeout_secs: 1,
            poll_interval_ms: 5,
            stop_timeout_secs: 1,
        };

        Self {
            probe: Arc::new(FakeProbe {
                live_dir: root.join("live"),
            }),
            root,
            config,
            store: Arc::new(MemoryStateStore::new()),
            registry: Arc::new(FakeRegistry::default()),
            fetcher: Arc::new(FakeFetcher::default()),
            supervisor: Arc::new(FakeSupervisor::default()),
            events: Arc::new(MemoryEventSink::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000)),
        }
    }

    fn live_path(&self, component: &str) -> PathBuf {
        self.root.join("live").join(component)
    }

    fn live(&self, component: &str) -> String {
        fs::read_to_string(self.live_path(component)).expect("live binary must be readable")
    }

    /// Configures `component`, publishes `upstream` releases for it, and
    /// installs `installed` when given.
    fn add_component(&mut self, component: &str, installed: Option<&str>, upstream: &[&str]) {
        let config = ComponentConfig {
            name: component.to_string(),
            repo: Some(format!("acme/{component}")),
            strategy: Strategy::Latest,
            version: None,
            range: None,
            lts_series: None,
            pin: None,
            fallback_version: None,
            manifest: None,
            service: None,
            binary_path: self.live_path(component),
            config_path: None,
            install_method: InstallMethod::Binary,
            asset_url: None,
            checksum_url: None,
            signature_url: None,
            public_key: None,
            handler: None,
            health_url: Some(format!("http://127.0.0.1:9100/{component}/healthz")),
            blacklist: Vec::new(),
        };
        for version in upstream {
            self.publish(component, version, format!("{component} {version}").as_bytes());
        }
        if let Some(version) = installed {
            fs::write(self.live_path(component), format!("{component} {version}"))
                .expect("must write live binary");
            self.store
                .put_component(&ComponentRecord::from_config(&config, version))
                .expect("must store record");
            self.supervisor.mark_running(component);
        }
        self.config.components.push(config);
    }

    /// Publishes `version` with a host asset serving `body` and a matching
    /// checksum listing.
    fn publish(&self, component: &str, version: &str, body: &[u8]) {
        let asset = host_asset_name(component);
        let asset_url = release_url(component, version, &asset);
        let sums_url = release_url(component, version, "SHA256SUMS");
        self.fetcher.serve(&asset_url, body);
        self.fetcher.serve(
            &sums_url,
            format!("{}  {asset}\n", sha256_hex(body)).as_bytes(),
        );

        let mut release = Release::new(&format!("v{version}"));
        release.assets = vec![
            ReleaseAsset {
                name: asset,
                browser_download_url: asset_url,
                size: body.len() as u64,
            },
            ReleaseAsset {
                name: "SHA256SUMS".to_string(),
                browser_download_url: sums_url,
                size: 0,
            },
        ];
        self.registry.publish(&format!("acme/{component}"), release);
    }

    fn require(&mut self, component: &str, version_req: &str, requires: &str, requires_req: &str) {
        self.config.compatibility.push(CompatibilityRule {
            component: component.to_string(),
            version_req: VersionReq::parse(version_req).expect("valid requirement"),
            requires: requires.to_string(),
            requires_req: VersionReq::parse(requires_req).expect("valid requirement"),
        });
    }

    fn engine(&self) -> Engine {
        Engine::new(EngineParts {
            config: self.config.clone(),
            layout: HostLayout::new(self.config.engine.state_dir.clone()),
            store: self.store.clone(),
            registry: self.registry.clone(),
            fetcher: self.fetcher.clone(),
            supervisor: self.supervisor.clone(),
            probe: self.probe.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
            process_alive: test_alive,
            pid: std::process::id(),
        })
        .expect("engine must build")
    }

    fn installed_version(&self, component: &str) -> Option<String> {
        self.store
            .component(component)
            .expect("store must read")
            .map(|record| record.installed_version)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn risky() -> ApplyOptions {
    ApplyOptions {
        plan: PlanOptions {
            allow_risky: true,
            ..PlanOptions::default()
        },
        ..ApplyOptions::default()
    }
}

fn disposition(report: &ApplyReport, component: &str) -> Disposition {
    report
        .component(component)
        .unwrap_or_else(|| panic!("report must mention {component}"))
        .disposition
}

#[test]
fn safe_upgrade_applies_while_risky_and_incompatible_ones_are_held_back() {
    let mut harness = Harness::new("mixed");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    harness.add_component("beta", Some("2.3.0"), &["2.3.0", "2.5.0"]);
    harness.add_component("gamma", Some("2.9.0"), &["2.9.0", "3.0.0"]);
    harness.require("gamma", ">=3.0.0", "alpha", ">=2.0.0");
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");

    assert_eq!(disposition(&report, "alpha"), Disposition::Upgraded);
    assert_eq!(disposition(&report, "beta"), Disposition::AwaitingApproval);
    assert_eq!(disposition(&report, "gamma"), Disposition::Rejected);
    assert_eq!(report.exit_status(), ExitStatus::Blocked);
    assert_eq!(report.exit_status().code(), 2);
    assert_eq!(report.outcome, Some(RunOutcome::Completed));

    assert_eq!(harness.live("alpha"), "alpha 1.7.0");
    assert_eq!(harness.live("beta"), "beta 2.3.0");
    assert_eq!(harness.live("gamma"), "gamma 2.9.0");
    assert_eq!(harness.installed_version("alpha").as_deref(), Some("1.7.0"));
    assert_eq!(
        harness.events.kinds(),
        vec![EventKind::UpgradeStarted, EventKind::UpgradeCompleted]
    );
    assert!(
        !engine.layout().lock_path().exists(),
        "host lock must be released after the run"
    );
}

#[test]
fn risky_upgrade_waits_for_operator_approval() {
    let mut harness = Harness::new("risky");
    harness.add_component("beta", Some("2.3.0"), &["2.3.0", "2.5.0"]);
    let engine = harness.engine();

    let proposal = engine
        .plan(&PlanOptions::default())
        .expect("plan must succeed");
    assert_eq!(proposal.actionable(), 0);
    let beta = proposal.report("beta").expect("beta must be reported");
    assert_eq!(beta.disposition, Disposition::AwaitingApproval);
    assert_eq!(beta.risk, Some(stackward_core::RiskLevel::Medium));

    let blocked = engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");
    assert_eq!(blocked.exit_status(), ExitStatus::Blocked);
    assert_eq!(blocked.outcome, Some(RunOutcome::NoOp));
    assert_eq!(harness.live("beta"), "beta 2.3.0");

    let approved = engine.apply(&risky()).expect("approved apply must succeed");
    assert_eq!(disposition(&approved, "beta"), Disposition::Upgraded);
    assert_eq!(approved.exit_status(), ExitStatus::Success);
    assert_eq!(harness.live("beta"), "beta 2.5.0");

    let history = engine.history(10).expect("history must load");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].outcome, Some(RunOutcome::Completed));
    assert_eq!(history[1].outcome, Some(RunOutcome::NoOp));
    assert_eq!(history[1].steps[0].status, StepStatus::AwaitingApproval);
}

#[test]
fn repeated_apply_is_a_no_op() {
    let mut harness = Harness::new("idempotent");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    engine
        .apply(&ApplyOptions::default())
        .expect("first apply must succeed");
    let second = engine
        .apply(&ApplyOptions::default())
        .expect("second apply must succeed");

    assert_eq!(second.run_id, None);
    assert_eq!(second.outcome, Some(RunOutcome::NoOp));
    assert_eq!(second.exit_status().code(), 0);
    assert_eq!(disposition(&second, "alpha"), Disposition::UpToDate);
    assert_eq!(engine.history(10).expect("history").len(), 1);
    assert_eq!(harness.supervisor.starts_of("alpha"), 1);
}

#[test]
fn dry_run_reports_plan_without_touching_host() {
    let mut harness = Harness::new("dry-run");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions {
            dry_run: true,
            ..ApplyOptions::default()
        })
        .expect("dry run must succeed");

    assert!(report.dry_run);
    assert_eq!(report.outcome, None);
    assert_eq!(disposition(&report, "alpha"), Disposition::Planned);
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");
    assert!(engine.history(10).expect("history").is_empty());
    assert!(harness.events.kinds().is_empty());
}

#[test]
fn downgrade_is_rejected_unless_forced() {
    let mut harness = Harness::new("downgrade");
    harness.add_component("alpha", Some("1.7.0"), &["1.6.0", "1.7.0"]);
    harness.config.components[0].pin = Some("1.6.0".to_string());
    let engine = harness.engine();

    let proposal = engine
        .plan(&PlanOptions::default())
        .expect("plan must succeed");
    let alpha = proposal.report("alpha").expect("alpha must be reported");
    assert_eq!(alpha.disposition, Disposition::Rejected);
    assert!(
        alpha
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("older than installed")),
        "unexpected detail: {:?}",
        alpha.detail
    );

    let forced = engine
        .plan(&PlanOptions {
            force: true,
            ..PlanOptions::default()
        })
        .expect("forced plan must succeed");
    assert_eq!(
        forced.report("alpha").map(|report| report.disposition),
        Some(Disposition::Planned)
    );
}

#[test]
fn failed_health_check_restores_snapshot() {
    let mut harness = Harness::new("health-rollback");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0"]);
    harness.publish("alpha", "1.7.0", b"broken");
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must finish");

    let alpha = report.component("alpha").expect("alpha must be reported");
    assert_eq!(alpha.disposition, Disposition::RolledBack);
    assert!(alpha.rollback_id.is_some());
    assert_eq!(report.exit_status(), ExitStatus::Failure);
    assert_eq!(report.outcome, Some(RunOutcome::RolledBack));
    assert_eq!(report.rolled_back(), vec!["alpha"]);

    assert_eq!(harness.live("alpha"), "alpha 1.6.0");
    assert!(harness.supervisor.is_running("alpha"));
    let record = harness
        .store
        .component("alpha")
        .expect("store")
        .expect("record must remain");
    assert_eq!(record.installed_version, "1.6.0");
    assert!(!record.is_held());
    assert_eq!(
        harness.events.kinds(),
        vec![
            EventKind::UpgradeStarted,
            EventKind::UpgradeFailed,
            EventKind::RollbackExecuted
        ]
    );
}

#[test]
fn first_install_is_recorded() {
    let mut harness = Harness::new("fresh");
    harness.add_component("delta", None, &["0.3.0"]);
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");

    assert_eq!(disposition(&report, "delta"), Disposition::Upgraded);
    assert_eq!(harness.live("delta"), "delta 0.3.0");
    assert_eq!(harness.installed_version("delta").as_deref(), Some("0.3.0"));
    assert!(report
        .component("delta")
        .is_some_and(|delta| delta.rollback_id.is_none()));
}

#[test]
fn failed_first_install_is_retracted() {
    let mut harness = Harness::new("fresh-retract");
    harness.add_component("delta", None, &[]);
    harness.publish("delta", "0.3.0", b"broken");
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must finish");

    let delta = report.component("delta").expect("delta must be reported");
    assert_eq!(delta.disposition, Disposition::RolledBack);
    assert!(delta
        .detail
        .as_deref()
        .is_some_and(|detail| detail.starts_with("first install retracted")));
    assert!(!harness.live_path("delta").exists());
    assert_eq!(harness.installed_version("delta"), None);
}

#[test]
fn stop_on_failure_skips_remaining_components() {
    let mut harness = Harness::new("stop-on-failure");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0"]);
    harness.publish("alpha", "1.7.0", b"broken");
    harness.add_component("beta", Some("2.3.0"), &["2.3.0", "2.4.0"]);
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions {
            continue_on_failure: Some(false),
            ..ApplyOptions::default()
        })
        .expect("apply must finish");

    assert_eq!(disposition(&report, "alpha"), Disposition::RolledBack);
    let beta = report.component("beta").expect("beta must be reported");
    assert_eq!(beta.disposition, Disposition::Skipped);
    assert!(beta
        .detail
        .as_deref()
        .is_some_and(|detail| detail.contains("earlier failure")));
    assert_eq!(harness.live("beta"), "beta 2.3.0");
}

#[test]
fn continue_on_failure_upgrades_independent_components() {
    let mut harness = Harness::new("continue");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0"]);
    harness.publish("alpha", "1.7.0", b"broken");
    harness.add_component("beta", Some("2.3.0"), &["2.3.0", "2.4.0"]);
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must finish");

    assert_eq!(disposition(&report, "alpha"), Disposition::RolledBack);
    assert_eq!(disposition(&report, "beta"), Disposition::Upgraded);
    assert_eq!(report.outcome, Some(RunOutcome::RolledBack));
    assert_eq!(harness.live("beta"), "beta 2.4.0");
}

#[test]
fn crash_during_download_resumes_with_a_single_install() {
    let mut harness = Harness::new("resume-download");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    harness.fetcher.crash_next.store(true, Ordering::SeqCst);
    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.apply(&ApplyOptions::default())
    }));
    assert!(crashed.is_err(), "the simulated crash must abort the run");

    let interrupted = harness
        .store
        .active_run()
        .expect("store")
        .expect("interrupted run must be persisted");
    assert_eq!(interrupted.state, RunState::Upgrading);
    assert_eq!(interrupted.steps[0].status, StepStatus::Upgrading);
    assert!(interrupted.steps[0].rollback_id.is_some());

    let blocked = engine.cleanup().expect_err("cleanup must wait for resume");
    assert!(format!("{blocked:#}").contains("stackward resume"));

    let report = engine
        .resume()
        .expect("resume must succeed")
        .expect("there must be a run to resume");
    assert!(report.resumed);
    assert_eq!(report.run_id.as_deref(), Some(interrupted.run_id.as_str()));
    assert_eq!(disposition(&report, "alpha"), Disposition::Upgraded);
    assert_eq!(harness.live("alpha"), "alpha 1.7.0");
    assert_eq!(harness.supervisor.starts_of("alpha"), 1);
    assert_eq!(
        harness.events.kinds(),
        vec![EventKind::UpgradeStarted, EventKind::UpgradeCompleted]
    );

    let history = engine.history(10).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].steps[0].attempts, 2);
    assert!(engine.resume().expect("resume").is_none());
}

#[test]
fn crash_after_backup_resumes_with_a_single_install() {
    let mut harness = Harness::new("resume-backed-up");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    harness.fetcher.crash_next.store(true, Ordering::SeqCst);
    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.apply(&ApplyOptions::default())
    }));
    assert!(crashed.is_err(), "the simulated crash must abort the run");

    // Wind the run back to the moment the snapshot was recorded.
    let mut interrupted = harness
        .store
        .active_run()
        .expect("store")
        .expect("interrupted run must be persisted");
    interrupted.state = RunState::BackingUp;
    interrupted.steps[0].status = StepStatus::BackedUp;
    interrupted.steps[0].attempts = 0;
    harness.store.save_run(&interrupted).expect("store");
    let rollback_id = interrupted.steps[0]
        .rollback_id
        .clone()
        .expect("backup must be recorded on the step");
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");

    let report = engine
        .resume()
        .expect("resume must succeed")
        .expect("there must be a run to resume");

    assert!(report.resumed);
    assert_eq!(disposition(&report, "alpha"), Disposition::Upgraded);
    assert_eq!(harness.live("alpha"), "alpha 1.7.0");
    assert_eq!(harness.supervisor.starts_of("alpha"), 1);
    let points = harness
        .store
        .rollback_points(Some("alpha"))
        .expect("store");
    assert_eq!(points.len(), 1, "the backup must not be taken twice");
    assert_eq!(points[0].id, rollback_id);
    let history = engine.history(10).expect("history");
    assert_eq!(history[0].steps[0].attempts, 1);
}

#[test]
fn crash_after_swap_rolls_back_on_next_apply() {
    let mut harness = Harness::new("resume-activation");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    harness.supervisor.crash_on_start.store(true, Ordering::SeqCst);
    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.apply(&ApplyOptions::default())
    }));
    assert!(crashed.is_err(), "the simulated crash must abort the run");
    assert_eq!(harness.live("alpha"), "alpha 1.7.0");

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must resume the interrupted run");
    assert!(report.resumed);
    assert_eq!(disposition(&report, "alpha"), Disposition::RolledBack);
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");
    assert!(harness.supervisor.is_running("alpha"));
    assert_eq!(
        harness.events.kinds(),
        vec![
            EventKind::UpgradeStarted,
            EventKind::UpgradeFailed,
            EventKind::RollbackExecuted
        ]
    );
}

#[test]
fn ensure_upgraded_finishes_interrupted_run_then_applies() {
    let mut harness = Harness::new("ensure");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    harness.add_component("beta", Some("2.3.0"), &["2.3.0", "2.4.0"]);
    let engine = harness.engine();

    harness.fetcher.crash_next.store(true, Ordering::SeqCst);
    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.apply(&ApplyOptions::default())
    }));
    assert!(crashed.is_err());

    let report = engine
        .ensure_upgraded(&ApplyOptions::default())
        .expect("ensure_upgraded must succeed");
    assert!(!report.resumed);
    assert_eq!(report.exit_status(), ExitStatus::Success);
    assert_eq!(harness.live("alpha"), "alpha 1.7.0");
    assert_eq!(harness.live("beta"), "beta 2.4.0");
}

#[test]
fn concurrent_run_is_refused_while_lock_is_held() {
    let mut harness = Harness::new("lock-held");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    let held = HostLock::acquire(
        &engine.layout().lock_path(),
        LockOwner {
            pid: OTHER_LIVE_PID,
            run_id: Some("run-elsewhere".to_string()),
            acquired_at_unix: 1,
        },
        &|_: u32| true,
    )
    .expect("foreign lock must be acquired");

    let err = engine
        .apply(&ApplyOptions::default())
        .expect_err("apply must refuse to run");
    assert!(matches!(
        UpgradeError::classify(&err),
        Some(UpgradeError::ConcurrentRunDetected { owner_pid, .. }) if *owner_pid == OTHER_LIVE_PID
    ));
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");
    assert_eq!(
        engine.status().expect("status").lock,
        LockView::Held {
            pid: OTHER_LIVE_PID,
            run_id: Some("run-elsewhere".to_string()),
        }
    );

    held.release().expect("foreign lock must release");
    assert_eq!(engine.status().expect("status").lock, LockView::Free);
}

#[test]
fn stale_lock_from_dead_process_is_reclaimed() {
    let mut harness = Harness::new("lock-stale");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    let abandoned = HostLock::acquire(
        &engine.layout().lock_path(),
        LockOwner {
            pid: DEAD_PID,
            run_id: None,
            acquired_at_unix: 1,
        },
        &|_: u32| true,
    )
    .expect("lock must be acquired");
    std::mem::forget(abandoned);
    assert!(matches!(
        engine.status().expect("status").lock,
        LockView::Stale { pid: DEAD_PID, .. }
    ));

    let report = engine
        .apply(&ApplyOptions::default())
        .expect("apply must reclaim the stale lock");
    assert_eq!(disposition(&report, "alpha"), Disposition::Upgraded);
    assert!(!engine.layout().lock_path().exists());
}

#[test]
fn manual_rollback_restores_previous_version() {
    let mut harness = Harness::new("manual-rollback");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();
    engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");

    let report = engine
        .rollback_component("alpha", &RollbackTarget::Previous)
        .expect("rollback must succeed");
    assert!(!report.not_needed);
    assert_eq!(report.from_version, "1.7.0");
    assert_eq!(report.to_version, "1.6.0");
    assert!(report.rollback_id.is_some());
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");
    assert_eq!(harness.installed_version("alpha").as_deref(), Some("1.6.0"));
    assert_eq!(
        harness.events.kinds().last(),
        Some(&EventKind::RollbackExecuted)
    );

    let again = engine
        .rollback_component("alpha", &RollbackTarget::Previous)
        .expect("second rollback must succeed");
    assert!(again.not_needed);
    assert_eq!(again.rollback_id, None);
}

#[test]
fn rollback_point_must_belong_to_component() {
    let mut harness = Harness::new("rollback-foreign");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    harness.add_component("beta", Some("2.3.0"), &["2.3.0"]);
    let engine = harness.engine();
    let applied = engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");
    let alpha_point = applied
        .component("alpha")
        .and_then(|alpha| alpha.rollback_id.clone())
        .expect("alpha must have a rollback point");

    for target in [
        RollbackTarget::Point(alpha_point),
        RollbackTarget::Point("beta-0-1".to_string()),
    ] {
        let err = engine
            .rollback_component("beta", &target)
            .expect_err("rollback must be refused");
        assert!(matches!(
            UpgradeError::classify(&err),
            Some(UpgradeError::RollbackFailed { .. })
        ));
    }
    assert_eq!(harness.live("beta"), "beta 2.3.0");
}

#[test]
fn rate_limited_registry_falls_back_to_cached_resolution() {
    let mut harness = Harness::new("rate-limit");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();

    let fresh = engine.check(&[]).expect("check must succeed");
    assert_eq!(fresh[0].available_version.as_deref(), Some("1.7.0"));
    assert_eq!(fresh[0].source.as_deref(), Some("upstream:latest"));
    assert!(fresh[0].update_available());

    harness
        .clock
        .advance(harness.config.cache.release_ttl_secs + 1);
    harness.registry.rate_limited.store(true, Ordering::SeqCst);

    let degraded = engine.check(&[]).expect("check must still succeed");
    assert_eq!(degraded[0].available_version.as_deref(), Some("1.7.0"));
    assert!(degraded[0]
        .source
        .as_deref()
        .is_some_and(|source| source.starts_with("cache:")));
    assert_eq!(harness.registry.lookups.load(Ordering::SeqCst), 2);
}

#[test]
fn unresolved_requirement_skips_dependent() {
    let mut harness = Harness::new("unresolved");
    harness.add_component("zeta", Some("1.0.0"), &[]);
    harness.add_component("eta", Some("1.0.0"), &["1.0.0", "1.1.0"]);
    harness.require("eta", ">=1.1.0", "zeta", ">=1.0.0");
    let engine = harness.engine();

    let proposal = engine
        .plan(&PlanOptions::default())
        .expect("plan must succeed");
    assert_eq!(
        proposal.report("zeta").map(|report| report.disposition),
        Some(Disposition::Unresolved)
    );
    let eta = proposal.report("eta").expect("eta must be reported");
    assert_eq!(eta.disposition, Disposition::Skipped);
    assert!(eta
        .detail
        .as_deref()
        .is_some_and(|detail| detail.contains("'zeta'")));
    assert_eq!(proposal.preview().exit_status(), ExitStatus::Failure);
}

#[test]
fn version_override_needs_a_single_component() {
    let mut harness = Harness::new("override");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    harness.add_component("beta", Some("2.3.0"), &["2.3.0"]);
    let engine = harness.engine();

    let err = engine
        .plan(&PlanOptions {
            version_override: Some("1.7.0".to_string()),
            ..PlanOptions::default()
        })
        .expect_err("override across components must fail");
    assert!(matches!(
        UpgradeError::classify(&err),
        Some(UpgradeError::Config(_))
    ));

    let unknown = engine
        .plan(&PlanOptions {
            components: vec!["nope".to_string()],
            ..PlanOptions::default()
        })
        .expect_err("unknown component must fail");
    assert!(matches!(
        UpgradeError::classify(&unknown),
        Some(UpgradeError::UnknownComponent(name)) if name == "nope"
    ));
}

#[test]
fn held_component_is_left_alone_until_released() {
    let mut harness = Harness::new("hold");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let mut record = harness
        .store
        .component("alpha")
        .expect("store")
        .expect("record");
    record.hold = Some(ComponentHold {
        reason: "restore failed".to_string(),
        run_id: None,
        since_unix: 1,
    });
    harness.store.put_component(&record).expect("store hold");
    let engine = harness.engine();

    let held = engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");
    assert_eq!(disposition(&held, "alpha"), Disposition::Held);
    assert_eq!(held.exit_status(), ExitStatus::Blocked);
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");

    let released = engine.release_hold("alpha").expect("hold must release");
    assert!(!released.is_held());
    assert!(engine.release_hold("alpha").is_err());

    let upgraded = engine
        .apply(&ApplyOptions::default())
        .expect("apply must succeed");
    assert_eq!(disposition(&upgraded, "alpha"), Disposition::Upgraded);
}

#[test]
fn adopt_registers_an_existing_install_once() {
    let mut harness = Harness::new("adopt");
    harness.add_component("alpha", None, &["1.6.0", "1.7.0"]);
    fs::write(harness.live_path("alpha"), "alpha 1.6.0").expect("live binary");
    let engine = harness.engine();

    let record = engine.adopt("alpha", "v1.6").expect("adopt must succeed");
    assert_eq!(record.installed_version, "1.6.0");
    assert_eq!(harness.installed_version("alpha").as_deref(), Some("1.6.0"));

    assert!(engine.adopt("alpha", "1.6.0").is_err());
    assert!(matches!(
        engine
            .adopt("nope", "1.0.0")
            .map_err(|err| UpgradeError::classify(&err).cloned()),
        Err(Some(UpgradeError::UnknownComponent(_)))
    ));
}

#[test]
fn cleanup_clears_scratch_and_expired_cache() {
    let mut harness = Harness::new("cleanup");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let engine = harness.engine();
    engine.check(&[]).expect("check must populate the cache");

    let scratch = engine.layout().scratch_dir();
    fs::create_dir_all(scratch.join("alpha-1.7.0")).expect("scratch dir");
    fs::write(scratch.join("leftover.part"), b"partial").expect("scratch file");
    harness
        .clock
        .advance(harness.config.cache.derived_ttl_secs + 1);

    let summary = engine.cleanup().expect("cleanup must succeed");
    assert_eq!(summary.scratch_entries_removed, 2);
    assert!(summary.cache_removed > 0);
    assert!(summary.removed_points.is_empty());
    assert!(fs::read_dir(&scratch).expect("scratch").next().is_none());
}

#[test]
fn status_reports_records_points_and_last_run() {
    let mut harness = Harness::new("status");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    harness.add_component("delta", None, &[]);
    let engine = harness.engine();
    engine
        .apply(&ApplyOptions::default())
        .expect("apply must finish");

    let status = engine.status().expect("status must load");
    let alpha = &status.components[0];
    assert_eq!(alpha.component, "alpha");
    assert_eq!(
        alpha
            .record
            .as_ref()
            .map(|record| record.installed_version.as_str()),
        Some("1.7.0")
    );
    assert_eq!(alpha.rollback_points, 1);
    assert_eq!(
        alpha.latest_point.as_ref().map(|point| point.version.as_str()),
        Some("1.6.0")
    );
    assert!(status.components[1].record.is_none());
    assert!(status.active_run.is_none());
    assert_eq!(
        status.last_run.and_then(|run| run.outcome),
        Some(RunOutcome::Completed)
    );
    assert_eq!(status.lock, LockView::Free);
}

#[test]
fn apply_report_serializes_dispositions_in_kebab_case() {
    let mut harness = Harness::new("json");
    harness.add_component("beta", Some("2.3.0"), &["2.3.0", "2.5.0"]);
    let engine = harness.engine();

    let report = engine
        .apply(&ApplyOptions {
            dry_run: true,
            ..ApplyOptions::default()
        })
        .expect("dry run must succeed");
    let value = serde_json::to_value(&report).expect("report must serialize");

    assert_eq!(value["dry_run"], serde_json::json!(true));
    assert_eq!(
        value["components"][0]["disposition"],
        serde_json::json!("awaiting-approval")
    );
    assert_eq!(value["components"][0]["risk"], serde_json::json!("medium"));
}

#[test]
fn host_asset_selection_matches_platform_and_method() {
    let asset = |name: &str| ReleaseAsset {
        name: name.to_string(),
        browser_download_url: format!("https://releases.example.test/{name}"),
        size: 0,
    };
    let assets = vec![
        asset("SHA256SUMS"),
        asset("tool-linux-amd64.sha256"),
        asset("tool-linux-amd64.tar.gz"),
        asset("tool-linux-amd64"),
        asset("tool-darwin-arm64"),
    ];

    let pick = |method: InstallMethod, os: &str, arch: &str| {
        select_host_asset(&assets, method, os, arch).map(|asset| asset.name.as_str())
    };
    assert_eq!(
        pick(InstallMethod::Binary, "linux", "x86_64"),
        Some("tool-linux-amd64")
    );
    assert_eq!(
        pick(InstallMethod::Archive, "linux", "x86_64"),
        Some("tool-linux-amd64.tar.gz")
    );
    assert_eq!(
        pick(InstallMethod::Binary, "darwin", "aarch64"),
        Some("tool-darwin-arm64")
    );
    assert_eq!(pick(InstallMethod::Binary, "windows", "x86_64"), None);
}

#[test]
fn download_spec_discovers_release_assets() {
    let mut harness = Harness::new("discover");
    harness.add_component("alpha", None, &["1.7.0"]);
    let config = harness.config.components[0].clone();

    let spec = download_spec(&config, "1.7.0", harness.registry.as_ref())
        .expect("assets must be discovered");
    assert_eq!(
        spec.asset_url,
        release_url("alpha", "1.7.0", &host_asset_name("alpha"))
    );
    assert_eq!(
        spec.checksum_url,
        Some(release_url("alpha", "1.7.0", "SHA256SUMS"))
    );
    assert_eq!(spec.signature_url, None);

    let missing = download_spec(&config, "9.9.9", harness.registry.as_ref())
        .expect_err("unknown release must fail");
    assert!(matches!(
        UpgradeError::classify(&missing),
        Some(UpgradeError::DownloadFailed { .. })
    ));
}

#[test]
fn configured_checksum_survives_asset_discovery_and_rejects_tampering() {
    let mut harness = Harness::new("discover-verified");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0"]);
    let asset = host_asset_name("alpha");
    let asset_url = release_url("alpha", "1.7.0", &asset);
    let mut release = Release::new("v1.7.0");
    release.assets = vec![ReleaseAsset {
        name: asset.clone(),
        browser_download_url: asset_url.clone(),
        size: 0,
    }];
    harness.registry.publish("acme/alpha", release);
    harness.fetcher.serve(&asset_url, b"EVIL alpha 1.7.0");
    harness.fetcher.serve(
        "https://sums.example.test/alpha/v1.7.0/SHA256SUMS",
        format!("{}  {asset}\n", sha256_hex(b"alpha 1.7.0")).as_bytes(),
    );
    harness.config.components[0].checksum_url =
        Some("https://sums.example.test/{name}/{tag}/SHA256SUMS".to_string());

    let spec = download_spec(
        &harness.config.components[0],
        "1.7.0",
        harness.registry.as_ref(),
    )
    .expect("assets must be discovered");
    assert_eq!(spec.asset_url, asset_url);
    assert_eq!(
        spec.checksum_url.as_deref(),
        Some("https://sums.example.test/alpha/v1.7.0/SHA256SUMS")
    );

    let report = harness
        .engine()
        .apply(&ApplyOptions::default())
        .expect("apply must finish");

    let alpha = report.component("alpha").expect("alpha must be reported");
    assert_eq!(alpha.disposition, Disposition::Failed);
    assert!(alpha
        .detail
        .as_deref()
        .is_some_and(|detail| detail.contains("checksum verification failed")));
    assert_eq!(harness.live("alpha"), "alpha 1.6.0");
    assert_eq!(harness.supervisor.starts_of("alpha"), 0);
}

#[test]
fn configured_signature_urls_are_kept_when_assets_are_discovered() {
    let mut harness = Harness::new("discover-signed");
    harness.add_component("alpha", Some("1.6.0"), &["1.6.0", "1.7.0"]);
    let config = ComponentConfig {
        checksum_url: Some("https://sums.example.test/{name}/{tag}/SHA256SUMS".to_string()),
        signature_url: Some("https://sums.example.test/{name}/{tag}/SHA256SUMS.sig".to_string()),
        public_key: Some("ab".repeat(32)),
        ..harness.config.components[0].clone()
    };

    let spec = download_spec(&config, "1.7.0", harness.registry.as_ref())
        .expect("assets must be discovered");

    assert_eq!(
        spec.asset_url,
        release_url("alpha", "1.7.0", &host_asset_name("alpha"))
    );
    assert_eq!(
        spec.signature_url.as_deref(),
        Some("https://sums.example.test/alpha/v1.7.0/SHA256SUMS.sig")
    );
    assert_eq!(spec.public_key, config.public_key);
    assert_eq!(spec.verification_gap(), None);
}
