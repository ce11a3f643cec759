use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use semver::{Version, VersionReq};
use stackward_core::{
    BreakingChangeRecord, CompatibilityRule, ComponentRecord, HostLayout, InstallMethod,
    PlanEntry, RiskLevel, RollbackPoint, RunOptions, RunState, Severity, UpgradeError,
    UpgradePlan, UpgradeRun, VersionCacheEntry,
};

use super::*;
use crate::lock::reclaim;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout(label: &str) -> HostLayout {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock must be after epoch")
        .as_nanos();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    HostLayout::new(std::env::temp_dir().join(format!(
        "stackward-store-{label}-{}-{nanos}-{seq}",
        std::process::id()
    )))
}

fn cleanup(layout: &HostLayout) {
    let _ = std::fs::remove_dir_all(layout.root());
}

fn record(name: &str, version: &str) -> ComponentRecord {
    ComponentRecord {
        name: name.to_string(),
        installed_version: version.to_string(),
        install_method: InstallMethod::Binary,
        binary_path: PathBuf::from(format!("/usr/local/bin/{name}")),
        config_path: None,
        service_name: name.to_string(),
        metadata: BTreeMap::new(),
        hold: None,
    }
}

fn point(id: &str, component: &str, created: u64) -> RollbackPoint {
    RollbackPoint {
        id: id.to_string(),
        component: component.to_string(),
        version: "1.0.0".to_string(),
        created_at_unix: created,
        binary_backup_path: PathBuf::from(format!("/backups/{component}/{id}/binary")),
        config_backup_path: None,
        state_snapshot: "{}".to_string(),
        binary_sha256: "ab".repeat(32),
        config_sha256: None,
        expires_at_unix: created + 100,
        size_bytes: 4,
    }
}

fn cache_entry(component: &str, key: &str, value: &str) -> VersionCacheEntry {
    VersionCacheEntry {
        component: component.to_string(),
        cache_key: key.to_string(),
        value: value.to_string(),
        cached_at_unix: 10,
        ttl_secs: 900,
    }
}

fn run(run_id: &str, started: u64) -> UpgradeRun {
    let plan = UpgradePlan {
        plan_id: 1,
        created_at_unix: started,
        entries: vec![PlanEntry {
            component: "loki".to_string(),
            from_version: Some("3.0.0".to_string()),
            to_version: "3.1.0".to_string(),
            risk: RiskLevel::Low,
        }],
    };
    UpgradeRun::new(run_id.to_string(), plan, RunOptions::default(), started, 1)
}

fn exercise_store(store: &dyn StateStore) {
    store.put_component(&record("vector", "0.44.0")).expect("must put");
    store.put_component(&record("loki", "3.0.0")).expect("must put");
    store.put_component(&record("loki", "3.1.0")).expect("must replace");
    let components = store.components().expect("must list");
    assert_eq!(
        components.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["loki", "vector"]
    );
    assert_eq!(
        store
            .component("loki")
            .expect("must read")
            .expect("must exist")
            .installed_version,
        "3.1.0"
    );
    assert!(store.component("grafana").expect("must read").is_none());

    assert_eq!(store.next_plan_id().expect("must allocate"), 1);
    assert_eq!(store.next_plan_id().expect("must allocate"), 2);

    let mut finished = run("run-10-1", 10);
    finished.transition(RunState::Planning).expect("must plan");
    finished.transition(RunState::Failed).expect("must fail");
    store.save_run(&finished).expect("must save");
    let mut active = run("run-20-1", 20);
    active.transition(RunState::Planning).expect("must plan");
    store.save_run(&active).expect("must save");

    assert_eq!(store.runs().expect("must list").len(), 2);
    assert_eq!(
        store.active_run().expect("must read").map(|run| run.run_id),
        Some("run-20-1".to_string())
    );
    assert_eq!(
        store.load_run("run-10-1").expect("must load").map(|run| run.state),
        Some(RunState::Failed)
    );
    assert!(store.load_run("run-missing").expect("must load").is_none());

    store.put_rollback_point(&point("rb-2", "loki", 20)).expect("must put");
    store.put_rollback_point(&point("rb-1", "loki", 10)).expect("must put");
    store.put_rollback_point(&point("rb-3", "vector", 15)).expect("must put");
    let loki_points = store.rollback_points(Some("loki")).expect("must list");
    assert_eq!(
        loki_points.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        vec!["rb-1", "rb-2"]
    );
    store.remove_rollback_point("rb-1").expect("must remove");
    assert!(store.rollback_point("rb-1").expect("must read").is_none());
    assert!(store.rollback_point("rb-3").expect("must read").is_some());

    store.put_cache_entry(&cache_entry("loki", "releases", "[]")).expect("must put");
    store.put_cache_entry(&cache_entry("loki", "locked", "3.1.0")).expect("must put");
    store.put_cache_entry(&cache_entry("loki", "locked", "3.1.1")).expect("must replace");
    store.put_cache_entry(&cache_entry("vector", "locked", "0.44.0")).expect("must put");
    assert_eq!(
        store
            .cache_entry("loki", "locked")
            .expect("must read")
            .map(|entry| entry.value),
        Some("3.1.1".to_string())
    );
    assert_eq!(
        store
            .remove_cache_entries("loki", Some(&["releases".to_string()]))
            .expect("must remove"),
        1
    );
    assert_eq!(store.remove_cache_entries("loki", None).expect("must remove"), 1);
    assert_eq!(store.cache_entries().expect("must list").len(), 1);

    let rule = CompatibilityRule {
        component: "grafana".to_string(),
        version_req: VersionReq::parse(">=11.0.0").expect("valid req"),
        requires: "prometheus".to_string(),
        requires_req: VersionReq::parse(">=2.45.0").expect("valid req"),
    };
    store
        .replace_compatibility_rules(std::slice::from_ref(&rule))
        .expect("must replace");
    assert_eq!(store.compatibility_rules().expect("must list"), vec![rule]);

    let breaking = BreakingChangeRecord {
        component: "grafana".to_string(),
        from_version: Version::new(10, 4, 0),
        to_version: Version::new(11, 0, 0),
        severity: Severity::Critical,
        description: "angular removed".to_string(),
    };
    store
        .replace_breaking_changes(std::slice::from_ref(&breaking))
        .expect("must replace");
    assert_eq!(store.breaking_changes().expect("must list"), vec![breaking]);
}

#[test]
fn memory_store_supports_all_tables() {
    exercise_store(&MemoryStateStore::new());
}

#[test]
fn file_store_supports_all_tables() {
    let layout = test_layout("tables");
    let store = FileStateStore::open(layout.clone()).expect("must open");
    exercise_store(&store);

    assert!(layout.table_path("installed_components").is_file());
    assert!(layout.run_path("run-20-1").is_file());
    cleanup(&layout);
}

#[test]
fn file_store_survives_reopen() {
    let layout = test_layout("reopen");
    {
        let store = FileStateStore::open(layout.clone()).expect("must open");
        store.put_component(&record("loki", "3.0.0")).expect("must put");
        store.next_plan_id().expect("must allocate");
        store.save_run(&run("run-1-1", 1)).expect("must save");
    }

    let reopened = FileStateStore::open(layout.clone()).expect("must reopen");
    assert_eq!(reopened.components().expect("must list").len(), 1);
    assert_eq!(reopened.next_plan_id().expect("must allocate"), 2);
    assert_eq!(
        reopened.active_run().expect("must read").map(|run| run.run_id),
        Some("run-1-1".to_string())
    );
    cleanup(&layout);
}

#[test]
fn file_store_reports_corrupt_documents() {
    let layout = test_layout("corrupt");
    let store = FileStateStore::open(layout.clone()).expect("must open");
    std::fs::write(layout.table_path("installed_components"), "{not json")
        .expect("must write corrupt table");

    let err = store.components().expect_err("corrupt table must fail");
    assert!(err.to_string().contains("failed parsing state document"));
    cleanup(&layout);
}

#[test]
fn atomic_write_replaces_without_leftovers() {
    let layout = test_layout("atomic");
    let path = layout.root().join("doc.json");
    atomic_write(&path, b"one").expect("must write");
    atomic_write(&path, b"two").expect("must replace");

    assert_eq!(std::fs::read_to_string(&path).expect("must read"), "two");
    let entries = std::fs::read_dir(layout.root())
        .expect("must list")
        .count();
    assert_eq!(entries, 1);
    cleanup(&layout);
}

fn owner(pid: u32) -> LockOwner {
    LockOwner {
        pid,
        run_id: None,
        acquired_at_unix: 1,
    }
}

#[test]
fn host_lock_blocks_live_owner() {
    let layout = test_layout("lock-live");
    let path = layout.lock_path();
    let mut lock = HostLock::acquire(&path, owner(100), &|_| true).expect("must acquire");
    lock.set_run_id("run-1-100").expect("must record run");

    let err = HostLock::acquire(&path, owner(200), &|_| true).expect_err("must be held");
    match UpgradeError::classify(&err) {
        Some(UpgradeError::ConcurrentRunDetected { run_id, owner_pid }) => {
            assert_eq!(run_id, "run-1-100");
            assert_eq!(*owner_pid, 100);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    lock.release().expect("must release");
    assert_eq!(
        HostLock::inspect(&path, &|_| true).expect("must inspect"),
        LockStatus::Free
    );
    cleanup(&layout);
}

#[test]
fn host_lock_reclaims_stale_owner() {
    let layout = test_layout("lock-stale");
    let path = layout.lock_path();
    let stale = HostLock::acquire(&path, owner(100), &|_| true).expect("must acquire");
    std::mem::forget(stale);

    let alive = |pid: u32| pid != 100;
    assert!(matches!(
        HostLock::inspect(&path, &alive).expect("must inspect"),
        LockStatus::Stale(LockOwner { pid: 100, .. })
    ));

    let lock = HostLock::acquire(&path, owner(200), &alive).expect("must reclaim");
    assert_eq!(lock.owner().pid, 200);
    drop(lock);
    assert!(!path.exists());
    cleanup(&layout);
}

#[test]
fn host_lock_reclaims_unreadable_file() {
    let layout = test_layout("lock-corrupt");
    let path = layout.lock_path();
    std::fs::create_dir_all(layout.root()).expect("must create root");
    std::fs::write(&path, "garbage").expect("must write");

    assert_eq!(
        HostLock::inspect(&path, &|_| true).expect("must inspect"),
        LockStatus::Corrupt
    );
    let lock = HostLock::acquire(&path, owner(300), &|_| true).expect("must reclaim");
    assert_eq!(lock.owner().pid, 300);
    drop(lock);
    cleanup(&layout);
}

#[test]
fn empty_lock_file_is_never_reclaimed() {
    let layout = test_layout("lock-empty");
    let path = layout.lock_path();
    std::fs::create_dir_all(layout.root()).expect("must create root");
    std::fs::write(&path, "").expect("must write");

    assert_eq!(
        HostLock::inspect(&path, &|_| true).expect("must inspect"),
        LockStatus::Empty
    );
    let err = HostLock::acquire(&path, owner(300), &|_| true).expect_err("must stay blocked");
    assert!(matches!(
        UpgradeError::classify(&err),
        Some(UpgradeError::ConcurrentRunDetected { .. })
    ));
    assert!(path.exists());
    cleanup(&layout);
}

#[test]
fn acquired_lock_leaves_no_claim_files_behind() {
    let layout = test_layout("lock-claim");
    let path = layout.lock_path();
    let lock = HostLock::acquire(&path, owner(100), &|_| true).expect("must acquire");

    let raw = std::fs::read_to_string(&path).expect("must read lock");
    let written: LockOwner = serde_json::from_str(&raw).expect("lock holds its owner");
    assert_eq!(written.pid, 100);
    let parent = path.parent().expect("lock has a parent");
    let leftovers = std::fs::read_dir(parent)
        .expect("must list")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".claim"))
        .count();
    assert_eq!(leftovers, 0);

    drop(lock);
    cleanup(&layout);
}

#[test]
fn reclaim_leaves_a_lock_that_changed_hands() {
    let layout = test_layout("lock-handover");
    let path = layout.lock_path();
    let stale = HostLock::acquire(&path, owner(100), &|_| true).expect("must acquire");
    std::mem::forget(stale);
    let stale_raw = std::fs::read_to_string(&path).expect("must read lock");

    std::fs::remove_file(&path).expect("first reclaimer removes the stale lock");
    let winner = HostLock::acquire(&path, owner(200), &|_| true).expect("winner acquires");

    reclaim(&path, &stale_raw).expect("late reclaim must not fail");

    assert!(matches!(
        HostLock::inspect(&path, &|_| true).expect("must inspect"),
        LockStatus::Held(LockOwner { pid: 200, .. })
    ));
    drop(winner);
    cleanup(&layout);
}

#[test]
fn current_process_is_alive() {
    assert!(process_alive(std::process::id()));
}
