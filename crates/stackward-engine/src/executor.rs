use anyhow::{anyhow, Result};
use stackward_core::{
    parse_version, run_id_for, ComponentConfig, ComponentRecord, Event, EventKind, PlanEntry,
    RunOptions, RunOutcome, RunState, StepStatus, UpgradePlan, UpgradeRun,
};
use stackward_installer::DownloadSpec;
use stackward_security::sha256_file_hex;
use tracing::{info, warn};

use crate::artifact::download_spec;
use crate::engine::Engine;
use crate::planner::{PlanOptions, Proposal};
use crate::report::{ApplyReport, ComponentReport, Disposition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    pub plan: PlanOptions,
    pub dry_run: bool,
    /// Overrides `engine.continue_on_failure` for this run.
    pub continue_on_failure: Option<bool>,
}

impl Engine {
    /// Plans and executes an upgrade run. An interrupted run is resumed
    /// instead; the report says so and nothing new is planned.
    pub fn apply(&self, options: &ApplyOptions) -> Result<ApplyReport> {
        if options.dry_run {
            return Ok(self.plan(&options.plan)?.preview());
        }

        let mut lock = self.acquire_lock()?;
        if let Some(run) = self.store.active_run()? {
            warn!(
                run_id = %run.run_id,
                state = %run.state,
                "interrupted run found; resuming it before planning"
            );
            lock.set_run_id(&run.run_id)?;
            let report = self.drive(run, true)?;
            lock.release()?;
            return Ok(report);
        }

        let proposal = self.plan(&options.plan)?;
        if proposal.entries.is_empty() {
            info!("nothing to upgrade");
            lock.release()?;
            return Ok(ApplyReport {
                run_id: None,
                plan_id: None,
                outcome: Some(RunOutcome::NoOp),
                dry_run: false,
                resumed: false,
                components: proposal.components,
            });
        }

        let run = self.start_run(&proposal, options)?;
        lock.set_run_id(&run.run_id)?;
        let mut report = self.drive(run, false)?;
        report.components.extend(proposal.outside_plan().cloned());
        lock.release()?;
        Ok(report)
    }

    /// Applies until the host matches the plan: an interrupted run is
    /// finished first, then whatever is still outstanding is upgraded.
    /// Succeeds without doing anything when all components are current.
    pub fn ensure_upgraded(&self, options: &ApplyOptions) -> Result<ApplyReport> {
        let report = self.apply(options)?;
        if report.resumed {
            return self.apply(options);
        }
        Ok(report)
    }

    /// Drives the last interrupted run to a terminal state. `None` when
    /// there is nothing to resume.
    pub fn resume(&self) -> Result<Option<ApplyReport>> {
        let mut lock = self.acquire_lock()?;
        let Some(run) = self.store.active_run()? else {
            lock.release()?;
            return Ok(None);
        };
        lock.set_run_id(&run.run_id)?;
        let report = self.drive(run, true)?;
        lock.release()?;
        Ok(Some(report))
    }

    fn start_run(&self, proposal: &Proposal, options: &ApplyOptions) -> Result<UpgradeRun> {
        let now = self.clock.now_unix();
        let plan = UpgradePlan {
            plan_id: self.store.next_plan_id()?,
            created_at_unix: proposal.created_at_unix,
            entries: proposal.entries.clone(),
        };

        let base_id = run_id_for(now, self.pid);
        let mut run_id = base_id.clone();
        let mut seq = 1;
        while self.store.load_run(&run_id)?.is_some() {
            seq += 1;
            run_id = format!("{base_id}-{seq}");
        }

        let run_options = RunOptions {
            allow_risky: options.plan.allow_risky,
            force: options.plan.force,
            continue_on_failure: options
                .continue_on_failure
                .unwrap_or(self.config.engine.continue_on_failure),
        };
        let mut run = UpgradeRun::new(run_id, plan, run_options, now, self.pid);
        run.transition(RunState::Planning)?;
        for step in &mut run.steps {
            let Some(report) = proposal.report(&step.component) else {
                continue;
            };
            let status = match report.disposition {
                Disposition::AwaitingApproval => StepStatus::AwaitingApproval,
                Disposition::Rejected => StepStatus::Rejected,
                Disposition::Held | Disposition::Skipped => StepStatus::Skipped,
                _ => continue,
            };
            step.status = status;
            step.detail = report.detail.clone();
        }
        self.store.save_run(&run)?;
        info!(
            run_id = %run.run_id,
            plan_id = run.plan.plan_id,
            entries = run.plan.entries.len(),
            "upgrade run planned"
        );
        Ok(run)
    }

    /// Executes every unsettled step of `run` and settles the run.
    fn drive(&self, mut run: UpgradeRun, resumed: bool) -> Result<ApplyReport> {
        if resumed {
            self.reconcile(&mut run)?;
        }

        let continue_on_failure = run.options.continue_on_failure;
        let mut aborted = !continue_on_failure
            && run.steps[..run.current_index.min(run.steps.len())]
                .iter()
                .any(|step| step.status.is_failure());

        for index in run.current_index..run.steps.len() {
            run.current_index = index;
            if run.steps[index].status.is_settled() {
                continue;
            }
            if aborted {
                self.settle(
                    &mut run,
                    index,
                    StepStatus::Skipped,
                    Some("not attempted after an earlier failure".to_string()),
                )?;
                continue;
            }

            self.run_step(&mut run, index)?;
            if run.steps[index].status.is_failure() && !continue_on_failure {
                aborted = true;
            }
        }

        let outcome = run.derive_outcome();
        run.transition(outcome.terminal_state())?;
        run.outcome = Some(outcome);
        run.completed_at_unix = Some(self.clock.now_unix());
        self.store.save_run(&run)?;
        info!(run_id = %run.run_id, outcome = outcome.as_str(), "upgrade run finished");

        let records = self.records()?;
        let components = run
            .plan
            .entries
            .iter()
            .zip(&run.steps)
            .map(|(entry, step)| {
                let held = records
                    .get(&entry.component)
                    .is_some_and(ComponentRecord::is_held);
                let disposition = match step.status {
                    StepStatus::Skipped if held => Disposition::Held,
                    status => Disposition::from_step(status),
                };
                let mut report = ComponentReport::new(&entry.component, disposition);
                report.from_version = entry.from_version.clone();
                report.to_version = Some(entry.to_version.clone());
                report.risk = Some(entry.risk);
                report.rollback_id = step.rollback_id.clone();
                report.detail = step.detail.clone();
                report
            })
            .collect();

        Ok(ApplyReport {
            run_id: Some(run.run_id.clone()),
            plan_id: Some(run.plan.plan_id),
            outcome: Some(outcome),
            dry_run: false,
            resumed,
            components,
        })
    }

    /// Re-enters the step the run was interrupted in. Only the persisted
    /// sub-status and the files on disk are consulted.
    fn reconcile(&self, run: &mut UpgradeRun) -> Result<()> {
        let index = run.current_index;
        let Some(step) = run.steps.get(index) else {
            return Ok(());
        };
        let component = step.component.clone();
        info!(
            run_id = %run.run_id,
            component = %component,
            step = step.status.as_str(),
            "resuming interrupted run"
        );

        match step.status {
            StepStatus::BackingUp => {
                // a half-written snapshot was never recorded on the step
                run.steps[index].rollback_id = None;
            }
            StepStatus::Upgrading => {
                let point = match run.steps[index].rollback_id.as_deref() {
                    Some(id) => self.rollback.point(id)?,
                    None => None,
                };
                let Some(point) = point else {
                    info!(component = %component, "no rollback point; redoing backup");
                    run.steps[index].rollback_id = None;
                    return self.advance(run, index, RunState::BackingUp, StepStatus::BackingUp);
                };

                let record = self.step_record(&run.plan.entries[index])?;
                let untouched = sha256_file_hex(&record.binary_path)
                    .map(|digest| digest.eq_ignore_ascii_case(&point.binary_sha256))
                    .unwrap_or(false);
                if untouched {
                    info!(component = %component, "live binary unchanged; retrying install");
                    run.steps[index].attempts += 1;
                    self.save(run, index)?;
                } else {
                    self.begin_rollback(
                        run,
                        index,
                        "interrupted during activation; live files no longer match the snapshot"
                            .to_string(),
                    )?;
                }
            }
            StepStatus::Validating => {
                info!(component = %component, "re-running health check");
            }
            StepStatus::RollingBack => {
                info!(component = %component, "re-running restore");
            }
            _ => {}
        }
        Ok(())
    }

    /// Moves one step forward until it settles. Each sub-status is persisted
    /// before the side effect it announces.
    fn run_step(&self, run: &mut UpgradeRun, index: usize) -> Result<()> {
        let entry = run.plan.entries[index].clone();
        let Some(config) = self.config.component(&entry.component).cloned() else {
            return self.settle(
                run,
                index,
                StepStatus::Failed,
                Some("component is no longer configured".to_string()),
            );
        };

        loop {
            match run.steps[index].status {
                StepStatus::Pending => self.begin_step(run, index, &entry)?,
                StepStatus::BackingUp => self.back_up(run, index, &entry)?,
                StepStatus::BackedUp => {
                    run.steps[index].attempts += 1;
                    self.advance(run, index, RunState::Upgrading, StepStatus::Upgrading)?;
                }
                StepStatus::Upgrading => self.upgrade(run, index, &entry, &config)?,
                StepStatus::Validating => self.validate(run, index, &entry, &config)?,
                StepStatus::RollingBack => self.roll_back(run, index, &entry, &config)?,
                _ => return Ok(()),
            }
        }
    }

    fn begin_step(&self, run: &mut UpgradeRun, index: usize, entry: &PlanEntry) -> Result<()> {
        let record = self.store.component(&entry.component)?;
        if let Some(hold) = record.as_ref().and_then(|record| record.hold.as_ref()) {
            return self.settle(
                run,
                index,
                StepStatus::Skipped,
                Some(format!("on hold: {}", hold.reason)),
            );
        }
        if let Some(requirement) = self.unmet_requirement(run, index, entry)? {
            return self.settle(
                run,
                index,
                StepStatus::Skipped,
                Some(format!("requirement '{requirement}' was not upgraded")),
            );
        }
        let installed = record.map(|record| record.installed_version);
        if installed.as_deref() == Some(entry.to_version.as_str()) {
            return self.settle(
                run,
                index,
                StepStatus::Completed,
                Some("already at target version".to_string()),
            );
        }
        if installed != entry.from_version {
            return self.settle(
                run,
                index,
                StepStatus::Failed,
                Some(format!(
                    "installed version changed since planning (now {})",
                    installed.as_deref().unwrap_or("none")
                )),
            );
        }

        self.emit(
            Event::new(
                EventKind::UpgradeStarted,
                &run.run_id,
                &entry.component,
                self.clock.now_unix(),
            )
            .versions(entry.from_version.as_deref(), &entry.to_version),
        );
        info!(
            run_id = %run.run_id,
            component = %entry.component,
            from = entry.from_version.as_deref().unwrap_or("none"),
            to = %entry.to_version,
            risk = %entry.risk,
            "upgrade started"
        );
        self.advance(run, index, RunState::BackingUp, StepStatus::BackingUp)
    }

    fn back_up(&self, run: &mut UpgradeRun, index: usize, entry: &PlanEntry) -> Result<()> {
        if entry.is_fresh_install() {
            return self.save_status(run, index, StepStatus::BackedUp);
        }
        let record = self.step_record(entry)?;
        match self
            .rollback
            .create_snapshot(&record, &record.installed_version)
        {
            Ok(rollback_id) => {
                run.steps[index].rollback_id = Some(rollback_id);
                self.save_status(run, index, StepStatus::BackedUp)
            }
            Err(err) => self.fail(run, index, entry, format!("{err:#}")),
        }
    }

    fn upgrade(
        &self,
        run: &mut UpgradeRun,
        index: usize,
        entry: &PlanEntry,
        config: &ComponentConfig,
    ) -> Result<()> {
        let record = self.target_record(entry, config)?;
        let spec = match download_spec(config, &entry.to_version, self.registry.as_ref()) {
            Ok(spec) => spec,
            Err(err) => return self.fail(run, index, entry, format!("{err:#}")),
        };
        let prepared = match self.installer.prepare(&record, &entry.to_version, &spec) {
            Ok(prepared) => prepared,
            Err(err) => return self.fail(run, index, entry, format!("{err:#}")),
        };

        let activated = self.installer.activate(&record, &prepared, &spec);
        self.installer.discard(&prepared);
        match activated {
            Ok(()) => self.advance(run, index, RunState::Validating, StepStatus::Validating),
            Err(err) => self.begin_rollback(run, index, format!("{err:#}")),
        }
    }

    fn validate(
        &self,
        run: &mut UpgradeRun,
        index: usize,
        entry: &PlanEntry,
        config: &ComponentConfig,
    ) -> Result<()> {
        let record = self.target_record(entry, config)?;
        let health = DownloadSpec {
            health_url: config.health_url.clone(),
            ..DownloadSpec::default()
        };
        if let Err(err) = self.installer.validate(&record, &health) {
            return self.begin_rollback(run, index, format!("{err:#}"));
        }

        let mut installed = record;
        installed.installed_version = entry.to_version.clone();
        installed.hold = None;
        self.store.put_component(&installed)?;
        self.record_locked_version(&entry.component, &entry.to_version);
        self.settle(run, index, StepStatus::Completed, None)?;

        self.emit(
            Event::new(
                EventKind::UpgradeCompleted,
                &run.run_id,
                &entry.component,
                self.clock.now_unix(),
            )
            .versions(entry.from_version.as_deref(), &entry.to_version),
        );
        info!(
            run_id = %run.run_id,
            component = %entry.component,
            version = %entry.to_version,
            "upgrade completed"
        );
        Ok(())
    }

    /// Records the failure that forces a rollback and enters ROLLING_BACK.
    fn begin_rollback(&self, run: &mut UpgradeRun, index: usize, cause: String) -> Result<()> {
        let entry = &run.plan.entries[index];
        warn!(
            run_id = %run.run_id,
            component = %entry.component,
            cause = %cause,
            "upgrade failed after the service was stopped; rolling back"
        );
        self.emit(
            Event::new(
                EventKind::UpgradeFailed,
                &run.run_id,
                &entry.component,
                self.clock.now_unix(),
            )
            .versions(entry.from_version.as_deref(), &entry.to_version)
            .detail(cause.clone()),
        );
        run.steps[index].detail = Some(cause);
        self.advance(run, index, RunState::RollingBack, StepStatus::RollingBack)
    }

    fn roll_back(
        &self,
        run: &mut UpgradeRun,
        index: usize,
        entry: &PlanEntry,
        config: &ComponentConfig,
    ) -> Result<()> {
        let cause = run.steps[index]
            .detail
            .clone()
            .unwrap_or_else(|| "interrupted".to_string());
        let now = self.clock.now_unix();

        // `None` when a first install was retracted instead of restored
        let restored = match run.steps[index].rollback_id.clone() {
            Some(rollback_id) => self
                .rollback
                .restore(&entry.component, &rollback_id, config.health_url.as_deref())
                .map(|record| Some(record.installed_version)),
            None => {
                let record = self.target_record(entry, config)?;
                self.installer.retract(&record).map(|()| None)
            }
        };

        match restored {
            Ok(version) => {
                let detail = match &version {
                    Some(version) => {
                        self.record_locked_version(&entry.component, version);
                        format!("rolled back to {version}: {cause}")
                    }
                    None => format!("first install retracted: {cause}"),
                };
                let version = version.unwrap_or_else(|| "none".to_string());
                self.settle(run, index, StepStatus::RolledBack, Some(detail))?;
                self.emit(
                    Event::new(EventKind::RollbackExecuted, &run.run_id, &entry.component, now)
                        .versions(Some(entry.to_version.as_str()), &version)
                        .detail(cause),
                );
                info!(
                    run_id = %run.run_id,
                    component = %entry.component,
                    version = %version,
                    "rollback executed"
                );
                Ok(())
            }
            Err(err) => {
                let detail = format!("{err:#}");
                let fallback = ComponentRecord::from_config(config, &entry.to_version);
                self.place_hold(&entry.component, Some(fallback), &detail, Some(&run.run_id))?;
                self.settle(
                    run,
                    index,
                    StepStatus::ManualIntervention,
                    Some(format!("{detail} (after: {cause})")),
                )?;
                self.emit(
                    Event::new(
                        EventKind::ManualInterventionRequired,
                        &run.run_id,
                        &entry.component,
                        now,
                    )
                    .versions(entry.from_version.as_deref(), &entry.to_version)
                    .detail(detail),
                );
                Ok(())
            }
        }
    }

    /// A step failure before anything on the host was touched.
    fn fail(
        &self,
        run: &mut UpgradeRun,
        index: usize,
        entry: &PlanEntry,
        detail: String,
    ) -> Result<()> {
        warn!(
            run_id = %run.run_id,
            component = %entry.component,
            error = %detail,
            "upgrade failed; nothing was changed"
        );
        self.emit(
            Event::new(
                EventKind::UpgradeFailed,
                &run.run_id,
                &entry.component,
                self.clock.now_unix(),
            )
            .versions(entry.from_version.as_deref(), &entry.to_version)
            .detail(detail.clone()),
        );
        self.settle(run, index, StepStatus::Failed, Some(detail))
    }

    /// A planned requirement of this entry that did not reach its target.
    fn unmet_requirement(
        &self,
        run: &UpgradeRun,
        index: usize,
        entry: &PlanEntry,
    ) -> Result<Option<String>> {
        let target = parse_version(&entry.to_version)?;
        Ok(self
            .evaluator
            .rules()
            .iter()
            .filter(|rule| rule.applies_to(&entry.component, &target))
            .find(|rule| {
                run.steps[..index].iter().any(|step| {
                    step.component == rule.requires
                        && (step.status.is_failure() || step.status == StepStatus::Skipped)
                })
            })
            .map(|rule| rule.requires.clone()))
    }

    /// The stored record of a component being upgraded in place.
    fn step_record(&self, entry: &PlanEntry) -> Result<ComponentRecord> {
        self.store.component(&entry.component)?.ok_or_else(|| {
            anyhow!(
                "component '{}' has no installed record to upgrade",
                entry.component
            )
        })
    }

    /// Paths the new version is installed to: the stored record, or the
    /// configuration for a first install.
    fn target_record(
        &self,
        entry: &PlanEntry,
        config: &ComponentConfig,
    ) -> Result<ComponentRecord> {
        match self.store.component(&entry.component)? {
            Some(record) => Ok(record),
            None => Ok(ComponentRecord::from_config(config, &entry.to_version)),
        }
    }

    fn advance(
        &self,
        run: &mut UpgradeRun,
        index: usize,
        state: RunState,
        status: StepStatus,
    ) -> Result<()> {
        if run.state != state {
            run.transition(state)?;
        }
        self.save_status(run, index, status)
    }

    fn settle(
        &self,
        run: &mut UpgradeRun,
        index: usize,
        status: StepStatus,
        detail: Option<String>,
    ) -> Result<()> {
        if detail.is_some() {
            run.steps[index].detail = detail;
        }
        self.save_status(run, index, status)
    }

    fn save_status(&self, run: &mut UpgradeRun, index: usize, status: StepStatus) -> Result<()> {
        run.steps[index].status = status;
        self.save(run, index)
    }

    fn save(&self, run: &mut UpgradeRun, index: usize) -> Result<()> {
        run.current_index = index;
        run.steps[index].updated_at_unix = self.clock.now_unix();
        self.store.save_run(run)
    }
}
