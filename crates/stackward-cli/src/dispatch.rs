use std::io;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Serialize;
use stackward_core::{StackwardConfig, UpgradeError};
use stackward_engine::{
    ApplyOptions, Engine, ExitStatus, PlanOptions, RollbackTarget, RunSummary,
};
use tracing::debug;

use crate::completion::write_completions_script;
use crate::render::{
    format_apply_lines, format_check_lines, format_cleanup_lines, format_history_lines,
    format_plan_lines, format_rollback_line, format_status_lines, TerminalRenderer,
};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<ExitStatus> {
    let renderer = TerminalRenderer::current();

    if let Commands::Completions { shell } = cli.command {
        write_completions_script(shell, &mut io::stdout().lock())?;
        return Ok(ExitStatus::Success);
    }

    let config = load_config(&cli.config)?;
    let engine = Engine::open(config)?;

    match cli.command {
        Commands::Check { components } => {
            let entries = engine.check(&components)?;
            let status = if entries.iter().any(|entry| entry.error.is_some()) {
                ExitStatus::Failure
            } else {
                ExitStatus::Success
            };
            if cli.json {
                print_json(&entries)?;
            } else {
                renderer.print_section("check");
                renderer.print_lines(&format_check_lines(&entries, renderer.style()));
            }
            Ok(status)
        }
        Commands::Plan {
            components,
            target,
            yes,
            force,
        } => {
            let options = plan_options(components, target, yes, force);
            let preview = engine.plan(&options)?.preview();
            if cli.json {
                print_json(&preview)?;
            } else {
                renderer.print_section("plan");
                renderer.print_lines(&format_plan_lines(&preview, renderer.style()));
            }
            Ok(preview.exit_status())
        }
        Commands::Apply {
            components,
            target,
            yes,
            dry_run,
            force,
            continue_on_failure,
            stop_on_failure,
        } => {
            let options = ApplyOptions {
                plan: plan_options(components, target, yes, force),
                dry_run,
                continue_on_failure: failure_policy(continue_on_failure, stop_on_failure),
            };
            let progress = (!cli.json).then(|| renderer.start_progress("apply"));
            let result = engine.apply(&options);
            if let Some(progress) = progress {
                progress.finish();
            }
            let report = result?;
            if cli.json {
                print_json(&report)?;
            } else {
                renderer.print_section("apply");
                renderer.print_lines(&format_apply_lines(&report, renderer.style()));
            }
            Ok(report.exit_status())
        }
        Commands::Rollback {
            component,
            to,
            previous: _,
        } => {
            let component = match (component, to.as_deref()) {
                (Some(component), _) => component,
                (None, Some(rollback_id)) => engine
                    .rollback_point(rollback_id)?
                    .map(|point| point.component)
                    .ok_or_else(|| anyhow!("rollback point '{rollback_id}' not found"))?,
                (None, None) => return Err(anyhow!("--previous needs --component")),
            };
            let target = match to {
                Some(rollback_id) => RollbackTarget::Point(rollback_id),
                None => RollbackTarget::Previous,
            };
            let report = engine.rollback_component(&component, &target)?;
            if cli.json {
                print_json(&report)?;
            } else {
                renderer.print_lines(&[format_rollback_line(&report, renderer.style())]);
            }
            Ok(ExitStatus::Success)
        }
        Commands::Status => {
            let report = engine.status()?;
            let held = report.components.iter().any(|component| {
                component
                    .record
                    .as_ref()
                    .is_some_and(|record| record.is_held())
            });
            if cli.json {
                print_json(&report)?;
            } else {
                renderer.print_section("status");
                renderer.print_lines(&format_status_lines(&report, renderer.style()));
            }
            if held || report.active_run.is_some() {
                Ok(ExitStatus::Blocked)
            } else {
                Ok(ExitStatus::Success)
            }
        }
        Commands::Adopt { component, version } => {
            let record = engine.adopt(&component, &version)?;
            if cli.json {
                print_json(&record)?;
            } else {
                renderer.print_status(
                    "ok",
                    &format!("adopted {} at {}", record.name, record.installed_version),
                );
            }
            Ok(ExitStatus::Success)
        }
        Commands::Resume => {
            let progress = (!cli.json).then(|| renderer.start_progress("resume"));
            let result = engine.resume();
            if let Some(progress) = progress {
                progress.finish();
            }
            match result? {
                Some(report) => {
                    if cli.json {
                        print_json(&report)?;
                    } else {
                        renderer.print_section("resume");
                        renderer.print_lines(&format_apply_lines(&report, renderer.style()));
                    }
                    Ok(report.exit_status())
                }
                None => {
                    if cli.json {
                        print_json(&serde_json::Value::Null)?;
                    } else {
                        renderer.print_status("step", "no interrupted run");
                    }
                    Ok(ExitStatus::Success)
                }
            }
        }
        Commands::Cleanup => {
            let summary = engine.cleanup()?;
            if cli.json {
                print_json(&summary)?;
            } else {
                renderer.print_lines(&format_cleanup_lines(&summary, renderer.style()));
            }
            Ok(ExitStatus::Success)
        }
        Commands::History { limit } => {
            let runs = engine
                .history(limit)?
                .iter()
                .map(RunSummary::from)
                .collect::<Vec<_>>();
            if cli.json {
                print_json(&runs)?;
            } else {
                renderer.print_lines(&format_history_lines(&runs));
            }
            Ok(ExitStatus::Success)
        }
        Commands::ReleaseHold { component } => {
            let record = engine.release_hold(&component)?;
            if cli.json {
                print_json(&record)?;
            } else {
                renderer.print_status(
                    "ok",
                    &format!(
                        "released hold on {} (installed {})",
                        record.name, record.installed_version
                    ),
                );
            }
            Ok(ExitStatus::Success)
        }
        Commands::Completions { .. } => Ok(ExitStatus::Success),
    }
}

/// Reads the TOML config and layers `STACKWARD_*` environment overrides on
/// top.
pub(crate) fn load_config(path: &Path) -> Result<StackwardConfig> {
    debug!(path = %path.display(), "loading config");
    let mut config = StackwardConfig::load(path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    debug!(
        components = config.components.len(),
        offline = config.engine.offline,
        "config loaded"
    );
    Ok(config)
}

pub(crate) fn plan_options(
    components: Vec<String>,
    target: Option<String>,
    yes: bool,
    force: bool,
) -> PlanOptions {
    PlanOptions {
        components,
        version_override: target,
        allow_risky: yes,
        force,
    }
}

/// `None` defers to `engine.continue_on_failure`.
pub(crate) fn failure_policy(continue_on_failure: bool, stop_on_failure: bool) -> Option<bool> {
    if continue_on_failure {
        Some(true)
    } else if stop_on_failure {
        Some(false)
    } else {
        None
    }
}

/// Blocking outcomes and a concurrent run exit 2; everything else exits 1.
pub(crate) fn exit_status_for_error(err: &anyhow::Error) -> ExitStatus {
    match UpgradeError::classify(err) {
        Some(typed) if typed.is_blocking() => ExitStatus::Blocked,
        Some(UpgradeError::ConcurrentRunDetected { .. }) => ExitStatus::Blocked,
        _ => ExitStatus::Failure,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
