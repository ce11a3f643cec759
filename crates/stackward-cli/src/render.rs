use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use stackward_core::RunOutcome;
use stackward_engine::{
    ApplyReport, CheckEntry, CleanupSummary, ComponentReport, Disposition, LockView,
    RollbackReport, RunSummary, StatusReport,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalProgress {
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    /// Spinner on stderr while a blocking engine call runs. Plain output gets
    /// no spinner.
    pub(crate) fn start_progress(self, label: &str) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.cyan.bold} {msg:<12} {elapsed_precise}")
            {
                progress_bar.set_style(style.tick_chars("-=~* "));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

impl TerminalProgress {
    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        println!(
            "{} complete in {}",
            colorize(progress_label_style(), &self.label),
            format_elapsed(self.started_at.elapsed())
        );
    }
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "error" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn disposition_status(disposition: Disposition) -> &'static str {
    match disposition {
        Disposition::Upgraded => "ok",
        Disposition::UpToDate | Disposition::Planned => "step",
        Disposition::AwaitingApproval | Disposition::Held | Disposition::Skipped => "warn",
        Disposition::Rejected
        | Disposition::Unresolved
        | Disposition::Failed
        | Disposition::RolledBack
        | Disposition::ManualIntervention => "error",
    }
}

pub(crate) fn describe_component(report: &ComponentReport) -> String {
    let mut line = format!("{}: {}", report.component, report.disposition);
    match (report.from_version.as_deref(), report.to_version.as_deref()) {
        (Some(from), Some(to)) if from != to => line.push_str(&format!(" {from} -> {to}")),
        (None, Some(to)) => line.push_str(&format!(" (new) -> {to}")),
        (Some(from), _) => line.push_str(&format!(" {from}")),
        (None, None) => {}
    }
    if let Some(risk) = report.risk {
        line.push_str(&format!(" risk={risk}"));
    }
    if let Some(rollback_id) = &report.rollback_id {
        line.push_str(&format!(" rollback={rollback_id}"));
    }
    if let Some(detail) = &report.detail {
        line.push_str(&format!(" ({detail})"));
    }
    line
}

fn format_component_lines(components: &[ComponentReport], style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for report in components {
        lines.push(render_status_line(
            style,
            disposition_status(report.disposition),
            &describe_component(report),
        ));
        for warning in &report.warnings {
            lines.push(render_status_line(
                style,
                "warn",
                &format!("{}: {warning}", report.component),
            ));
        }
    }
    lines
}

pub(crate) fn format_plan_lines(report: &ApplyReport, style: OutputStyle) -> Vec<String> {
    let mut lines = format_component_lines(&report.components, style);
    let planned = report
        .components
        .iter()
        .filter(|component| component.disposition == Disposition::Planned)
        .count();
    let blocked = report
        .components
        .iter()
        .filter(|component| {
            matches!(
                component.disposition,
                Disposition::AwaitingApproval | Disposition::Rejected | Disposition::Held
            )
        })
        .count();
    lines.push(format!("plan: {planned} to upgrade, {blocked} blocked"));
    lines
}

pub(crate) fn format_apply_lines(report: &ApplyReport, style: OutputStyle) -> Vec<String> {
    if report.dry_run {
        let mut lines = format_plan_lines(report, style);
        lines.push("dry run: no changes were made".to_string());
        return lines;
    }

    let mut lines = format_component_lines(&report.components, style);
    let rolled_back = report.rolled_back();
    if !rolled_back.is_empty() {
        lines.push(render_status_line(
            style,
            "error",
            &format!("rolled back: {}", rolled_back.join(", ")),
        ));
    }
    let intervention = report.needing_intervention();
    if !intervention.is_empty() {
        lines.push(render_status_line(
            style,
            "error",
            &format!("manual intervention required: {}", intervention.join(", ")),
        ));
    }

    let summary = match (&report.run_id, report.outcome) {
        (Some(run_id), Some(outcome)) if report.resumed => {
            format!("run {run_id} resumed: {}", outcome.as_str())
        }
        (Some(run_id), Some(outcome)) => format!("run {run_id}: {}", outcome.as_str()),
        (None, Some(RunOutcome::NoOp)) | (None, None) => "nothing to upgrade".to_string(),
        (None, Some(outcome)) => outcome.as_str().to_string(),
        (Some(run_id), None) => format!("run {run_id}"),
    };
    lines.push(summary);
    lines
}

pub(crate) fn format_check_lines(entries: &[CheckEntry], style: OutputStyle) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let held = if entry.held { " [held]" } else { "" };
            if let Some(error) = &entry.error {
                return render_status_line(
                    style,
                    "error",
                    &format!("{}: {error}{held}", entry.component),
                );
            }
            let available = entry.available_version.as_deref().unwrap_or("unknown");
            let source = entry
                .source
                .as_deref()
                .map(|source| format!(" (source={source})"))
                .unwrap_or_default();
            match entry.installed_version.as_deref() {
                Some(installed) if entry.update_available() => render_status_line(
                    style,
                    "warn",
                    &format!(
                        "{}: {installed} -> {available} available{source}{held}",
                        entry.component
                    ),
                ),
                Some(installed) => render_status_line(
                    style,
                    "ok",
                    &format!("{}: {installed} is current{held}", entry.component),
                ),
                None => render_status_line(
                    style,
                    "step",
                    &format!(
                        "{}: not installed, {available} available{source}",
                        entry.component
                    ),
                ),
            }
        })
        .collect()
}

pub(crate) fn format_status_lines(report: &StatusReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for component in &report.components {
        let Some(record) = &component.record else {
            lines.push(render_status_line(
                style,
                "step",
                &format!("{}: not managed", component.component),
            ));
            continue;
        };
        let base = format!(
            "{}: {} (service={}, rollback points={})",
            component.component,
            record.installed_version,
            record.service_name,
            component.rollback_points
        );
        match &record.hold {
            Some(hold) => lines.push(render_status_line(
                style,
                "warn",
                &format!("{base} on hold: {}", hold.reason),
            )),
            None => lines.push(render_status_line(style, "ok", &base)),
        }
    }

    if let Some(run) = &report.active_run {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "run {} was interrupted (state={}); run `stackward resume`",
                run.run_id, run.state
            ),
        ));
    }
    if let Some(run) = &report.last_run {
        lines.push(format!(
            "last run: {} {}",
            run.run_id,
            run.outcome.map(|outcome| outcome.as_str()).unwrap_or("unknown")
        ));
    }
    lines.push(format_lock_line(&report.lock, style));
    lines
}

fn format_lock_line(lock: &LockView, style: OutputStyle) -> String {
    let run = |run_id: &Option<String>| {
        run_id
            .as_deref()
            .map(|run_id| format!(" run={run_id}"))
            .unwrap_or_default()
    };
    match lock {
        LockView::Free => render_status_line(style, "ok", "lock: free"),
        LockView::Held { pid, run_id } => render_status_line(
            style,
            "warn",
            &format!("lock: held by pid {pid}{}", run(run_id)),
        ),
        LockView::Stale { pid, run_id } => render_status_line(
            style,
            "warn",
            &format!("lock: stale, pid {pid} is gone{}", run(run_id)),
        ),
        LockView::Corrupt => render_status_line(style, "error", "lock: unreadable lock file"),
        LockView::Empty => render_status_line(style, "warn", "lock: empty lock file"),
    }
}

pub(crate) fn format_history_lines(runs: &[RunSummary]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["no upgrade runs recorded".to_string()];
    }
    runs.iter()
        .map(|run| {
            let steps = run
                .steps
                .iter()
                .map(|(component, status)| format!("{component}:{status}"))
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{} plan={} state={} outcome={} started={} steps={}",
                run.run_id,
                run.plan_id,
                run.state,
                run.outcome.map(|outcome| outcome.as_str()).unwrap_or("-"),
                run.started_at_unix,
                if steps.is_empty() { "-" } else { steps.as_str() }
            )
        })
        .collect()
}

pub(crate) fn format_rollback_line(report: &RollbackReport, style: OutputStyle) -> String {
    match &report.rollback_id {
        Some(rollback_id) if !report.not_needed => render_status_line(
            style,
            "ok",
            &format!(
                "{}: rolled back {} -> {} (point={rollback_id})",
                report.component, report.from_version, report.to_version
            ),
        ),
        _ => render_status_line(
            style,
            "step",
            &format!(
                "{}: already at {}, no rollback needed",
                report.component, report.to_version
            ),
        ),
    }
}

pub(crate) fn format_cleanup_lines(summary: &CleanupSummary, style: OutputStyle) -> Vec<String> {
    vec![
        render_status_line(
            style,
            "ok",
            &format!(
                "rollback points: removed {}, retained {}",
                summary.removed_points.len(),
                summary.retained_points
            ),
        ),
        render_status_line(
            style,
            "ok",
            &format!(
                "version cache: removed {}, kept {} for offline use",
                summary.cache_removed, summary.cache_retained_offline
            ),
        ),
        render_status_line(
            style,
            "ok",
            &format!("scratch: removed {}", summary.scratch_entries_removed),
        ),
    ]
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}
