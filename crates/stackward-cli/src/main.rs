use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod completion;
mod dispatch;
mod logging;
mod render;

use completion::CliCompletionShell;
use dispatch::{exit_status_for_error, run_cli};
use logging::{init_logging, LogFormat};
use render::{current_output_style, render_status_line};

const DEFAULT_CONFIG_PATH: &str = "/etc/stackward/stackward.toml";

#[derive(Parser, Debug)]
#[command(name = "stackward")]
#[command(about = "Upgrade orchestration for self-hosted service stacks", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Print machine-readable JSON instead of status lines.
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the newest available version of each component.
    Check {
        #[arg(long = "component", value_name = "NAME")]
        components: Vec<String>,
    },
    /// Evaluate an upgrade plan without changing anything.
    Plan {
        #[arg(long = "component", value_name = "NAME")]
        components: Vec<String>,
        /// Exact target version; needs a single --component.
        #[arg(long, value_name = "VERSION")]
        target: Option<String>,
        /// Approve medium and high risk transitions.
        #[arg(long)]
        yes: bool,
        /// Allow downgrades and blacklisted versions.
        #[arg(long)]
        force: bool,
    },
    Apply {
        #[arg(long = "component", value_name = "NAME")]
        components: Vec<String>,
        #[arg(long, value_name = "VERSION")]
        target: Option<String>,
        #[arg(long, conflicts_with = "dry_run")]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long, conflicts_with = "stop_on_failure")]
        continue_on_failure: bool,
        #[arg(long)]
        stop_on_failure: bool,
    },
    /// Restore a component from a rollback point.
    Rollback {
        #[arg(long, value_name = "NAME")]
        component: Option<String>,
        #[arg(
            long,
            value_name = "ROLLBACK_ID",
            conflicts_with = "previous",
            required_unless_present = "previous"
        )]
        to: Option<String>,
        #[arg(long, requires = "component")]
        previous: bool,
    },
    Status,
    /// Register a component that is already installed on the host.
    Adopt { component: String, version: String },
    /// Drive an interrupted run to completion.
    Resume,
    Cleanup,
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    ReleaseHold { component: String },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_format) {
        eprintln!("warning: {err:#}");
    }

    match run_cli(cli) {
        Ok(status) => ExitCode::from(status.code()),
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "error", &format!("{err:#}"))
            );
            ExitCode::from(exit_status_for_error(&err).code())
        }
    }
}
