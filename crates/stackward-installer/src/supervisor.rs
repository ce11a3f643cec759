use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use stackward_core::HealthConfig;
use tracing::{debug, warn};

use crate::command::run_command;

/// Process supervisor that owns the component services.
pub trait ServiceSupervisor: Send + Sync {
    fn start(&self, service: &str) -> Result<()>;

    /// Requests a graceful stop. May return before the service has exited.
    fn stop(&self, service: &str) -> Result<()>;

    fn is_active(&self, service: &str) -> Result<bool>;

    /// Forcibly terminates the service.
    fn kill(&self, service: &str) -> Result<()>;
}

pub struct SystemdSupervisor;

impl SystemdSupervisor {
    fn systemctl(args: &[&str], service: &str) -> Result<()> {
        let mut command = Command::new("systemctl");
        command.args(args).arg(service);
        run_command(
            &mut command,
            &format!("systemctl {} {service} failed", args.join(" ")),
        )
    }
}

impl ServiceSupervisor for SystemdSupervisor {
    fn start(&self, service: &str) -> Result<()> {
        Self::systemctl(&["start"], service)
    }

    fn stop(&self, service: &str) -> Result<()> {
        Self::systemctl(&["stop", "--no-block"], service)
    }

    fn is_active(&self, service: &str) -> Result<bool> {
        let status = Command::new("systemctl")
            .arg("is-active")
            .arg("--quiet")
            .arg(service)
            .status()
            .with_context(|| format!("systemctl is-active {service}: command failed to start"))?;
        Ok(status.success())
    }

    fn kill(&self, service: &str) -> Result<()> {
        Self::systemctl(&["kill", "--signal=SIGKILL"], service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl StopPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.stop_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Stops `service` and waits up to the policy timeout for it to exit, then
/// kills it. Fails if the service is still running after the kill.
pub fn stop_gracefully(
    supervisor: &dyn ServiceSupervisor,
    service: &str,
    policy: StopPolicy,
) -> Result<()> {
    if !supervisor.is_active(service)? {
        debug!(service, "service already stopped");
        return Ok(());
    }

    supervisor.stop(service)?;
    let deadline = Instant::now() + policy.timeout;
    loop {
        if !supervisor.is_active(service)? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(policy.poll_interval);
    }

    warn!(
        service,
        timeout_secs = policy.timeout.as_secs(),
        "service did not stop in time; killing"
    );
    supervisor.kill(service)?;
    thread::sleep(policy.poll_interval);
    if supervisor.is_active(service)? {
        return Err(anyhow!("service {service} is still running after kill"));
    }
    Ok(())
}
