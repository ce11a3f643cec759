use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use stackward_core::HealthConfig;
use tracing::{debug, info};

use crate::supervisor::ServiceSupervisor;

/// Optional HTTP-level liveness check on top of the supervisor status.
pub trait LivenessProbe: Send + Sync {
    /// `Ok(false)` means not ready yet; errors are reserved for probes that
    /// can never succeed.
    fn probe(&self, url: &str) -> Result<bool>;
}

pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build liveness http client")?;
        Ok(Self { client })
    }
}

impl LivenessProbe for HttpProbe {
    fn probe(&self, url: &str) -> Result<bool> {
        match self.client.get(url).send() {
            Ok(response) => Ok(response.status().is_success()),
            Err(err) => {
                debug!(url, error = %err, "liveness probe not answering");
                Ok(false)
            }
        }
    }
}

/// Polls the supervisor and the liveness endpoint at a fixed interval until
/// both report healthy or the timeout passes.
pub struct HealthChecker {
    supervisor: Arc<dyn ServiceSupervisor>,
    probe: Arc<dyn LivenessProbe>,
    timeout: Duration,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(
        supervisor: Arc<dyn ServiceSupervisor>,
        probe: Arc<dyn LivenessProbe>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            probe,
            timeout,
            interval,
        }
    }

    pub fn from_config(
        supervisor: Arc<dyn ServiceSupervisor>,
        probe: Arc<dyn LivenessProbe>,
        config: &HealthConfig,
    ) -> Self {
        Self::new(
            supervisor,
            probe,
            Duration::from_secs(config.timeout_secs),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn wait_healthy(&self, service: &str, health_url: Option<&str>) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            let last = match self.poll_once(service, health_url) {
                Ok(None) => {
                    info!(
                        service,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "service healthy"
                    );
                    return Ok(());
                }
                Ok(Some(reason)) => reason,
                Err(err) => format!("{err:#}"),
            };
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "service {service} not healthy after {}s: {last}",
                    self.timeout.as_secs()
                ));
            }
            thread::sleep(self.interval);
        }
    }

    /// `None` when healthy, otherwise why not.
    fn poll_once(&self, service: &str, health_url: Option<&str>) -> Result<Option<String>> {
        if !self.supervisor.is_active(service)? {
            return Ok(Some("supervisor reports inactive".to_string()));
        }
        if let Some(url) = health_url {
            if !self.probe.probe(url)? {
                return Ok(Some(format!("liveness endpoint {url} not ready")));
            }
        }
        Ok(None)
    }
}
