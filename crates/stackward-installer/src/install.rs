use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use stackward_core::{
    expand_url_template, ComponentConfig, ComponentRecord, EngineConfig, HealthConfig, HostLayout,
    InstallMethod, UpgradeError,
};
use stackward_security::{parse_checksum_listing, sha256_file_hex, verify_detached_signature};
use stackward_store::remove_file_if_exists;
use tracing::{info, warn};

use crate::command::{extract_tar_gz, run_handler};
use crate::fetch::ArtifactFetcher;
use crate::fs_ops::{find_file_named, replace_file};
use crate::health::HealthChecker;
use crate::supervisor::{stop_gracefully, ServiceSupervisor, StopPolicy};

/// Where a component version comes from and how it is verified and checked.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadSpec {
    pub asset_url: String,
    pub checksum_url: Option<String>,
    pub signature_url: Option<String>,
    pub public_key: Option<String>,
    pub handler: Option<PathBuf>,
    pub health_url: Option<String>,
}

impl DownloadSpec {
    /// Expands the component's URL templates for `version`. `None` when the
    /// component declares no `asset_url`.
    pub fn from_config(config: &ComponentConfig, version: &str) -> Option<Self> {
        let expand = |template: &String| expand_url_template(template, &config.name, version);
        let asset_url = config.asset_url.as_ref().map(expand)?;
        Some(Self {
            asset_url,
            checksum_url: config.checksum_url.as_ref().map(expand),
            signature_url: config.signature_url.as_ref().map(expand),
            public_key: config.public_key.clone(),
            handler: config.handler.clone(),
            health_url: config.health_url.clone(),
        })
    }

    /// Why this spec cannot be verified the way its component demands. A
    /// configured public key needs both a checksum listing and its signature.
    pub fn verification_gap(&self) -> Option<&'static str> {
        self.public_key.as_ref()?;
        if self.checksum_url.is_none() {
            Some("public key configured but no checksum listing is published")
        } else if self.signature_url.is_none() {
            Some("public key configured but no checksum signature is published")
        } else {
            None
        }
    }

    /// Last path segment of the asset URL, without query or fragment.
    pub fn asset_file_name(&self) -> String {
        let without_query = self
            .asset_url
            .split(|ch: char| ch == '?' || ch == '#')
            .next()
            .unwrap_or_default();
        without_query
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("artifact")
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallerSettings {
    pub download_attempts: u32,
    pub retry_backoff: Duration,
    pub stop: StopPolicy,
}

impl InstallerSettings {
    pub fn from_config(engine: &EngineConfig, health: &HealthConfig) -> Self {
        Self {
            download_attempts: engine.download_attempts.max(1),
            retry_backoff: Duration::from_millis(engine.retry_backoff_ms),
            stop: StopPolicy::from_config(health),
        }
    }
}

/// A downloaded and verified artifact waiting in scratch space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedArtifact {
    pub component: String,
    pub version: String,
    pub dir: PathBuf,
    pub artifact_path: PathBuf,
    /// File swapped over the live binary. Unused for handler installs.
    pub payload: PathBuf,
    pub config_payload: Option<PathBuf>,
    pub sha256: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub component: String,
    pub version: String,
    pub artifact_sha256: String,
    pub attempts: u32,
}

pub struct AtomicInstaller {
    layout: HostLayout,
    fetcher: Arc<dyn ArtifactFetcher>,
    supervisor: Arc<dyn ServiceSupervisor>,
    health: Arc<HealthChecker>,
    settings: InstallerSettings,
}

impl AtomicInstaller {
    pub fn new(
        layout: HostLayout,
        fetcher: Arc<dyn ArtifactFetcher>,
        supervisor: Arc<dyn ServiceSupervisor>,
        health: Arc<HealthChecker>,
        settings: InstallerSettings,
    ) -> Self {
        Self {
            layout,
            fetcher,
            supervisor,
            health,
            settings,
        }
    }

    /// prepare, activate, validate. Scratch files are removed either way.
    pub fn install(
        &self,
        record: &ComponentRecord,
        version: &str,
        spec: &DownloadSpec,
    ) -> Result<InstallReport> {
        let prepared = self.prepare(record, version, spec)?;
        let result = self
            .activate(record, &prepared, spec)
            .and_then(|()| self.validate(record, spec));
        self.discard(&prepared);
        result?;

        Ok(InstallReport {
            component: record.name.clone(),
            version: version.to_string(),
            artifact_sha256: prepared.sha256,
            attempts: prepared.attempts,
        })
    }

    /// Downloads and verifies the artifact, retrying retryable failures up to
    /// `download_attempts`. Nothing outside scratch space is touched.
    pub fn prepare(
        &self,
        record: &ComponentRecord,
        version: &str,
        spec: &DownloadSpec,
    ) -> Result<PreparedArtifact> {
        if let Some(gap) = spec.verification_gap() {
            return Err(UpgradeError::ChecksumMismatch {
                component: record.name.clone(),
                detail: gap.to_string(),
            }
            .into());
        }

        let attempts = self.settings.download_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.prepare_once(record, version, spec) {
                Ok(mut prepared) => {
                    prepared.attempts = attempt;
                    return Ok(prepared);
                }
                Err(err) => {
                    let retryable =
                        UpgradeError::classify(&err).is_some_and(UpgradeError::is_retryable);
                    if !retryable || attempt >= attempts {
                        let _ = fs::remove_dir_all(self.layout.download_dir(&record.name, version));
                        return Err(err);
                    }
                    let delay = self
                        .settings
                        .retry_backoff
                        .saturating_mul(1 << (attempt - 1).min(6));
                    warn!(
                        component = %record.name,
                        attempt,
                        error = %format!("{err:#}"),
                        "artifact preparation failed; retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn prepare_once(
        &self,
        record: &ComponentRecord,
        version: &str,
        spec: &DownloadSpec,
    ) -> Result<PreparedArtifact> {
        let component = record.name.as_str();
        let dir = self.layout.download_dir(component, version);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear {}", dir.display()))?;
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let file_name = spec.asset_file_name();
        let artifact_path = dir.join(&file_name);

        let (download, published) = thread::scope(|scope| {
            let checksum = scope.spawn(|| self.fetch_published_checksum(component, spec));
            let download = self.fetcher.fetch_to(&spec.asset_url, &artifact_path);
            let published = checksum
                .join()
                .unwrap_or_else(|_| Err(anyhow!("checksum fetch thread panicked")));
            (download, published)
        });

        download.map_err(|err| UpgradeError::DownloadFailed {
            component: component.to_string(),
            url: spec.asset_url.clone(),
            detail: format!("{err:#}"),
        })?;
        let published = published?;

        let sha256 = sha256_file_hex(&artifact_path)?;
        match published {
            Some((listing, signature)) => {
                if let Some(key) = spec.public_key.as_deref() {
                    let signature = signature.ok_or_else(|| UpgradeError::ChecksumMismatch {
                        component: component.to_string(),
                        detail: "checksum listing is unsigned".to_string(),
                    })?;
                    verify_detached_signature(listing.as_bytes(), key, &signature).map_err(
                        |err| UpgradeError::ChecksumMismatch {
                            component: component.to_string(),
                            detail: format!("checksum signature rejected: {err:#}"),
                        },
                    )?;
                }
                let expected = parse_checksum_listing(&listing, &file_name).map_err(|err| {
                    UpgradeError::ChecksumMismatch {
                        component: component.to_string(),
                        detail: format!("{err:#}"),
                    }
                })?;
                if !expected.eq_ignore_ascii_case(&sha256) {
                    return Err(UpgradeError::ChecksumMismatch {
                        component: component.to_string(),
                        detail: format!("expected {expected}, downloaded {sha256}"),
                    }
                    .into());
                }
            }
            None => warn!(
                component,
                version, "no published checksum configured; artifact is unverified"
            ),
        }

        let (payload, config_payload) = self.stage_payload(record, &dir, &artifact_path)?;
        info!(component, version, sha256 = %sha256, "artifact prepared");
        Ok(PreparedArtifact {
            component: component.to_string(),
            version: version.to_string(),
            dir,
            artifact_path,
            payload,
            config_payload,
            sha256,
            attempts: 1,
        })
    }

    /// Checksum listing and optional detached signature.
    fn fetch_published_checksum(
        &self,
        component: &str,
        spec: &DownloadSpec,
    ) -> Result<Option<(String, Option<String>)>> {
        let Some(checksum_url) = spec.checksum_url.as_deref() else {
            return Ok(None);
        };
        let fetch = |url: &str| {
            self.fetcher
                .fetch_text(url)
                .map_err(|err| UpgradeError::ChecksumMismatch {
                    component: component.to_string(),
                    detail: format!("could not fetch {url}: {err:#}"),
                })
        };
        let listing = fetch(checksum_url)?;
        let signature = spec.signature_url.as_deref().map(fetch).transpose()?;
        Ok(Some((listing, signature)))
    }

    fn stage_payload(
        &self,
        record: &ComponentRecord,
        dir: &Path,
        artifact_path: &Path,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        match record.install_method {
            InstallMethod::Binary | InstallMethod::Handler => Ok((artifact_path.to_path_buf(), None)),
            InstallMethod::Archive => {
                let extract_dir = dir.join("extract");
                fs::create_dir_all(&extract_dir)
                    .with_context(|| format!("failed to create {}", extract_dir.display()))?;
                extract_tar_gz(artifact_path, &extract_dir)?;

                let binary_name = file_name_of(&record.binary_path)?;
                let payload = find_file_named(&extract_dir, binary_name)?.ok_or_else(|| {
                    anyhow!(
                        "archive {} does not contain '{binary_name}'",
                        artifact_path.display()
                    )
                })?;
                let config_payload = match &record.config_path {
                    Some(config_path) => find_file_named(&extract_dir, file_name_of(config_path)?)?,
                    None => None,
                };
                Ok((payload, config_payload))
            }
        }
    }

    /// Stops the service, swaps the new files in with single renames (or runs
    /// the handler), and starts it again. Every failure is `InstallFailed`.
    pub fn activate(
        &self,
        record: &ComponentRecord,
        prepared: &PreparedArtifact,
        spec: &DownloadSpec,
    ) -> Result<()> {
        self.activate_inner(record, prepared, spec).map_err(|err| {
            UpgradeError::InstallFailed {
                component: record.name.clone(),
                detail: format!("{err:#}"),
            }
            .into()
        })
    }

    fn activate_inner(
        &self,
        record: &ComponentRecord,
        prepared: &PreparedArtifact,
        spec: &DownloadSpec,
    ) -> Result<()> {
        let service = record.service_name.as_str();
        stop_gracefully(self.supervisor.as_ref(), service, self.settings.stop)
            .with_context(|| format!("failed to stop {service}"))?;

        match record.install_method {
            InstallMethod::Binary | InstallMethod::Archive => {
                replace_file(&prepared.payload, &record.binary_path, true)?;
                if let (Some(payload), Some(config_path)) =
                    (&prepared.config_payload, &record.config_path)
                {
                    replace_file(payload, config_path, false)?;
                }
            }
            InstallMethod::Handler => {
                let handler = spec
                    .handler
                    .as_deref()
                    .ok_or_else(|| anyhow!("component '{}' has no install handler", record.name))?;
                run_handler(
                    handler,
                    &record.name,
                    &prepared.version,
                    &prepared.artifact_path,
                )?;
            }
        }

        self.supervisor
            .start(service)
            .with_context(|| format!("failed to start {service}"))?;
        info!(component = %record.name, version = %prepared.version, "new version activated");
        Ok(())
    }

    pub fn validate(&self, record: &ComponentRecord, spec: &DownloadSpec) -> Result<()> {
        self.health
            .wait_healthy(&record.service_name, spec.health_url.as_deref())
            .map_err(|err| {
                UpgradeError::InstallFailed {
                    component: record.name.clone(),
                    detail: format!("health check failed: {err:#}"),
                }
                .into()
            })
    }

    pub fn discard(&self, prepared: &PreparedArtifact) {
        if let Err(err) = fs::remove_dir_all(&prepared.dir) {
            warn!(dir = %prepared.dir.display(), error = %err, "failed to remove scratch dir");
        }
    }

    /// Undoes a failed first install: stops the service and removes the
    /// files that were put in place. There is no previous state to restore.
    pub fn retract(&self, record: &ComponentRecord) -> Result<()> {
        stop_gracefully(
            self.supervisor.as_ref(),
            &record.service_name,
            self.settings.stop,
        )
        .with_context(|| format!("failed to stop {}", record.service_name))?;
        remove_file_if_exists(&record.binary_path)
            .with_context(|| format!("failed to remove {}", record.binary_path.display()))?;
        warn!(component = %record.name, "fresh install retracted");
        Ok(())
    }
}

fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}
