use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::InstallMethod;
use crate::reference::{BreakingChangeRecord, CompatibilityRule};
use crate::strategy::Strategy;
use crate::version::parse_version;

pub const OFFLINE_ENV: &str = "STACKWARD_OFFLINE";
pub const TOKEN_ENV: &str = "STACKWARD_REGISTRY_TOKEN";
pub const PIN_ENV_PREFIX: &str = "STACKWARD_PIN_";

/// Root of `stackward.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackwardConfig {
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub retention: RetentionConfig,
    pub health: HealthConfig,
    pub components: Vec<ComponentConfig>,
    pub compatibility: Vec<CompatibilityRule>,
    pub breaking_changes: Vec<BreakingChangeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub offline: bool,
    pub continue_on_failure: bool,
    pub download_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound for a single artifact download.
    pub download_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/stackward"),
            offline: false,
            continue_on_failure: true,
            download_attempts: 3,
            retry_backoff_ms: 500,
            download_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Below this many remaining API calls the resolver stops calling upstream.
    pub quota_floor: u32,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            quota_floor: 10,
            timeout_secs: 15,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub release_ttl_secs: u64,
    pub derived_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            release_ttl_secs: 15 * 60,
            derived_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub keep_last: usize,
    pub max_age_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_last: 5,
            max_age_days: 30,
        }
    }
}

impl RetentionConfig {
    pub fn max_age_secs(&self) -> u64 {
        self.max_age_days.saturating_mul(24 * 60 * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stop_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: 1000,
            stop_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub name: String,
    /// Upstream repository, `owner/name`.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub strategy: Strategy,
    /// Exact version for the `pinned` strategy.
    #[serde(default)]
    pub version: Option<String>,
    /// Requirement for the `range` strategy.
    #[serde(default)]
    pub range: Option<String>,
    /// Requirement identifying long-term-support series for `lts`.
    #[serde(default)]
    pub lts_series: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub fallback_version: Option<String>,
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub service: Option<String>,
    pub binary_path: PathBuf,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub install_method: InstallMethod,
    #[serde(default)]
    pub asset_url: Option<String>,
    #[serde(default)]
    pub checksum_url: Option<String>,
    #[serde(default)]
    pub signature_url: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub handler: Option<PathBuf>,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl ComponentConfig {
    pub fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.name)
    }

    fn validate(&self) -> Result<()> {
        validate_component_name(&self.name)?;

        for (field, value) in [
            ("version", &self.version),
            ("pin", &self.pin),
            ("fallback_version", &self.fallback_version),
        ] {
            if let Some(value) = value {
                parse_version(value)
                    .with_context(|| format!("component '{}' has invalid {field}", self.name))?;
            }
        }
        for entry in &self.blacklist {
            parse_version(entry).with_context(|| {
                format!("component '{}' has invalid blacklist entry", self.name)
            })?;
        }
        for (field, value) in [("range", &self.range), ("lts_series", &self.lts_series)] {
            if let Some(value) = value {
                VersionReq::parse(value).with_context(|| {
                    format!("component '{}' has invalid {field} requirement", self.name)
                })?;
            }
        }

        match self.strategy {
            Strategy::Pinned if self.version.is_none() => {
                return Err(anyhow!(
                    "component '{}' uses strategy 'pinned' but sets no version",
                    self.name
                ));
            }
            Strategy::Range if self.range.is_none() => {
                return Err(anyhow!(
                    "component '{}' uses strategy 'range' but sets no range",
                    self.name
                ));
            }
            Strategy::Latest | Strategy::Lts | Strategy::Range if self.repo.is_none() => {
                return Err(anyhow!(
                    "component '{}' uses strategy '{}' but sets no repo",
                    self.name,
                    self.strategy
                ));
            }
            _ => {}
        }

        if let Some(repo) = &self.repo {
            let valid = repo
                .split_once('/')
                .map(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
                .unwrap_or(false);
            if !valid {
                return Err(anyhow!(
                    "component '{}' repo must be 'owner/name', got '{repo}'",
                    self.name
                ));
            }
        }

        if self.binary_path.as_os_str().is_empty() {
            return Err(anyhow!("component '{}' binary_path is empty", self.name));
        }
        if self.install_method == InstallMethod::Handler && self.handler.is_none() {
            return Err(anyhow!(
                "component '{}' uses install_method 'handler' but sets no handler",
                self.name
            ));
        }
        if self.signature_url.is_some() != self.public_key.is_some() {
            return Err(anyhow!(
                "component '{}' must set signature_url and public_key together",
                self.name
            ));
        }
        if self.signature_url.is_some() && self.checksum_url.is_none() {
            return Err(anyhow!(
                "component '{}' sets signature_url without checksum_url",
                self.name
            ));
        }

        Ok(())
    }
}

impl StackwardConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse stackward config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for component in &self.components {
            component.validate()?;
            if !seen.insert(component.name.as_str()) {
                return Err(anyhow!("duplicate component '{}'", component.name));
            }
        }

        if self.engine.download_attempts == 0 {
            return Err(anyhow!("engine.download_attempts must be at least 1"));
        }
        if self.registry.max_attempts == 0 {
            return Err(anyhow!("registry.max_attempts must be at least 1"));
        }
        if self.registry.timeout_secs == 0
            || self.health.timeout_secs == 0
            || self.engine.download_timeout_secs == 0
        {
            return Err(anyhow!("timeouts must be positive"));
        }
        if self.retention.keep_last == 0 {
            return Err(anyhow!("retention.keep_last must be at least 1"));
        }

        for rule in &self.compatibility {
            if rule.component == rule.requires {
                return Err(anyhow!(
                    "compatibility rule for '{}' requires itself",
                    rule.component
                ));
            }
        }
        for record in &self.breaking_changes {
            if record.to_version <= record.from_version {
                return Err(anyhow!(
                    "breaking change for '{}' must move forward ({} -> {})",
                    record.component,
                    record.from_version,
                    record.to_version
                ));
            }
        }

        Ok(())
    }

    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|component| component.name == name)
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|component| component.name.clone())
            .collect()
    }

    /// Applies `STACKWARD_*` overrides. `lookup` is normally `std::env::var`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(OFFLINE_ENV) {
            self.engine.offline = matches!(raw.trim(), "1" | "true" | "yes" | "on");
            debug!(offline = self.engine.offline, "offline mode from environment");
        }
        if let Some(token) = lookup(TOKEN_ENV).filter(|token| !token.trim().is_empty()) {
            self.registry.token = Some(token);
        }
        for component in &mut self.components {
            if let Some(pin) = lookup(&pin_env_var(&component.name)) {
                let pin = pin.trim().to_string();
                if pin.is_empty() {
                    continue;
                }
                parse_version(&pin).with_context(|| {
                    format!(
                        "{} is not a valid version",
                        pin_env_var(&component.name)
                    )
                })?;
                debug!(component = %component.name, pin = %pin, "pin override from environment");
                component.pin = Some(pin);
            }
        }
        Ok(())
    }
}

pub fn pin_env_var(component: &str) -> String {
    let suffix = component
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("{PIN_ENV_PREFIX}{suffix}")
}

/// Expands `{name}`, `{version}` and `{tag}` in an artifact URL template.
pub fn expand_url_template(template: &str, name: &str, version: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{version}", version)
        .replace("{tag}", &format!("v{version}"))
}

fn validate_component_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 {
        return Err(anyhow!("component name must be 1-64 characters: '{name}'"));
    }
    let starts_valid = bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit();
    let rest_valid = bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(b));
    if !(starts_valid && rest_valid) {
        return Err(anyhow!(
            "component name must use lowercase letters, digits, '.', '_' or '-': '{name}'"
        ));
    }
    Ok(())
}
