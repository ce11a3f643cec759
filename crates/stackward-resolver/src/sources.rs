use std::sync::Arc;

use anyhow::{Context, Result};
use semver::{Version, VersionReq};
use stackward_core::{parse_version, ComponentConfig, ComponentManifest, Strategy, UpgradeError};
use stackward_registry::{
    resolved_key, RegistryError, Release, ReleaseRegistry, VersionCache, LATEST_RELEASE_KEY,
    LOCKED_KEY, RELEASES_KEY,
};
use tracing::{debug, warn};

use crate::resolve::Resolution;

pub struct ResolveRequest<'a> {
    pub component: &'a ComponentConfig,
    pub strategy: Strategy,
    /// Per-invocation version chosen by the operator.
    pub version_override: Option<&'a str>,
}

/// One step of the resolution fallback chain.
///
/// `Ok(None)` falls through to the next source; an error stops resolution.
pub trait VersionSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>>;
}

pub struct OverrideSource;

impl VersionSource for OverrideSource {
    fn name(&self) -> &'static str {
        "override"
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>> {
        request
            .version_override
            .map(|raw| {
                parse_version(raw)
                    .map(|version| Resolution::new(version, "override"))
                    .with_context(|| {
                        format!("invalid version override for '{}'", request.component.name)
                    })
            })
            .transpose()
    }
}

/// Operator pin. `STACKWARD_PIN_<NAME>` is merged into the component's `pin`
/// when the config is loaded, taking precedence over the file.
pub struct PinSource;

impl VersionSource for PinSource {
    fn name(&self) -> &'static str {
        "pin"
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>> {
        request
            .component
            .pin
            .as_deref()
            .map(|raw| {
                parse_version(raw)
                    .map(|version| Resolution::new(version, "pin"))
                    .with_context(|| format!("invalid pin for '{}'", request.component.name))
            })
            .transpose()
    }
}

pub struct StrategySource {
    registry: Arc<dyn ReleaseRegistry>,
    cache: Arc<VersionCache>,
    quota_floor: u32,
    release_ttl_secs: u64,
    derived_ttl_secs: u64,
}

impl StrategySource {
    pub fn new(
        registry: Arc<dyn ReleaseRegistry>,
        cache: Arc<VersionCache>,
        quota_floor: u32,
        release_ttl_secs: u64,
        derived_ttl_secs: u64,
    ) -> Self {
        Self {
            registry,
            cache,
            quota_floor,
            release_ttl_secs,
            derived_ttl_secs,
        }
    }

    fn resolve_upstream(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>> {
        let component = request.component;
        let strategy = request.strategy;
        let Some(repo) = component.repo.as_deref() else {
            debug!(component = %component.name, %strategy, "no upstream repo configured");
            return Ok(None);
        };
        let derived_key = resolved_key(strategy.as_str());

        if let Some(releases) = self.releases(&component.name, repo, strategy)? {
            let Some(version) = select_release(strategy, component, &releases)? else {
                debug!(component = %component.name, %strategy, "no release satisfies strategy");
                return Ok(None);
            };
            self.remember(
                &component.name,
                &derived_key,
                &version.to_string(),
                self.derived_ttl_secs,
            );
            return Ok(Some(Resolution::new(version, &format!("upstream:{strategy}"))));
        }

        let Some(raw) = self.cached(&component.name, &derived_key) else {
            return Ok(None);
        };
        match parse_version(&raw) {
            Ok(version) => {
                warn!(
                    component = %component.name,
                    %version,
                    "registry unavailable; using cached resolution"
                );
                Ok(Some(Resolution::new(version, &format!("cache:{derived_key}"))))
            }
            Err(err) => {
                warn!(
                    component = %component.name,
                    key = %derived_key,
                    error = %format!("{err:#}"),
                    "discarding unreadable cached resolution"
                );
                Ok(None)
            }
        }
    }

    /// Release data from the cache, or the registry when the cache is cold and
    /// the quota allows it. `latest` asks for the single latest release before
    /// listing. `None` means no release data is available.
    fn releases(
        &self,
        component: &str,
        repo: &str,
        strategy: Strategy,
    ) -> Result<Option<Vec<Release>>> {
        let latest = strategy == Strategy::Latest;
        if let Some(releases) = self.cached_releases(component, RELEASES_KEY) {
            return Ok(Some(releases));
        }
        if latest {
            if let Some(releases) = self.cached_releases(component, LATEST_RELEASE_KEY) {
                return Ok(Some(releases));
            }
        }

        if self.cache.is_offline() {
            debug!(component, "offline; skipping registry");
            return Ok(None);
        }
        if let Some(remaining) = self.registry.remaining_quota() {
            if remaining < self.quota_floor {
                warn!(
                    component,
                    remaining,
                    floor = self.quota_floor,
                    "registry quota below floor; resolving in degraded mode"
                );
                return Ok(None);
            }
        }

        if latest {
            match self.registry.latest_release(repo) {
                Ok(release) if release.is_stable() => {
                    let releases = vec![release];
                    self.store_releases(component, LATEST_RELEASE_KEY, &releases)?;
                    return Ok(Some(releases));
                }
                Ok(release) => debug!(
                    component,
                    tag = %release.tag_name,
                    "latest release is not a stable version; listing releases"
                ),
                Err(RegistryError::NotFound(_)) => {
                    debug!(component, "no latest release published; listing releases")
                }
                Err(err) => {
                    registry_unavailable(component, &err);
                    return Ok(None);
                }
            }
        }

        match self.registry.list_releases(repo) {
            Ok(releases) => {
                self.store_releases(component, RELEASES_KEY, &releases)?;
                Ok(Some(releases))
            }
            Err(err) => {
                registry_unavailable(component, &err);
                Ok(None)
            }
        }
    }

    fn cached_releases(&self, component: &str, key: &str) -> Option<Vec<Release>> {
        let raw = self.cached(component, key)?;
        match serde_json::from_str::<Vec<Release>>(&raw) {
            Ok(releases) => Some(releases),
            Err(err) => {
                warn!(component, key, error = %err, "discarding unreadable release cache");
                None
            }
        }
    }

    fn store_releases(&self, component: &str, key: &str, releases: &[Release]) -> Result<()> {
        let encoded = serde_json::to_string(releases).context("failed to encode release list")?;
        self.remember(component, key, &encoded, self.release_ttl_secs);
        Ok(())
    }

    /// Cache reads degrade to a miss so the rest of the chain still runs.
    fn cached(&self, component: &str, key: &str) -> Option<String> {
        match self.cache.get(component, key) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    component,
                    key,
                    error = %format!("{err:#}"),
                    "version cache read failed; treating as a miss"
                );
                None
            }
        }
    }

    fn remember(&self, component: &str, key: &str, value: &str, ttl_secs: u64) {
        if let Err(err) = self.cache.set(component, key, value, ttl_secs) {
            warn!(
                component,
                key,
                error = %format!("{err:#}"),
                "version cache write failed"
            );
        }
    }
}

fn registry_unavailable(component: &str, err: &RegistryError) {
    match err {
        RegistryError::RateLimited { reset_at_unix } => {
            warn!(component, ?reset_at_unix, "registry rate limited; falling back")
        }
        err => warn!(component, error = %err, "registry lookup failed; falling back"),
    }
}

impl VersionSource for StrategySource {
    fn name(&self) -> &'static str {
        "strategy"
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>> {
        let component = request.component;
        match request.strategy {
            Strategy::Pinned => component
                .version
                .as_deref()
                .map(|raw| {
                    parse_version(raw)
                        .map(|version| Resolution::new(version, "strategy:pinned"))
                        .with_context(|| {
                            format!("invalid pinned version for '{}'", component.name)
                        })
                })
                .transpose(),
            Strategy::Locked => {
                let Some(raw) = self.cached(&component.name, LOCKED_KEY) else {
                    return Err(UpgradeError::VersionUnresolved {
                        component: component.name.clone(),
                        detail: "strategy 'locked' has no recorded version".to_string(),
                    }
                    .into());
                };
                let version = parse_version(&raw)
                    .with_context(|| format!("invalid locked version for '{}'", component.name))?;
                Ok(Some(Resolution::new(version, "strategy:locked")))
            }
            Strategy::Latest | Strategy::Lts | Strategy::Range => self.resolve_upstream(request),
        }
    }
}

pub struct ConfigFallbackSource;

impl VersionSource for ConfigFallbackSource {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>> {
        request
            .component
            .fallback_version
            .as_deref()
            .map(|raw| {
                parse_version(raw)
                    .map(|version| Resolution::new(version, "fallback"))
                    .with_context(|| {
                        format!("invalid fallback_version for '{}'", request.component.name)
                    })
            })
            .transpose()
    }
}

pub struct ManifestSource;

impl VersionSource for ManifestSource {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Option<Resolution>> {
        let Some(path) = request.component.manifest.as_deref() else {
            return Ok(None);
        };
        match ComponentManifest::load(path) {
            Ok(manifest) => Ok(Some(Resolution::new(manifest.version, "manifest"))),
            Err(err) => {
                warn!(
                    component = %request.component.name,
                    error = %format!("{err:#}"),
                    "component manifest unavailable"
                );
                Ok(None)
            }
        }
    }
}

fn select_release(
    strategy: Strategy,
    component: &ComponentConfig,
    releases: &[Release],
) -> Result<Option<Version>> {
    let stable = releases
        .iter()
        .filter(|release| release.is_stable())
        .filter_map(|release| release.version().ok().map(|version| (version, release)));

    let selected = match strategy {
        Strategy::Latest => stable.map(|(version, _)| version).max(),
        Strategy::Lts => {
            let series = component
                .lts_series
                .as_deref()
                .map(VersionReq::parse)
                .transpose()
                .with_context(|| format!("invalid lts_series for '{}'", component.name))?;
            stable
                .filter(|(version, release)| {
                    release.is_flagged_lts()
                        || series.as_ref().is_some_and(|req| req.matches(version))
                })
                .map(|(version, _)| version)
                .max()
        }
        Strategy::Range => {
            let Some(range) = component.range.as_deref() else {
                return Ok(None);
            };
            let req = VersionReq::parse(range)
                .with_context(|| format!("invalid range for '{}'", component.name))?;
            stable
                .map(|(version, _)| version)
                .filter(|version| req.matches(version))
                .max()
        }
        Strategy::Pinned | Strategy::Locked => None,
    };
    Ok(selected)
}
