use std::sync::Arc;

use anyhow::{Context, Result};
use semver::Version;
use stackward_core::{ComponentConfig, StackwardConfig, Strategy, UpgradeError};
use stackward_registry::{ReleaseRegistry, VersionCache};
use tracing::{debug, info};

use crate::sources::{
    ConfigFallbackSource, ManifestSource, OverrideSource, PinSource, ResolveRequest,
    StrategySource, VersionSource,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub version: Version,
    /// Which source produced the version, e.g. `pin` or `upstream:latest`.
    pub source: String,
}

impl Resolution {
    pub fn new(version: Version, source: &str) -> Self {
        Self {
            version,
            source: source.to_string(),
        }
    }
}

/// Walks an ordered list of sources until one produces a version.
pub struct Resolver {
    sources: Vec<Box<dyn VersionSource>>,
}

impl Resolver {
    pub fn new(sources: Vec<Box<dyn VersionSource>>) -> Self {
        Self { sources }
    }

    /// Override, pin, strategy, config fallback, manifest.
    pub fn standard(
        registry: Arc<dyn ReleaseRegistry>,
        cache: Arc<VersionCache>,
        config: &StackwardConfig,
    ) -> Self {
        Self::new(vec![
            Box::new(OverrideSource),
            Box::new(PinSource),
            Box::new(StrategySource::new(
                registry,
                cache,
                config.registry.quota_floor,
                config.cache.release_ttl_secs,
                config.cache.derived_ttl_secs,
            )),
            Box::new(ConfigFallbackSource),
            Box::new(ManifestSource),
        ])
    }

    pub fn resolve(
        &self,
        component: &ComponentConfig,
        strategy_override: Option<Strategy>,
    ) -> Result<Resolution> {
        self.resolve_request(&ResolveRequest {
            component,
            strategy: strategy_override.unwrap_or(component.strategy),
            version_override: None,
        })
    }

    pub fn resolve_request(&self, request: &ResolveRequest<'_>) -> Result<Resolution> {
        let name = &request.component.name;
        for source in &self.sources {
            let resolved = source.resolve(request).with_context(|| {
                format!("version source '{}' failed for '{name}'", source.name())
            })?;
            match resolved {
                Some(resolution) => {
                    info!(
                        component = %name,
                        version = %resolution.version,
                        source = %resolution.source,
                        "version resolved"
                    );
                    return Ok(resolution);
                }
                None => debug!(component = %name, source = source.name(), "source fell through"),
            }
        }

        Err(UpgradeError::VersionUnresolved {
            component: name.clone(),
            detail: format!(
                "strategy '{}' and every fallback produced no version",
                request.strategy
            ),
        }
        .into())
    }
}
