use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::reference::{BreakingChangeRecord, CompatibilityRule, Severity};

/// `component.toml` shipped alongside a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub requires: BTreeMap<String, VersionReq>,
    #[serde(default)]
    pub breaking: Vec<ManifestBreakingChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestBreakingChange {
    pub from_version: Version,
    pub to_version: Version,
    pub severity: Severity,
    pub description: String,
}

impl ComponentManifest {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(input).context("failed to parse component manifest")?;
        if manifest.requires.contains_key(&manifest.name) {
            return Err(anyhow!("manifest '{}' requires itself", manifest.name));
        }
        for entry in &manifest.breaking {
            if entry.to_version <= entry.from_version {
                return Err(anyhow!(
                    "manifest '{}' breaking entry must move forward ({} -> {})",
                    manifest.name,
                    entry.from_version,
                    entry.to_version
                ));
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid manifest: {}", path.display()))
    }

    /// One rule per `[requires]` entry, scoped to exactly this manifest's
    /// version.
    pub fn compatibility_rules(&self) -> Result<Vec<CompatibilityRule>> {
        let own = VersionReq::parse(&format!("={}", self.version))
            .with_context(|| format!("manifest '{}' has unusable version", self.name))?;
        Ok(self
            .requires
            .iter()
            .map(|(requires, requires_req)| CompatibilityRule {
                component: self.name.clone(),
                version_req: own.clone(),
                requires: requires.clone(),
                requires_req: requires_req.clone(),
            })
            .collect())
    }

    pub fn breaking_changes(&self) -> Vec<BreakingChangeRecord> {
        self.breaking
            .iter()
            .map(|entry| BreakingChangeRecord {
                component: self.name.clone(),
                from_version: entry.from_version.clone(),
                to_version: entry.to_version.clone(),
                severity: entry.severity,
                description: entry.description.clone(),
            })
            .collect()
    }
}
