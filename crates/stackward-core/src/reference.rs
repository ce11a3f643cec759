use std::fmt;
use std::path::PathBuf;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// `(component, version_req) requires (requires, requires_req)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompatibilityRule {
    pub component: String,
    pub version_req: VersionReq,
    pub requires: String,
    pub requires_req: VersionReq,
}

impl CompatibilityRule {
    pub fn applies_to(&self, component: &str, version: &Version) -> bool {
        self.component == component && self.version_req.matches(version)
    }
}

impl fmt::Display for CompatibilityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} requires {} {}",
            self.component, self.version_req, self.requires, self.requires_req
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakingChangeRecord {
    pub component: String,
    pub from_version: Version,
    pub to_version: Version,
    pub severity: Severity,
    pub description: String,
}

impl BreakingChangeRecord {
    /// A record matches a transition when the version that introduced the
    /// break lies in `(from, to]`.
    pub fn crossed_by(&self, component: &str, from: &Version, to: &Version) -> bool {
        self.component == component && &self.to_version > from && &self.to_version <= to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub component: String,
    pub version: String,
    pub created_at_unix: u64,
    pub binary_backup_path: PathBuf,
    pub config_backup_path: Option<PathBuf>,
    /// Serialized `ComponentRecord` as it was when the point was taken.
    pub state_snapshot: String,
    pub binary_sha256: String,
    pub config_sha256: Option<String>,
    pub expires_at_unix: u64,
    pub size_bytes: u64,
}

impl RollbackPoint {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix >= self.expires_at_unix
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCacheEntry {
    pub component: String,
    pub cache_key: String,
    pub value: String,
    pub cached_at_unix: u64,
    pub ttl_secs: u64,
}

impl VersionCacheEntry {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix >= self.cached_at_unix.saturating_add(self.ttl_secs)
    }
}
