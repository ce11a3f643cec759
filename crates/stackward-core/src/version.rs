use anyhow::{anyhow, Context, Result};
use semver::Version;

/// Parses an upstream version tag into a semver version.
///
/// Release tags are frequently written as `v1.7.0` or truncated to `1.7`;
/// both are accepted, the latter padded with zero components.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        return Err(anyhow!("version string must not be empty"));
    }

    if let Ok(version) = Version::parse(stripped) {
        return Ok(version);
    }

    let split_at = stripped
        .find(|ch: char| ch == '-' || ch == '+')
        .unwrap_or(stripped.len());
    let (core, suffix) = stripped.split_at(split_at);
    let parts = core.split('.').collect::<Vec<_>>();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(anyhow!("invalid version string: {raw}"));
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);

    Version::parse(&padded).with_context(|| format!("invalid version string: {raw}"))
}

pub fn is_downgrade(from: &Version, to: &Version) -> bool {
    to < from
}
