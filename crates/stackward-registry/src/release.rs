use anyhow::Result;
use semver::Version;
use serde::{Deserialize, Serialize};
use stackward_core::parse_version;

/// One upstream release, in the GitHub releases API shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl Release {
    pub fn new(tag_name: &str) -> Self {
        Self {
            tag_name: tag_name.to_string(),
            name: None,
            body: None,
            prerelease: false,
            draft: false,
            published_at: None,
            assets: Vec::new(),
        }
    }

    pub fn version(&self) -> Result<Version> {
        parse_version(&self.tag_name)
    }

    /// Published, non-draft, and not marked or versioned as a prerelease.
    pub fn is_stable(&self) -> bool {
        !self.draft
            && !self.prerelease
            && self
                .version()
                .map(|version| version.pre.is_empty())
                .unwrap_or(false)
    }

    /// Upstreams flag long-term-support releases in the release title or
    /// notes.
    pub fn is_flagged_lts(&self) -> bool {
        [self.name.as_deref(), self.body.as_deref()]
            .into_iter()
            .flatten()
            .any(|text| {
                text.split(|ch: char| !ch.is_ascii_alphanumeric())
                    .any(|word| word == "LTS")
            })
    }

    pub fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}
