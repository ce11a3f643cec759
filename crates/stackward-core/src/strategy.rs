use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Policy governing how a component's target version is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Latest,
    Pinned,
    Lts,
    Range,
    Locked,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Pinned => "pinned",
            Self::Lts => "lts",
            Self::Range => "range",
            Self::Locked => "locked",
        }
    }

    /// Whether resolving with this strategy may reach the upstream registry.
    pub fn queries_upstream(&self) -> bool {
        matches!(self, Self::Latest | Self::Lts | Self::Range)
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "pinned" => Ok(Self::Pinned),
            "lts" => Ok(Self::Lts),
            "range" => Ok(Self::Range),
            "locked" => Ok(Self::Locked),
            other => Err(anyhow!(
                "invalid strategy '{other}': expected latest, pinned, lts, range, or locked"
            )),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
