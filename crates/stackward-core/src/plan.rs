use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Raises the level to at least `floor`. Never lowers it.
    pub fn escalate(self, floor: RiskLevel) -> RiskLevel {
        self.max(floor)
    }

    pub fn bump(self) -> RiskLevel {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub component: String,
    /// `None` when the component is not installed yet.
    pub from_version: Option<String>,
    pub to_version: String,
    pub risk: RiskLevel,
}

impl PlanEntry {
    pub fn is_fresh_install(&self) -> bool {
        self.from_version.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub plan_id: u64,
    pub created_at_unix: u64,
    pub entries: Vec<PlanEntry>,
}

impl UpgradePlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, component: &str) -> Option<&PlanEntry> {
        self.entries
            .iter()
            .find(|entry| entry.component == component)
    }
}
