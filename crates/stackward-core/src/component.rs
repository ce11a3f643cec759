use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ComponentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    /// The downloaded artifact is the executable itself.
    #[default]
    Binary,
    /// The artifact is a `.tar.gz` containing the executable (and optionally
    /// the config file) somewhere in its tree.
    Archive,
    /// Layout is delegated entirely to the component's external handler.
    Handler,
}

impl InstallMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Archive => "archive",
            Self::Handler => "handler",
        }
    }
}

/// Blocks further mutation of a component until an operator resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHold {
    pub reason: String,
    pub run_id: Option<String>,
    pub since_unix: u64,
}

/// What the host actually has installed for one managed component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub name: String,
    pub installed_version: String,
    #[serde(default)]
    pub install_method: InstallMethod,
    pub binary_path: PathBuf,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    pub service_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub hold: Option<ComponentHold>,
}

impl ComponentRecord {
    pub fn from_config(config: &ComponentConfig, installed_version: &str) -> Self {
        let mut metadata = BTreeMap::new();
        if let Some(repo) = &config.repo {
            metadata.insert("repo".to_string(), repo.clone());
        }
        metadata.insert("strategy".to_string(), config.strategy.as_str().to_string());

        Self {
            name: config.name.clone(),
            installed_version: installed_version.to_string(),
            install_method: config.install_method,
            binary_path: config.binary_path.clone(),
            config_path: config.config_path.clone(),
            service_name: config.service_name().to_string(),
            metadata,
            hold: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.hold.is_some()
    }
}
