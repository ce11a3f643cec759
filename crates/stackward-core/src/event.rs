use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UpgradeStarted,
    UpgradeCompleted,
    UpgradeFailed,
    RollbackExecuted,
    ManualInterventionRequired,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpgradeStarted => "upgrade_started",
            Self::UpgradeCompleted => "upgrade_completed",
            Self::UpgradeFailed => "upgrade_failed",
            Self::RollbackExecuted => "rollback_executed",
            Self::ManualInterventionRequired => "manual_intervention_required",
        }
    }
}

/// Structured notification for external delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub run_id: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at_unix: u64,
}

impl Event {
    pub fn new(kind: EventKind, run_id: &str, component: &str, at_unix: u64) -> Self {
        Self {
            kind,
            run_id: run_id.to_string(),
            component: component.to_string(),
            from_version: None,
            to_version: None,
            detail: None,
            at_unix,
        }
    }

    pub fn versions(mut self, from: Option<&str>, to: &str) -> Self {
        self.from_version = from.map(ToString::to_string);
        self.to_version = Some(to.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event) -> Result<()>;
}

/// Appends one JSON document per line.
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<Vec<Event>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("invalid event line in {}", self.path.display()))
            })
            .collect()
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: &Event) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("failed to encode event")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}
