use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Quota exhausted. Non-fatal: callers fall back to cached data.
    #[error("registry rate limit exhausted{}", reset_suffix(.reset_at_unix))]
    RateLimited { reset_at_unix: Option<u64> },

    #[error("release not found: {0}")]
    NotFound(String),

    #[error("registry request failed: {0}")]
    Transport(String),

    #[error("registry response could not be decoded: {0}")]
    Decode(String),

    #[error("registry access is disabled in offline mode")]
    Offline,
}

impl RegistryError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

fn reset_suffix(reset_at_unix: &Option<u64>) -> String {
    reset_at_unix
        .map(|reset| format!(" (resets at {reset})"))
        .unwrap_or_default()
}
