use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use stackward_core::RegistryConfig;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::release::Release;

/// Upstream source of release metadata.
pub trait ReleaseRegistry: Send + Sync {
    /// Newest published release that is neither a draft nor a prerelease.
    fn latest_release(&self, repo: &str) -> Result<Release, RegistryError>;

    fn list_releases(&self, repo: &str) -> Result<Vec<Release>, RegistryError>;

    fn release_by_tag(&self, repo: &str, tag: &str) -> Result<Release, RegistryError>;

    /// Remaining API calls as last reported by the upstream, if known.
    fn remaining_quota(&self) -> Option<u32>;
}

/// GitHub-compatible releases API over blocking HTTP.
pub struct HttpRegistry {
    client: Client,
    base_url: String,
    token: Option<String>,
    max_attempts: u32,
    backoff: Duration,
    offline: bool,
    quota: Mutex<Option<u32>>,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig, offline: bool, backoff: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build registry http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff,
            offline,
            quota: Mutex::new(None),
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RegistryError> {
        if self.offline {
            return Err(RegistryError::Offline);
        }

        let url = format!("{}{path}", self.base_url);
        let mut last_error = RegistryError::Transport(format!("no attempt made for {url}"));
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.backoff.saturating_mul(1 << (attempt - 1).min(6));
                debug!(%url, attempt, delay_ms = delay.as_millis() as u64, "retrying registry request");
                thread::sleep(delay);
            }

            let mut request = self
                .client
                .get(&url)
                .header(ACCEPT, "application/vnd.github+json")
                .header(USER_AGENT, concat!("stackward/", env!("CARGO_PKG_VERSION")));
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }

            let response = match request.send() {
                Ok(response) => response,
                Err(err) => {
                    warn!(%url, attempt, error = %err, "registry request failed");
                    last_error = RegistryError::Transport(err.to_string());
                    continue;
                }
            };

            match self.classify_response(&url, response) {
                Ok(body) => {
                    return serde_json::from_slice(&body)
                        .map_err(|err| RegistryError::Decode(format!("{url}: {err}")));
                }
                Err(Retry::Yes(err)) => last_error = err,
                Err(Retry::No(err)) => return Err(err),
            }
        }
        Err(last_error)
    }

    fn classify_response(&self, url: &str, response: Response) -> Result<Vec<u8>, Retry> {
        let status = response.status();
        let remaining = header_u64(response.headers(), "x-ratelimit-remaining");
        let reset_at_unix = header_u64(response.headers(), "x-ratelimit-reset");
        if let Some(remaining) = remaining {
            self.record_quota(u32::try_from(remaining).unwrap_or(u32::MAX));
        }

        let exhausted = remaining == Some(0);
        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && exhausted)
        {
            warn!(%url, ?reset_at_unix, "registry rate limit reached");
            return Err(Retry::No(RegistryError::RateLimited { reset_at_unix }));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Retry::No(RegistryError::NotFound(url.to_string())));
        }
        if status.is_server_error() {
            return Err(Retry::Yes(RegistryError::Transport(format!(
                "{url} returned {status}"
            ))));
        }
        if !status.is_success() {
            return Err(Retry::No(RegistryError::Transport(format!(
                "{url} returned {status}"
            ))));
        }

        response
            .bytes()
            .map(|body| body.to_vec())
            .map_err(|err| Retry::Yes(RegistryError::Transport(err.to_string())))
    }

    fn record_quota(&self, remaining: u32) {
        if let Ok(mut quota) = self.quota.lock() {
            *quota = Some(remaining);
        }
    }
}

enum Retry {
    Yes(RegistryError),
    No(RegistryError),
}

impl ReleaseRegistry for HttpRegistry {
    fn latest_release(&self, repo: &str) -> Result<Release, RegistryError> {
        self.get_json(&format!("/repos/{repo}/releases/latest"))
    }

    fn list_releases(&self, repo: &str) -> Result<Vec<Release>, RegistryError> {
        self.get_json(&format!("/repos/{repo}/releases?per_page=100"))
    }

    fn release_by_tag(&self, repo: &str, tag: &str) -> Result<Release, RegistryError> {
        self.get_json(&format!("/repos/{repo}/releases/tags/{tag}"))
    }

    fn remaining_quota(&self) -> Option<u32> {
        self.quota.lock().ok().and_then(|quota| *quota)
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
