use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use tracing::debug;

/// Retrieves release artifacts and their published checksum documents.
pub trait ArtifactFetcher: Send + Sync {
    /// Downloads `url` to `dest`. `dest` only exists afterwards if the
    /// download completed.
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<()>;

    fn fetch_text(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stackward/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build download http client")?;
        Ok(Self { client })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch_to(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create download dir: {}", parent.display()))?;
        }
        let part_path = dest.with_file_name(format!(
            "{}.part",
            dest.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("artifact")
        ));

        let result = (|| -> Result<u64> {
            let mut response = self
                .client
                .get(url)
                .send()
                .with_context(|| format!("request to {url} failed"))?;
            if !response.status().is_success() {
                return Err(anyhow!("{url} returned HTTP {}", response.status()));
            }
            let mut file = File::create(&part_path)
                .with_context(|| format!("failed to create {}", part_path.display()))?;
            io::copy(&mut response, &mut file)
                .with_context(|| format!("failed to write {}", part_path.display()))
        })();

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&part_path);
                return Err(err);
            }
        };
        fs::rename(&part_path, dest).with_context(|| {
            format!("failed to move download into place: {}", dest.display())
        })?;
        debug!(url, bytes, dest = %dest.display(), "artifact downloaded");
        Ok(())
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            return Err(anyhow!("{url} returned HTTP {}", response.status()));
        }
        response
            .text()
            .with_context(|| format!("failed to read body of {url}"))
    }
}
