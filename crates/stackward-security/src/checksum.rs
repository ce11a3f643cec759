use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    let actual = sha256_file_hex(path)?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Extracts the digest for `file_name` from a published checksum document.
///
/// Accepts either a bare digest or a `sha256sum`-style listing
/// (`<hex>  <name>`, binary-mode `<hex> *<name>` also accepted).
pub fn parse_checksum_listing(listing: &str, file_name: &str) -> Result<String> {
    let lines = listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>();

    if let [only] = lines.as_slice() {
        if is_sha256_hex(only) {
            return Ok(only.to_ascii_lowercase());
        }
    }

    for line in lines {
        let mut parts = line.split_whitespace();
        let (Some(digest), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let name = name.trim_start_matches('*');
        let base = name.rsplit('/').next().unwrap_or(name);
        if base == file_name || name == file_name {
            if !is_sha256_hex(digest) {
                return Err(anyhow!(
                    "checksum entry for '{file_name}' is not a sha256 digest"
                ));
            }
            return Ok(digest.to_ascii_lowercase());
        }
    }

    Err(anyhow!("no checksum entry found for '{file_name}'"))
}
