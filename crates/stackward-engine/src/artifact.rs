use anyhow::Result;
use stackward_core::{expand_url_template, ComponentConfig, InstallMethod, UpgradeError};
use stackward_installer::DownloadSpec;
use stackward_registry::{RegistryError, Release, ReleaseAsset, ReleaseRegistry};
use tracing::debug;

const CHECKSUM_NAMES: &[&str] = &["SHA256SUMS", "sha256sums.txt", "checksums.txt"];
const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz"];

/// Works out where `version` of `config` is downloaded from. Configured URL
/// templates win; otherwise the release assets published upstream are
/// searched for one built for this host. A configured checksum or signature
/// URL is kept over anything discovered.
pub fn download_spec(
    config: &ComponentConfig,
    version: &str,
    registry: &dyn ReleaseRegistry,
) -> Result<DownloadSpec> {
    if let Some(spec) = DownloadSpec::from_config(config, version) {
        return Ok(spec);
    }

    let unavailable = |detail: String| -> anyhow::Error {
        UpgradeError::DownloadFailed {
            component: config.name.clone(),
            url: format!("release {version}"),
            detail,
        }
        .into()
    };

    let repo = config.repo.as_deref().ok_or_else(|| {
        unavailable("component has neither asset_url nor repo configured".to_string())
    })?;
    let release = release_for_version(registry, repo, version).map_err(|err| {
        unavailable(format!("release lookup in {repo} failed: {err}"))
    })?;

    let asset = select_host_asset(
        &release.assets,
        config.install_method,
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
    .ok_or_else(|| {
        unavailable(format!(
            "release {} has no asset for {}-{}",
            release.tag_name,
            std::env::consts::OS,
            std::env::consts::ARCH
        ))
    })?;
    let checksum = release.assets.iter().find(|candidate| {
        CHECKSUM_NAMES.contains(&candidate.name.as_str())
            || candidate.name == format!("{}.sha256", asset.name)
    });
    let signature = checksum
        .filter(|_| config.public_key.is_some())
        .and_then(|checksum| release.asset(&format!("{}.sig", checksum.name)));

    let expand = |template: &String| expand_url_template(template, &config.name, version);
    let checksum_url = config
        .checksum_url
        .as_ref()
        .map(expand)
        .or_else(|| checksum.map(|asset| asset.browser_download_url.clone()));
    let signature_url = config
        .signature_url
        .as_ref()
        .map(expand)
        .or_else(|| signature.map(|asset| asset.browser_download_url.clone()));

    debug!(
        component = %config.name,
        release = %release.tag_name,
        asset = %asset.name,
        checksum = checksum_url.as_deref().unwrap_or("-"),
        "artifact discovered from release assets"
    );
    Ok(DownloadSpec {
        asset_url: asset.browser_download_url.clone(),
        checksum_url,
        signature_url,
        public_key: config.public_key.clone(),
        handler: config.handler.clone(),
        health_url: config.health_url.clone(),
    })
}

/// Tags are tried as `v<version>` first, then bare.
fn release_for_version(
    registry: &dyn ReleaseRegistry,
    repo: &str,
    version: &str,
) -> Result<Release, RegistryError> {
    match registry.release_by_tag(repo, &format!("v{version}")) {
        Err(RegistryError::NotFound(_)) => registry.release_by_tag(repo, version),
        other => other,
    }
}

/// Picks the asset built for `os`/`arch`. Archive installs prefer tarballs,
/// the other methods prefer plain files.
pub(crate) fn select_host_asset<'a>(
    assets: &'a [ReleaseAsset],
    method: InstallMethod,
    os: &str,
    arch: &str,
) -> Option<&'a ReleaseAsset> {
    let arch_aliases = arch_aliases(arch);
    let mut candidates = assets
        .iter()
        .filter(|asset| !is_metadata_asset(&asset.name))
        .filter(|asset| {
            let name = asset.name.to_ascii_lowercase();
            name.contains(os) && arch_aliases.iter().any(|alias| name.contains(alias))
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|asset| {
        let archive = is_archive(&asset.name);
        let preferred = match method {
            InstallMethod::Archive => archive,
            InstallMethod::Binary | InstallMethod::Handler => !archive,
        };
        (!preferred, asset.name.clone())
    });
    candidates.into_iter().next()
}

fn arch_aliases(arch: &str) -> Vec<&str> {
    match arch {
        "x86_64" => vec!["x86_64", "amd64"],
        "aarch64" => vec!["aarch64", "arm64"],
        other => vec![other],
    }
}

fn is_archive(name: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_metadata_asset(name: &str) -> bool {
    CHECKSUM_NAMES.contains(&name)
        || [".sha256", ".sig", ".asc", ".sbom", ".json"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

