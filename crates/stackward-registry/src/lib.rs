mod cache;
mod client;
mod error;
mod release;

pub use cache::{
    resolved_key, SweepReport, VersionCache, DERIVED_TTL_SECS, LATEST_RELEASE_KEY, LOCKED_KEY,
    RELEASES_KEY, RELEASE_TTL_SECS,
};
pub use client::{HttpRegistry, ReleaseRegistry};
pub use error::RegistryError;
pub use release::{Release, ReleaseAsset};
