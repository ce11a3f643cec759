mod checksum;
mod signature;

pub use checksum::{
    is_sha256_hex, parse_checksum_listing, sha256_file_hex, sha256_hex, verify_sha256_file,
};
pub use signature::{verify_detached_signature, verify_ed25519_signature_hex};
