use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Returns whether `signature_hex` is a valid Ed25519 signature of `payload`.
/// Malformed key or signature encodings are errors, a wrong signature is `false`.
pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let key_bytes = decode_fixed::<32>(public_key_hex.trim(), "public key")?;
    let signature_bytes = decode_fixed::<64>(signature_hex.trim(), "signature")?;

    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).context("invalid Ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature_bytes);

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Verifies a detached signature over a checksum listing and fails closed:
/// any decoding problem or mismatch is an error.
pub fn verify_detached_signature(
    payload: &[u8],
    public_key_hex: &str,
    signature_document: &str,
) -> Result<()> {
    let signature_hex = signature_document
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("signature document is empty"))?;
    if verify_ed25519_signature_hex(payload, public_key_hex, signature_hex)? {
        Ok(())
    } else {
        Err(anyhow!("Ed25519 signature does not match checksum listing"))
    }
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value).with_context(|| format!("failed to decode Ed25519 {what} hex"))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 {what} length: expected {N} bytes, got {len}")
    })
}
