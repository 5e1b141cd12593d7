//! File digest computation for the signature envelope.
//!
//! Structured files (`.json`, `.yaml`, `.yml`) are parsed to a generic
//! value, canonicalized via [`crate::crypto::jcs`], and hashed; unstructured
//! files are hashed as raw bytes. Digest algorithms are spelled exactly as
//! the JWT file-info list expects: `"MD5"`, `"SHA-1"`, `"SHA-256"`,
//! `"SHA-512"` — the compatibility matrix of the `jsonwebtoken`-signed
//! bundles this crate produces and reads.

use anyhow::{bail, Context};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::Result;

pub const SHA256: &str = "SHA-256";
pub const SHA1: &str = "SHA-1";
pub const SHA512: &str = "SHA-512";
pub const MD5: &str = "MD5";

/// The default digest algorithm selected by the writer.
pub const DEFAULT_ALGORITHM: &str = SHA256;

/// Hash `bytes` under the named algorithm, returning lowercase hex.
pub fn digest_bytes(algorithm: &str, bytes: &[u8]) -> Result<String> {
    let hex = match algorithm {
        SHA256 => hex::encode(Sha256::digest(bytes)),
        SHA1 => hex::encode(Sha1::digest(bytes)),
        SHA512 => hex::encode(Sha512::digest(bytes)),
        MD5 => hex::encode(md5::compute(bytes).0),
        other => bail!("unsupported digest algorithm '{other}'"),
    };
    Ok(hex)
}

/// Whether `path`'s extension makes it a "structured" file subject to JCS
/// canonicalization before hashing.
pub fn is_structured(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".json") || lower.ends_with(".yaml") || lower.ends_with(".yml")
}

/// Compute a file's digest under `algorithm`, applying the
/// structured-vs-unstructured rule: structured files are first parsed
/// (JSON or YAML, both decode into the same `serde_json::Value` space —
/// see [`crate::data`]) and canonicalized; everything else is hashed as raw
/// bytes.
pub fn digest_file(path: &str, bytes: &[u8], algorithm: &str) -> Result<String> {
    if is_structured(path) {
        let value: serde_json::Value = if path.to_ascii_lowercase().ends_with(".json") {
            serde_json::from_slice(bytes).with_context(|| format!("parsing '{path}' as JSON"))?
        } else {
            serde_yaml::from_slice(bytes).with_context(|| format!("parsing '{path}' as YAML"))?
        };
        let canonical = crate::crypto::jcs::to_vec(&value)?;
        digest_bytes(algorithm, &canonical)
    } else {
        digest_bytes(algorithm, bytes)
    }
}
