//! Archive codec: gzip-compressed POSIX tar stream, entries treated as
//! forward-slash paths, deterministic write ordering.

use std::io::{Read, Write};

use anyhow::{bail, Context};
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};

use crate::error::{BundleError, Result};
use crate::limits::{DecodeLimits, EintrReader, LimitReader};

/// A single decoded archive entry: its path and raw bytes.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Read every entry out of a gzip+tar archive, enforcing the whole-archive
/// and per-file size limits. A read that would exceed the per-file limit
/// yields `SizeLimitExceeded(name, limit)`.
pub fn read_entries<R: Read>(reader: R, limits: &DecodeLimits) -> Result<Vec<Entry>> {
    let bounded = LimitReader::new(
        EintrReader::new(reader),
        limits.max_archive_bytes,
        "archive",
    );
    let gz = flate2::read::GzDecoder::new(bounded);
    let bounded_decode = LimitReader::new(gz, limits.max_decode_bytes, "decoded archive");
    let mut tar = tar::Archive::new(bounded_decode);

    let mut entries = Vec::new();
    let raw_entries = tar
        .entries()
        .context("failed to read tar entries")
        .map_err(|e| BundleError::format("archive", e.to_string()))?;

    for entry in raw_entries {
        let mut entry = entry.map_err(|e| BundleError::format("archive", e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| BundleError::format("archive", e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");

        if path.len() > limits.max_path_len {
            tracing::warn!(path = %path, limit = limits.max_path_len, "archive entry path too long");
            bail!(BundleError::SizeLimitExceeded {
                name: path,
                limit: limits.max_path_len as u64,
            });
        }

        let size = entry.header().size().unwrap_or(0);
        if size > limits.max_entry_bytes {
            tracing::warn!(path = %path, size, limit = limits.max_entry_bytes, "archive entry too large");
            bail!(BundleError::SizeLimitExceeded {
                name: path,
                limit: limits.max_entry_bytes,
            });
        }

        let mut bytes = Vec::with_capacity(size as usize);
        let mut limited = LimitReader::new(&mut entry, limits.max_entry_bytes + 1, "entry");
        limited
            .read_to_end(&mut bytes)
            .map_err(|_| BundleError::SizeLimitExceeded {
                name: path.clone(),
                limit: limits.max_entry_bytes,
            })?;

        entries.push(Entry { path, bytes });

        if entries.len() > limits.max_entries {
            bail!(BundleError::format(
                "archive",
                format!("more than {} entries", limits.max_entries)
            ));
        }
    }

    tracing::debug!(entries = entries.len(), "archive decoded");
    Ok(entries)
}

/// Write entries to a gzip+tar archive. Callers are responsible for passing
/// entries in the deterministic order the writer requires (data, modules,
/// wasm, plan, patch, manifest, signatures — see [`crate::writer`]);
/// `write_entries` itself only controls the deterministic *encoding*
/// (fixed mtime/uid/gid/mode), not ordering policy.
pub fn write_entries<W: Write>(writer: W, entries: &[Entry]) -> Result<()> {
    let gz = GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(writer, Compression::best());
    write_entries_to_gz(gz, entries)
}

fn write_entries_to_gz<W: Write>(gz: GzEncoder<W>, entries: &[Entry]) -> Result<()> {
    let mut tar = tar::Builder::new(gz);
    tar.mode(tar::HeaderMode::Deterministic);

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(&entry.path).map_err(|e| {
            BundleError::format("archive", format!("invalid entry path '{}': {e}", entry.path))
        })?;
        header.set_size(entry.bytes.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_username("policy-bundle").ok();
        header.set_groupname("policy-bundle").ok();
        header.set_cksum();
        tar.append(&header, entry.bytes.as_slice())
            .context("failed to append tar entry")?;
    }

    tar.into_inner()
        .context("failed to finish tar stream")?
        .finish()
        .context("failed to finish gzip stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let entries = vec![
            Entry {
                path: "data.json".to_string(),
                bytes: br#"{"a":1}"#.to_vec(),
            },
            Entry {
                path: "policy.rego".to_string(),
                bytes: b"package p".to_vec(),
            },
        ];

        let mut buf = Vec::new();
        write_entries(&mut buf, &entries).unwrap();

        let decoded = read_entries(&buf[..], &DecodeLimits::default()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].path, "data.json");
        assert_eq!(decoded[1].path, "policy.rego");
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let entries = vec![Entry {
            path: "big.json".to_string(),
            bytes: vec![b'a'; 1024],
        }];
        let mut buf = Vec::new();
        write_entries(&mut buf, &entries).unwrap();

        let mut limits = DecodeLimits::default();
        limits.max_entry_bytes = 10;
        let err = read_entries(&buf[..], &limits).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BundleError>(),
            Some(BundleError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn entry_exactly_at_limit_is_accepted_one_byte_over_is_rejected() {
        let mut limits = DecodeLimits::default();
        limits.max_entry_bytes = 10;

        let mut at_limit = Vec::new();
        write_entries(
            &mut at_limit,
            &[Entry {
                path: "data.json".to_string(),
                bytes: vec![b'a'; 10],
            }],
        )
        .unwrap();
        assert!(read_entries(&at_limit[..], &limits).is_ok());

        let mut over_limit = Vec::new();
        write_entries(
            &mut over_limit,
            &[Entry {
                path: "data.json".to_string(),
                bytes: vec![b'a'; 11],
            }],
        )
        .unwrap();
        assert!(read_entries(&over_limit[..], &limits).is_err());
    }

    #[test]
    fn archive_is_deterministic_given_same_input() {
        let entries = vec![Entry {
            path: "data.json".to_string(),
            bytes: br#"{"a":1}"#.to_vec(),
        }];
        let mut a = Vec::new();
        let mut b = Vec::new();
        write_entries(&mut a, &entries).unwrap();
        write_entries(&mut b, &entries).unwrap();
        assert_eq!(a, b);
    }
}
