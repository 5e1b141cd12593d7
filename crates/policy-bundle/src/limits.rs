//! Resource limits and bounded readers for archive decode.
//!
//! EINTR retry and byte limits guard against malformed or hostile archives
//! during decode, before any manifest or data-tree validation runs.

use serde::Deserialize;
use std::io::Read;

/// Resource limits applied while decoding a bundle archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Hard cap on the compressed (gzip) archive size.
    pub max_archive_bytes: u64,
    /// Hard cap on the total decompressed tar stream size.
    pub max_decode_bytes: u64,
    /// Hard cap on any single entry's decompressed size.
    pub max_entry_bytes: u64,
    /// Hard cap on the number of entries in the archive.
    pub max_entries: usize,
    /// Hard cap on a tar entry path length.
    pub max_path_len: usize,
    /// Hard cap on data-tree / manifest JSON nesting depth.
    pub max_json_depth: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 4 * 1024 * 1024 * 1024, // 4 GiB compressed
            max_decode_bytes: 4 * 1024 * 1024 * 1024,  // 4 GiB uncompressed
            max_entry_bytes: 1024 * 1024 * 1024,       // 1 GiB per file, per the reader's documented default
            max_entries: 100_000,
            max_path_len: 1024,
            max_json_depth: 64,
        }
    }
}

/// Partial overrides for [`DecodeLimits`]. Used where a caller supplies a
/// config document that only overrides some fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecodeLimitsOverrides {
    pub max_archive_bytes: Option<u64>,
    pub max_decode_bytes: Option<u64>,
    pub max_entry_bytes: Option<u64>,
    pub max_entries: Option<usize>,
    pub max_path_len: Option<usize>,
    pub max_json_depth: Option<usize>,
}

impl DecodeLimits {
    /// Apply overrides onto these defaults. Only `Some` values override.
    pub fn apply(self, overrides: DecodeLimitsOverrides) -> Self {
        Self {
            max_archive_bytes: overrides.max_archive_bytes.unwrap_or(self.max_archive_bytes),
            max_decode_bytes: overrides.max_decode_bytes.unwrap_or(self.max_decode_bytes),
            max_entry_bytes: overrides.max_entry_bytes.unwrap_or(self.max_entry_bytes),
            max_entries: overrides.max_entries.unwrap_or(self.max_entries),
            max_path_len: overrides.max_path_len.unwrap_or(self.max_path_len),
            max_json_depth: overrides.max_json_depth.unwrap_or(self.max_json_depth),
        }
    }
}

/// A reader that limits the total number of bytes read and fails explicitly on overflow.
pub(crate) struct LimitReader<R> {
    inner: R,
    limit: u64,
    read: u64,
    error_tag: &'static str,
}

impl<R: Read> LimitReader<R> {
    pub(crate) fn new(inner: R, limit: u64, error_tag: &'static str) -> Self {
        Self {
            inner,
            limit,
            read: 0,
            error_tag,
        }
    }
}

impl<R: Read> Read for LimitReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.read >= self.limit {
            return Err(std::io::Error::other(format!(
                "{}: exceeded limit of {} bytes",
                self.error_tag, self.limit
            )));
        }

        let max_to_read = (self.limit - self.read).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max_to_read])?;
        self.read += n as u64;

        Ok(n)
    }
}

const MAX_EINTR_RETRIES: usize = 16;

/// A reader that transparently retries on EINTR.
pub(crate) struct EintrReader<R> {
    inner: R,
}

impl<R: Read> EintrReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> Read for EintrReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut retries = 0;
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    retries += 1;
                    if retries >= MAX_EINTR_RETRIES {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            format!(
                                "persistent EINTR: interrupted {} consecutive times",
                                MAX_EINTR_RETRIES
                            ),
                        ));
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_reader_rejects_overflow() {
        let data = vec![0u8; 100];
        let mut reader = LimitReader::new(&data[..], 10, "test");
        let mut buf = vec![0u8; 100];
        let mut total = 0;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    assert!(e.to_string().contains("test"));
                    return;
                }
            }
        }
        panic!("expected limit error, read {total} bytes without one");
    }

    #[test]
    fn overrides_apply_only_some_fields() {
        let base = DecodeLimits::default();
        let overridden = base.apply(DecodeLimitsOverrides {
            max_entries: Some(10),
            ..Default::default()
        });
        assert_eq!(overridden.max_entries, 10);
        assert_eq!(overridden.max_archive_bytes, base.max_archive_bytes);
    }
}
