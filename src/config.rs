//! Download session configuration.
//!
//! [`DownloadOptions`] is the configuration surface the CLI maps its flags
//! onto. It is passed by value into the orchestrator and shared with every
//! file and chunk worker of the session.

use crate::error::{Error, Result};

/// Default number of files downloaded in parallel.
pub const DEFAULT_PARALLEL_FILES: usize = 4;

/// Default number of chunks downloaded in parallel per file.
pub const DEFAULT_PARALLEL_CHUNKS: usize = 8;

/// Default chunk size (64 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration for a download session.
#[derive(Clone, Debug)]
pub struct DownloadOptions {
    /// Number of files to download in parallel.
    pub parallel_files: usize,
    /// Number of chunks to download in parallel within one file.
    pub parallel_chunks: usize,
    /// Initial chunk size in bytes.
    pub chunk_size: u64,
    /// Bandwidth cap in bytes per second. `None` disables throttling.
    pub max_bandwidth: Option<u64>,
    /// Adjust the chunk size on the fly based on observed throughput.
    pub adaptive_chunks: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            parallel_files: DEFAULT_PARALLEL_FILES,
            parallel_chunks: DEFAULT_PARALLEL_CHUNKS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_bandwidth: None,
            adaptive_chunks: false,
        }
    }
}

/// Parse a human-readable size string (e.g. "64M", "1G") into bytes.
///
/// Accepts `K`, `M` and `G` suffixes, case-insensitive. Rejects empty and
/// non-positive values.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidInput("empty size string".into()));
    }

    let (digits, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid size {s:?}")))?;
    if value == 0 {
        return Err(Error::InvalidInput("size must be positive".into()));
    }

    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = DownloadOptions::default();
        assert_eq!(opts.parallel_files, 4);
        assert_eq!(opts.parallel_chunks, 8);
        assert_eq!(opts.chunk_size, 64 * 1024 * 1024);
        assert!(opts.max_bandwidth.is_none());
        assert!(!opts.adaptive_chunks);
    }

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("64M").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("8m").unwrap(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("-1M").is_err());
        assert!(parse_size("0").is_err());
        assert!(parse_size("12X").is_err());
    }
}
