//! Checksum computation and verification.
//!
//! Downloads are verified by streaming the merged output file through the
//! hash named in the file's metadata (MD5 or SHA-256) and comparing the
//! hex digests case-insensitively. The same machinery produces the `.md5`
//! sidecar written next to every completed file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Buffer size for streaming files through a hash (64 KiB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex-encoded checksum of a file.
///
/// `checksum_type` is matched case-insensitively against `MD5` and
/// `SHA256`; anything else is rejected.
pub fn compute_checksum(path: &Path, checksum_type: &str) -> Result<String> {
    let file = File::open(path)?;
    match checksum_type.to_ascii_uppercase().as_str() {
        "MD5" => hash_reader::<Md5>(file),
        "SHA256" => hash_reader::<Sha256>(file),
        other => Err(Error::InvalidInput(format!(
            "unsupported checksum type: {other}"
        ))),
    }
}

/// Verify a file against an expected checksum.
///
/// Returns `Ok(())` on match, [`Error::ChecksumMismatch`] otherwise.
/// The comparison ignores hex case.
pub fn verify_file(path: &Path, expected: &str, checksum_type: &str) -> Result<()> {
    let actual = compute_checksum(path, checksum_type)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Render a checksum line in md5sum's two-space format.
pub fn sidecar_line(checksum: &str, file_name: &str) -> String {
    format!("{checksum}  {file_name}\n")
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
