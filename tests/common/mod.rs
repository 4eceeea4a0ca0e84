//! Shared helpers for integration tests.

pub mod server;

use std::sync::Arc;

use egafetch::api::ApiClient;
use egafetch::auth::StaticTokenProvider;
use egafetch::state::{FileSpec, StateStore};
use md5::{Digest, Md5};
use tempfile::TempDir;

pub const TEST_FILE_ID: &str = "EGAF90000000001";

/// Deterministic test payload: byte i is `i % 251` (a prime, so chunk
/// boundaries never line up with the pattern period).
pub fn test_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// An API client whose data and metadata endpoints both point at `base`.
pub fn test_api(base: &str) -> Arc<ApiClient> {
    Arc::new(
        ApiClient::with_base_urls(
            Arc::new(StaticTokenProvider::new("test-token")),
            base,
            base,
        )
        .expect("build test client"),
    )
}

/// A state store in a fresh temp dir. Keep the `TempDir` alive for the
/// duration of the test.
pub fn test_store() -> (TempDir, Arc<StateStore>) {
    let dir = TempDir::new().expect("create temp dir");
    let store = Arc::new(StateStore::new(dir.path()));
    (dir, store)
}

/// A file spec for the standard test file.
pub fn test_spec(size: u64, checksum: &str, checksum_type: &str) -> FileSpec {
    FileSpec {
        file_id: TEST_FILE_ID.into(),
        file_name: "sample.bam".into(),
        size,
        checksum: checksum.into(),
        checksum_type: checksum_type.into(),
    }
}

/// MD5 of a byte slice, for building expected checksums in tests.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
