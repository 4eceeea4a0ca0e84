//! Per-file download state and its chunk plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::FileSpec;

/// Download state of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Registered, nothing done yet.
    Pending,
    /// Building the chunk plan.
    Chunking,
    /// Chunks are being transferred.
    Downloading,
    /// Part-files are being concatenated into the output.
    Merging,
    /// The merged output is being checksummed.
    Verifying,
    /// Output written, verified, chunks cleaned up.
    Complete,
    /// A terminal error occurred; may be retried.
    Failed,
}

/// Download state of a single chunk within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// Not started.
    Pending,
    /// Being transferred.
    Downloading,
    /// Fully on disk.
    Complete,
    /// Last attempt failed.
    Failed,
}

/// State of one chunk: a half-open byte range `[start, end)` of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkState {
    /// Dense, 0-based index. Also names the part-file on disk.
    pub index: usize,
    /// First byte of the range (inclusive).
    pub start: u64,
    /// One past the last byte of the range (exclusive).
    pub end: u64,
    /// Current status.
    pub status: ChunkStatus,
    /// Bytes of this chunk already on disk.
    pub bytes_downloaded: u64,
    /// Failed attempts recorded over the lifetime of the chunk.
    pub retry_count: u32,
}

impl ChunkState {
    fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            status: ChunkStatus::Pending,
            bytes_downloaded: 0,
            retry_count: 0,
        }
    }

    /// Length of the byte range covered by this chunk.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the chunk covers an empty range (zero-size file).
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Persisted snapshot of one file's progress through the state machine.
///
/// Exclusively mutated by the file's own downloader task; everyone else
/// reads whatever atomic snapshot is currently on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub file_id: String,
    pub file_name: String,
    pub status: FileStatus,
    pub size: u64,
    pub checksum_expected: String,
    pub checksum_type: String,
    pub chunk_size: u64,
    #[serde(default)]
    pub chunks: Vec<ChunkState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileState {
    /// Create a fresh pending state from a file spec.
    pub fn new(spec: &FileSpec, chunk_size: u64) -> Self {
        Self {
            file_id: spec.file_id.clone(),
            file_name: spec.file_name.clone(),
            status: FileStatus::Pending,
            size: spec.size,
            checksum_expected: spec.checksum.clone(),
            checksum_type: spec.checksum_type.clone(),
            chunk_size,
            chunks: Vec::new(),
            download_url: None,
            url_expires_at: None,
            error: None,
            retry_count: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    /// Divide `[0, size)` into chunks of `chunk_size` (the last chunk may
    /// be shorter). Idempotent: an existing chunk plan is kept as is.
    /// Zero-size files get a single degenerate `[0, 0)` chunk.
    pub fn init_chunks(&mut self) {
        if !self.chunks.is_empty() {
            return;
        }

        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let mut index = 0usize;
        while offset < self.size {
            let end = (offset + self.chunk_size).min(self.size);
            chunks.push(ChunkState::new(index, offset, end));
            offset = end;
            index += 1;
        }

        if chunks.is_empty() {
            chunks.push(ChunkState::new(0, 0, 0));
        }

        self.chunks = chunks;
    }

    /// Whether the file download is fully complete.
    pub fn is_complete(&self) -> bool {
        self.status == FileStatus::Complete
    }

    /// Indices of chunks not yet complete, in chunk order.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Complete)
            .map(|c| c.index)
            .collect()
    }

    /// Whether every chunk is complete.
    pub fn all_chunks_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Complete)
    }

    /// Total bytes downloaded across all chunks.
    pub fn bytes_downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.bytes_downloaded).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: u64) -> FileSpec {
        FileSpec {
            file_id: "EGAF00001".into(),
            file_name: "sample.bam".into(),
            size,
            checksum: String::new(),
            checksum_type: String::new(),
        }
    }

    fn assert_partition(state: &FileState) {
        let chunks = &state.chunks;
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start, 0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap in plan");
            assert_eq!(pair[0].index + 1, pair[1].index, "indices not dense");
        }
        assert_eq!(chunks.last().unwrap().end, state.size);
    }

    #[test]
    fn test_init_chunks_even_split() {
        let mut state = FileState::new(&spec(160 * 1024 * 1024), 64 * 1024 * 1024);
        state.init_chunks();

        assert_eq!(state.chunks.len(), 3);
        assert_eq!(state.chunks[0].start, 0);
        assert_eq!(state.chunks[0].end, 64 * 1024 * 1024);
        assert_eq!(state.chunks[1].end, 128 * 1024 * 1024);
        assert_eq!(state.chunks[2].end, 160 * 1024 * 1024);
        assert_partition(&state);
    }

    #[test]
    fn test_init_chunks_single_chunk_file() {
        let mut state = FileState::new(&spec(1000), 64 * 1024 * 1024);
        state.init_chunks();

        assert_eq!(state.chunks.len(), 1);
        assert_eq!(state.chunks[0].start, 0);
        assert_eq!(state.chunks[0].end, 1000);
        assert_partition(&state);
    }

    #[test]
    fn test_init_chunks_zero_size_file() {
        let mut state = FileState::new(&spec(0), 64 * 1024 * 1024);
        state.init_chunks();

        assert_eq!(state.chunks.len(), 1);
        assert!(state.chunks[0].is_empty());
        assert_eq!(state.chunks[0].len(), 0);
    }

    #[test]
    fn test_init_chunks_exact_multiple() {
        let mut state = FileState::new(&spec(128), 64);
        state.init_chunks();
        assert_eq!(state.chunks.len(), 2);
        assert_partition(&state);
    }

    #[test]
    fn test_init_chunks_is_idempotent() {
        let mut state = FileState::new(&spec(100), 30);
        state.init_chunks();
        state.chunks[0].status = ChunkStatus::Complete;
        state.chunks[0].bytes_downloaded = 30;

        state.init_chunks();
        assert_eq!(state.chunks[0].status, ChunkStatus::Complete);
        assert_eq!(state.chunks[0].bytes_downloaded, 30);
    }

    #[test]
    fn test_pending_indices() {
        let mut state = FileState::new(&spec(100), 30);
        state.init_chunks();
        assert_eq!(state.pending_indices(), vec![0, 1, 2, 3]);

        state.chunks[1].status = ChunkStatus::Complete;
        assert_eq!(state.pending_indices(), vec![0, 2, 3]);
        assert!(!state.all_chunks_complete());
    }

    #[test]
    fn test_bytes_downloaded_sum() {
        let mut state = FileState::new(&spec(100), 30);
        state.init_chunks();
        state.chunks[0].bytes_downloaded = 30;
        state.chunks[1].bytes_downloaded = 12;
        assert_eq!(state.bytes_downloaded(), 42);
    }

    #[test]
    fn test_status_json_names_are_lowercase() {
        let json = serde_json::to_string(&FileStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
        let json = serde_json::to_string(&ChunkStatus::Complete).unwrap();
        assert_eq!(json, "\"complete\"");
    }

    #[test]
    fn test_readers_tolerate_unknown_fields() {
        let json = r#"{
            "file_id": "EGAF1", "file_name": "a.bam", "status": "pending",
            "size": 10, "checksum_expected": "", "checksum_type": "",
            "chunk_size": 4, "chunks": [], "retry_count": 0,
            "some_future_field": {"nested": true}
        }"#;
        let state: FileState = serde_json::from_str(json).unwrap();
        assert_eq!(state.file_id, "EGAF1");
        assert_eq!(state.status, FileStatus::Pending);
    }
}
