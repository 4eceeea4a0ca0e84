//! The download engine.
//!
//! Three concentric layers, leaves first:
//!
//! - [`chunk`] - one HTTP ranged GET streamed into a numbered part-file,
//!   with retry/backoff, throttling and byte-precise resume.
//! - [`file`] - one file's state machine (pending → chunking →
//!   downloading → merging → verifying → complete/failed), its chunk
//!   worker pool and optional adaptive rechunking.
//! - [`orchestrator`] - schedules files across the session's
//!   file-parallelism budget and propagates cancellation.
//!
//! Every layer persists its state through the
//! [`StateStore`](crate::state::StateStore) before state transitions and
//! after chunk completions, so a crash at any instant leaves a resumable
//! snapshot on disk.

pub mod chunk;
pub mod file;
pub mod merge;
pub mod orchestrator;

pub use chunk::ChunkDownloader;
pub use file::FileDownloader;
pub use orchestrator::Orchestrator;

use std::sync::Arc;

/// Callback invoked with `(file_id, bytes_downloaded, total_bytes)` as
/// live progress. Serialized per file; concurrent across files.
pub type ProgressCallback = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Callback invoked with `(file_id, file_name)` on file lifecycle events.
pub type FileCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callback invoked with `(file_id, file_name, error)` when a file
/// finishes, successfully or not.
pub type FileDoneCallback = Arc<dyn Fn(&str, &str, Option<&crate::error::Error>) + Send + Sync>;
