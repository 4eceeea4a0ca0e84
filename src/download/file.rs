//! File downloader: one file's trip through the state machine.
//!
//! ```text
//!           ┌──────────────────────────────────┐
//!           │                                  ▼
//!   Pending → Chunking → Downloading → Merging → Verifying → Complete
//!                             │           │          │
//!                             └─► Failed ◄┴──────────┘
//!                                   │
//!                                   └─ (retry_count < 3) → Downloading
//! ```
//!
//! The snapshot on disk is refreshed before every transition and after
//! every chunk completion, so killing the process at any instant leaves
//! a state the next run can resume from.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk::{BytesWrittenCallback, ChunkDownloader};
use super::merge::merge_chunks;
use super::ProgressCallback;
use crate::api::ApiClient;
use crate::config::DownloadOptions;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::state::{ChunkState, ChunkStatus, FileSpec, FileState, FileStatus, StateStore};

/// File-level retries before a failure becomes terminal.
const MAX_FILE_RETRIES: u32 = 3;

/// Lower clamp for adaptive chunk sizing (8 MiB).
const MIN_ADAPTIVE_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Upper clamp for adaptive chunk sizing (256 MiB).
const MAX_ADAPTIVE_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Rolling window of throughput measurements.
const ADAPTIVE_WINDOW: usize = 3;

/// Above this mean throughput the chunk size scales up.
const HIGH_THROUGHPUT_MBPS: f64 = 50.0;

/// Below this mean throughput the chunk size scales down.
const LOW_THROUGHPUT_MBPS: f64 = 10.0;

const SCALE_UP_FACTOR: f64 = 1.5;
const SCALE_DOWN_FACTOR: f64 = 0.5;

/// Rolling throughput window for adaptive chunk sizing.
struct AdaptiveState {
    measurements: Vec<f64>,
    current_chunk_size: u64,
}

impl AdaptiveState {
    fn new(initial_chunk_size: u64) -> Self {
        Self {
            measurements: Vec::new(),
            current_chunk_size: initial_chunk_size,
        }
    }

    /// Record one chunk's throughput. Chunk workers call this as they
    /// finish; no sizing decision happens here.
    fn record(&mut self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        let bps = bytes as f64 / elapsed.as_secs_f64();
        self.measurements.push(bps);
        if self.measurements.len() > ADAPTIVE_WINDOW {
            let excess = self.measurements.len() - ADAPTIVE_WINDOW;
            self.measurements.drain(..excess);
        }
    }

    /// Apply one scale step from the current window mean and return the
    /// resulting chunk size. Called once per completed batch; a partial
    /// window leaves the size unchanged.
    fn adjust(&mut self) -> u64 {
        if self.measurements.len() < ADAPTIVE_WINDOW {
            return self.current_chunk_size;
        }

        let mean_mbps = self.measurements.iter().sum::<f64>()
            / self.measurements.len() as f64
            / (1024.0 * 1024.0);

        let mut new_size = self.current_chunk_size;
        if mean_mbps > HIGH_THROUGHPUT_MBPS {
            new_size = (self.current_chunk_size as f64 * SCALE_UP_FACTOR) as u64;
        } else if mean_mbps < LOW_THROUGHPUT_MBPS {
            new_size = (self.current_chunk_size as f64 * SCALE_DOWN_FACTOR) as u64;
        }

        self.current_chunk_size = new_size.clamp(MIN_ADAPTIVE_CHUNK_SIZE, MAX_ADAPTIVE_CHUNK_SIZE);
        self.current_chunk_size
    }
}

/// Drives one [`FileState`] through the download state machine.
pub struct FileDownloader {
    spec: FileSpec,
    api: Arc<ApiClient>,
    store: Arc<StateStore>,
    opts: DownloadOptions,
    limiter: Option<Arc<RateLimiter>>,
    on_progress: Option<ProgressCallback>,
    live_bytes: Arc<Mutex<u64>>,
    adaptive: Option<Arc<Mutex<AdaptiveState>>>,
}

impl FileDownloader {
    /// Create a downloader for one file.
    pub fn new(
        spec: FileSpec,
        api: Arc<ApiClient>,
        store: Arc<StateStore>,
        opts: DownloadOptions,
        limiter: Option<Arc<RateLimiter>>,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        let adaptive = opts
            .adaptive_chunks
            .then(|| Arc::new(Mutex::new(AdaptiveState::new(opts.chunk_size))));
        Self {
            spec,
            api,
            store,
            opts,
            limiter,
            on_progress,
            live_bytes: Arc::new(Mutex::new(0)),
            adaptive,
        }
    }

    /// Run the state machine to a terminal state.
    ///
    /// Resumes from a persisted snapshot when one exists. On cancellation
    /// the current state is persisted and [`Error::Cancelled`] returned;
    /// other failures consume up to three file-level retries before they
    /// are surfaced.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let state = match self.store.load_file_state(&self.spec.file_id)? {
            Some(existing) => existing,
            None => FileState::new(&self.spec, self.opts.chunk_size),
        };
        let state = Arc::new(Mutex::new(state));
        let mut last_err: Option<Error> = None;

        loop {
            if cancel.is_cancelled() {
                self.persist(&state)?;
                return Err(Error::Cancelled);
            }
            self.persist(&state)?;

            let status = state.lock().unwrap().status;
            match status {
                FileStatus::Pending | FileStatus::Chunking => {
                    let mut st = state.lock().unwrap();
                    st.init_chunks();
                    st.status = FileStatus::Downloading;
                }

                FileStatus::Downloading => {
                    {
                        let mut st = state.lock().unwrap();
                        st.download_url = Some(self.api.download_url(&st.file_id));
                    }
                    match self.download_chunks(&state, cancel).await {
                        Ok(()) => state.lock().unwrap().status = FileStatus::Merging,
                        Err(Error::Cancelled) => {
                            self.persist(&state)?;
                            return Err(Error::Cancelled);
                        }
                        Err(err) => last_err = Some(self.mark_failed(&state, err)),
                    }
                }

                FileStatus::Merging => {
                    let (file_name, chunks) = {
                        let st = state.lock().unwrap();
                        (st.file_name.clone(), st.chunks.clone())
                    };
                    let chunks_dir = self.store.chunks_dir_for(&self.spec.file_id);
                    let output = self.store.output_path(&file_name);
                    match merge_chunks(&chunks_dir, &output, &chunks).await {
                        Ok(()) => state.lock().unwrap().status = FileStatus::Verifying,
                        Err(err) => last_err = Some(self.mark_failed(&state, err)),
                    }
                }

                FileStatus::Verifying => match self.verify_and_finish(&state).await {
                    Ok(()) => {
                        self.persist(&state)?;
                        self.cleanup_chunks().await;
                        info!(file_id = %self.spec.file_id, "download complete");
                        return Ok(());
                    }
                    Err(err) => {
                        if matches!(err, Error::ChecksumMismatch { .. }) {
                            // The merged data is bad; throw away the chunk
                            // plan so the retry re-downloads from scratch.
                            self.reset_chunks(&state).await;
                        }
                        last_err = Some(self.mark_failed(&state, err));
                    }
                },

                FileStatus::Complete => return Ok(()),

                FileStatus::Failed => {
                    let (retries, message) = {
                        let st = state.lock().unwrap();
                        (st.retry_count, st.error.clone().unwrap_or_default())
                    };
                    if retries < MAX_FILE_RETRIES {
                        warn!(
                            file_id = %self.spec.file_id,
                            retry = retries + 1,
                            "retrying failed download"
                        );
                        let mut st = state.lock().unwrap();
                        st.retry_count += 1;
                        st.status = FileStatus::Downloading;
                        st.error = None;
                    } else {
                        return Err(last_err
                            .take()
                            .unwrap_or(Error::DownloadFailed { retries, message }));
                    }
                }
            }
        }
    }

    /// Download every pending chunk through the bounded worker pool.
    async fn download_chunks(
        &self,
        state: &Arc<Mutex<FileState>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunks_dir = self.store.chunks_dir_for(&self.spec.file_id);
        tokio::fs::create_dir_all(&chunks_dir).await?;

        // Seed the live counter with what previous runs already fetched.
        {
            let downloaded = state.lock().unwrap().bytes_downloaded();
            *self.live_bytes.lock().unwrap() = downloaded;
        }

        let mut pending = state.lock().unwrap().pending_indices();
        if pending.is_empty() {
            return Ok(());
        }

        let Some(adaptive) = self.adaptive.clone() else {
            return self.download_batch(state, &chunks_dir, pending, cancel).await;
        };

        // Adaptive mode: dispatch in waves of `parallel_chunks`, and
        // reshape the remaining tail between waves when the throughput
        // window asks for a different chunk size. One scale decision per
        // batch, computed only after the whole wave has joined.
        while !pending.is_empty() {
            let take = self.opts.parallel_chunks.min(pending.len());
            let batch: Vec<usize> = pending.drain(..take).collect();
            self.download_batch(state, &chunks_dir, batch, cancel).await?;

            if !pending.is_empty() {
                let new_size = adaptive.lock().unwrap().adjust();
                let mut st = state.lock().unwrap();
                if new_size != st.chunk_size {
                    debug!(
                        file_id = %self.spec.file_id,
                        new_size,
                        "rechunking remaining bytes"
                    );
                    rechunk_remaining(&mut st, new_size);
                    pending = st.pending_indices();
                    drop(st);
                    self.persist(state)?;
                }
            }
        }
        Ok(())
    }

    /// Download one batch of chunks concurrently. The first real error
    /// cancels the batch's siblings; their cancellation errors are
    /// suppressed in favor of the original failure.
    async fn download_batch(
        &self,
        state: &Arc<Mutex<FileState>>,
        chunks_dir: &Path,
        batch: Vec<usize>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let download_url = state
            .lock()
            .unwrap()
            .download_url
            .clone()
            .ok_or_else(|| Error::Internal("download URL not resolved".into()))?;

        let sem = Arc::new(Semaphore::new(self.opts.parallel_chunks));
        let batch_cancel = cancel.child_token();
        let on_bytes = self.bytes_callback();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for index in batch {
            let sem = Arc::clone(&sem);
            let state = Arc::clone(state);
            let store = Arc::clone(&self.store);
            let adaptive = self.adaptive.clone();
            let token = batch_cancel.clone();
            let downloader = ChunkDownloader::new(
                Arc::clone(&self.api),
                download_url.clone(),
                chunks_dir.to_path_buf(),
                self.limiter.clone(),
                Some(Arc::clone(&on_bytes)),
            );

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    permit = sem.acquire_owned() => {
                        permit.map_err(|_| Error::Cancelled)?
                    }
                };

                let started = Instant::now();
                let result = downloader.download(&state, index, &token).await;

                if result.is_ok() {
                    if let Some(adaptive) = &adaptive {
                        let chunk_len = {
                            let st = state.lock().unwrap();
                            st.chunks[index].len()
                        };
                        adaptive.lock().unwrap().record(chunk_len, started.elapsed());
                    }
                }

                // Snapshot after every chunk completion or failure.
                let persisted = {
                    let st = state.lock().unwrap();
                    store.save_file_state(&st)
                };

                result.and(persisted)
            });
        }

        let mut first_err: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(Error::Internal(format!("chunk task failed: {join_err}"))),
            };
            if let Err(err) = outcome {
                let real = !matches!(err, Error::Cancelled);
                if real {
                    batch_cancel.cancel();
                }
                match &first_err {
                    None => first_err = Some(err),
                    Some(Error::Cancelled) if real => first_err = Some(err),
                    Some(_) => {}
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Verify the merged output and stamp the state complete.
    async fn verify_and_finish(&self, state: &Arc<Mutex<FileState>>) -> Result<()> {
        let (file_name, expected, checksum_type) = {
            let st = state.lock().unwrap();
            (
                st.file_name.clone(),
                st.checksum_expected.clone(),
                st.checksum_type.clone(),
            )
        };
        let output = self.store.output_path(&file_name);

        if !expected.is_empty() {
            let path = output.clone();
            let want = expected.clone();
            let kind = checksum_type.clone();
            tokio::task::spawn_blocking(move || crate::verify::verify_file(&path, &want, &kind))
                .await
                .map_err(|e| Error::Internal(format!("verify task failed: {e}")))??;
        }

        self.write_md5_sidecar(&output, &file_name, &expected, &checksum_type)
            .await?;

        let mut st = state.lock().unwrap();
        st.status = FileStatus::Complete;
        st.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Write the md5sum-style sidecar next to the output file. The MD5 is
    /// recomputed unless the verified checksum already is one.
    async fn write_md5_sidecar(
        &self,
        output: &Path,
        file_name: &str,
        expected: &str,
        checksum_type: &str,
    ) -> Result<()> {
        let md5_hex = if !expected.is_empty() && checksum_type.eq_ignore_ascii_case("MD5") {
            expected.to_lowercase()
        } else {
            let path = output.to_path_buf();
            tokio::task::spawn_blocking(move || crate::verify::compute_checksum(&path, "MD5"))
                .await
                .map_err(|e| Error::Internal(format!("checksum task failed: {e}")))??
        };

        let basename = Path::new(file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());
        let line = crate::verify::sidecar_line(&md5_hex, &basename);

        let mut sidecar = OsString::from(output.as_os_str());
        sidecar.push(".md5");
        tokio::fs::write(PathBuf::from(sidecar), line).await?;
        Ok(())
    }

    /// Callback wired into every chunk worker: bump the monotonic live
    /// counter under the file's mutex and forward to the session callback.
    fn bytes_callback(&self) -> BytesWrittenCallback {
        let live = Arc::clone(&self.live_bytes);
        let on_progress = self.on_progress.clone();
        let file_id = self.spec.file_id.clone();
        let total = self.spec.size;
        Arc::new(move |n: u64| {
            // The guard spans the callback: progress events for one file
            // are serialized and never observed out of order.
            let mut live = live.lock().unwrap();
            *live += n;
            if let Some(cb) = &on_progress {
                cb(&file_id, *live, total);
            }
        })
    }

    fn mark_failed(&self, state: &Arc<Mutex<FileState>>, err: Error) -> Error {
        warn!(file_id = %self.spec.file_id, error = %err, "file download failed");
        let mut st = state.lock().unwrap();
        st.status = FileStatus::Failed;
        st.error = Some(err.to_string());
        err
    }

    /// Drop the chunk plan and its part-files so the next attempt starts
    /// from byte zero.
    async fn reset_chunks(&self, state: &Arc<Mutex<FileState>>) {
        {
            let mut st = state.lock().unwrap();
            for chunk in &mut st.chunks {
                chunk.status = ChunkStatus::Pending;
                chunk.bytes_downloaded = 0;
            }
        }
        *self.live_bytes.lock().unwrap() = 0;
        self.cleanup_chunks().await;
    }

    async fn cleanup_chunks(&self) {
        let chunks_dir = self.store.chunks_dir_for(&self.spec.file_id);
        let _ = tokio::fs::remove_dir_all(&chunks_dir).await;
    }

    fn persist(&self, state: &Arc<Mutex<FileState>>) -> Result<()> {
        let st = state.lock().unwrap();
        self.store.save_file_state(&st)
    }
}

/// Re-split the unfinished tail of the chunk plan with a new chunk size.
///
/// The completed prefix keeps its chunks and part-files untouched; new
/// chunk indices continue densely after it. Plans where completed chunks
/// do not form a prefix are left alone, keeping the partition contiguous.
fn rechunk_remaining(state: &mut FileState, new_chunk_size: u64) {
    let Some(first_incomplete) = state
        .chunks
        .iter()
        .position(|c| c.status != ChunkStatus::Complete)
    else {
        return;
    };
    if state.chunks[first_incomplete..]
        .iter()
        .any(|c| c.status == ChunkStatus::Complete)
    {
        return;
    }

    let tail_start = state.chunks[first_incomplete].start;
    let mut chunks: Vec<ChunkState> = state.chunks[..first_incomplete].to_vec();

    let mut offset = tail_start;
    let mut index = first_incomplete;
    while offset < state.size {
        let end = (offset + new_chunk_size).min(state.size);
        chunks.push(ChunkState {
            index,
            start: offset,
            end,
            status: ChunkStatus::Pending,
            bytes_downloaded: 0,
            retry_count: 0,
        });
        offset = end;
        index += 1;
    }

    state.chunks = chunks;
    state.chunk_size = new_chunk_size;
}
