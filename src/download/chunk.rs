//! Chunk downloader: one ranged GET into one part-file.
//!
//! Each chunk covers the half-open byte range `[start, end)` of its file
//! and is buffered on disk as `<chunks_dir>/<index:03>.part`. Transfers
//! resume from whatever the part-file already holds, so the range
//! actually requested is `[start + existing, end)`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::state::{ChunkStatus, FileState};

/// Maximum retries per chunk (six attempts total).
pub const MAX_CHUNK_RETRIES: u32 = 5;

/// Base delay of the exponential backoff.
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Callback invoked with the number of new bytes written to disk.
pub type BytesWrittenCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Downloads a single chunk of a file using HTTP Range requests.
pub struct ChunkDownloader {
    api: Arc<ApiClient>,
    download_url: String,
    chunks_dir: PathBuf,
    limiter: Option<Arc<RateLimiter>>,
    on_bytes: Option<BytesWrittenCallback>,
}

impl ChunkDownloader {
    /// Create a chunk downloader for one file's chunks directory.
    pub fn new(
        api: Arc<ApiClient>,
        download_url: impl Into<String>,
        chunks_dir: impl Into<PathBuf>,
        limiter: Option<Arc<RateLimiter>>,
        on_bytes: Option<BytesWrittenCallback>,
    ) -> Self {
        Self {
            api,
            download_url: download_url.into(),
            chunks_dir: chunks_dir.into(),
            limiter,
            on_bytes,
        }
    }

    /// Path of the part-file for a chunk index.
    pub fn chunk_path(chunks_dir: &Path, index: usize) -> PathBuf {
        chunks_dir.join(format!("{index:03}.part"))
    }

    /// Download chunk `index` of `state`, retrying retryable failures with
    /// exponential backoff plus jitter. Non-retryable errors (including
    /// cancellation) are returned immediately.
    pub async fn download(
        &self,
        state: &Arc<Mutex<FileState>>,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_err = Error::Internal("chunk download never attempted".into());

        for attempt in 0..=MAX_CHUNK_RETRIES {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if attempt > 0 {
                let exp = BASE_DELAY.saturating_mul(1 << (attempt - 1)).min(MAX_DELAY);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(exp + jitter) => {}
                }
            }

            match self.attempt(state, index, cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(index, attempt, error = %err, "chunk attempt failed, will retry");
                    {
                        let mut st = state.lock().unwrap();
                        let chunk = &mut st.chunks[index];
                        chunk.retry_count += 1;
                        chunk.status = ChunkStatus::Failed;
                    }
                    last_err = err;
                }
            }
        }

        warn!(index, retries = MAX_CHUNK_RETRIES, "chunk exhausted its retries");
        Err(last_err)
    }

    /// A single download attempt.
    async fn attempt(
        &self,
        state: &Arc<Mutex<FileState>>,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (start, end) = {
            let st = state.lock().unwrap();
            (st.chunks[index].start, st.chunks[index].end)
        };
        let path = Self::chunk_path(&self.chunks_dir, index);
        let expected = end - start;

        if expected == 0 {
            // Zero-size file: just materialize the empty part-file.
            tokio::fs::File::create(&path).await?;
            let mut st = state.lock().unwrap();
            let chunk = &mut st.chunks[index];
            chunk.status = ChunkStatus::Complete;
            chunk.bytes_downloaded = 0;
            return Ok(());
        }

        let existing = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if existing >= expected {
            if existing > expected {
                // Trim overshoot left behind by an earlier, larger chunk plan.
                let file = OpenOptions::new().write(true).open(&path).await?;
                file.set_len(expected).await?;
            }
            // Already complete from a previous run; report the bytes so the
            // progress display catches up.
            let already = {
                let mut st = state.lock().unwrap();
                let chunk = &mut st.chunks[index];
                let already = chunk.bytes_downloaded;
                chunk.status = ChunkStatus::Complete;
                chunk.bytes_downloaded = expected;
                already
            };
            if already < expected {
                if let Some(cb) = &self.on_bytes {
                    cb(expected - already);
                }
            }
            debug!(index, "chunk already on disk, skipping");
            return Ok(());
        }

        let response = self
            .api
            .stream_range(&self.download_url, start + existing, end - 1)
            .await?;

        // A 200 means the server ignored the Range header and is sending
        // the whole resource from byte zero. The partial part-file must be
        // dropped (its bytes would duplicate in the output), and the body
        // needs skipping up to `start`.
        let range_honored = response.status() == StatusCode::PARTIAL_CONTENT;
        let (mut file, mut written, mut body_pos) = if range_honored {
            let file = OpenOptions::new().append(true).create(true).open(&path).await?;
            (file, existing, start + existing)
        } else {
            if existing > 0 {
                warn!(index, "server ignored Range header, restarting chunk from zero");
            }
            let file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(&path)
                .await?;
            (file, 0, 0)
        };

        {
            let mut st = state.lock().unwrap();
            let chunk = &mut st.chunks[index];
            chunk.status = ChunkStatus::Downloading;
            chunk.bytes_downloaded = written;
        }

        let mut stream = response.bytes_stream();
        while written < expected {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(Error::Cancelled);
                }
                item = stream.next() => item,
            };
            let Some(bytes) = item.transpose()? else { break };

            // Keep only the part of this read that falls inside
            // [start, end); everything else belongs to other chunks.
            let mut buf: &[u8] = &bytes;
            if body_pos < start {
                let skip = ((start - body_pos) as usize).min(buf.len());
                buf = &buf[skip..];
                body_pos += skip as u64;
            }
            if buf.is_empty() {
                continue;
            }
            let take = ((expected - written) as usize).min(buf.len());
            let buf = &buf[..take];

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        file.flush().await?;
                        return Err(Error::Cancelled);
                    }
                    _ = limiter.acquire(take as u64) => {}
                }
            }

            file.write_all(buf).await?;
            written += take as u64;
            body_pos += take as u64;

            {
                let mut st = state.lock().unwrap();
                st.chunks[index].bytes_downloaded = written;
            }
            if let Some(cb) = &self.on_bytes {
                cb(take as u64);
            }
        }

        file.flush().await?;

        if written < expected {
            return Err(Error::IncompleteBody {
                got: written,
                expected,
            });
        }

        let mut st = state.lock().unwrap();
        let chunk = &mut st.chunks[index];
        chunk.status = ChunkStatus::Complete;
        chunk.bytes_downloaded = expected;
        Ok(())
    }
}
