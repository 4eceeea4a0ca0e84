//! Orchestrator: schedules file downloads across the session.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::file::FileDownloader;
use super::{FileCallback, FileDoneCallback, ProgressCallback};
use crate::api::ApiClient;
use crate::config::DownloadOptions;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::state::{Manifest, StateStore};

/// Coordinates parallel file downloads under the `parallel_files` budget.
///
/// The orchestrator owns the session-wide rate limiter and fans the
/// shared HTTP client, state store and callbacks out to one
/// [`FileDownloader`] per manifest entry.
pub struct Orchestrator {
    api: Arc<ApiClient>,
    store: Arc<StateStore>,
    opts: DownloadOptions,
    limiter: Option<Arc<RateLimiter>>,
    on_progress: Option<ProgressCallback>,
    on_file_start: Option<FileCallback>,
    on_file_done: Option<FileDoneCallback>,
    on_file_skip: Option<FileCallback>,
}

impl Orchestrator {
    /// Create an orchestrator. A rate limiter is constructed when
    /// `opts.max_bandwidth` is set; it is shared by every chunk worker of
    /// every file in the session.
    pub fn new(api: Arc<ApiClient>, store: Arc<StateStore>, opts: DownloadOptions) -> Self {
        let limiter = opts.max_bandwidth.map(|b| Arc::new(RateLimiter::new(b)));
        Self {
            api,
            store,
            opts,
            limiter,
            on_progress: None,
            on_file_start: None,
            on_file_done: None,
            on_file_skip: None,
        }
    }

    /// Set the per-file progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Set the file lifecycle callbacks.
    pub fn with_file_callbacks(
        mut self,
        on_start: FileCallback,
        on_done: FileDoneCallback,
        on_skip: FileCallback,
    ) -> Self {
        self.on_file_start = Some(on_start);
        self.on_file_done = Some(on_done);
        self.on_file_skip = Some(on_skip);
        self
    }

    /// Download every file in the manifest.
    ///
    /// Files whose persisted state is already complete are skipped before
    /// they ever occupy a download slot. The first terminal error cancels
    /// the remaining work and is surfaced to the caller; cancellation
    /// errors of the siblings are suppressed.
    pub async fn download(&self, manifest: &mut Manifest, cancel: &CancellationToken) -> Result<()> {
        if manifest.files.is_empty() {
            return Err(Error::InvalidInput("no files to download".into()));
        }

        self.store.save_manifest(manifest)?;
        info!(files = manifest.files.len(), "starting download job");

        let sem = Arc::new(Semaphore::new(self.opts.parallel_files));
        let job_cancel = cancel.child_token();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for spec in manifest.files.clone() {
            let sem = Arc::clone(&sem);
            let api = Arc::clone(&self.api);
            let store = Arc::clone(&self.store);
            let opts = self.opts.clone();
            let limiter = self.limiter.clone();
            let on_progress = self.on_progress.clone();
            let on_start = self.on_file_start.clone();
            let on_done = self.on_file_done.clone();
            let on_skip = self.on_file_skip.clone();
            let token = job_cancel.clone();

            tasks.spawn(async move {
                // Check completeness before acquiring the semaphore so
                // finished files neither occupy a slot nor get reported as
                // cancelled when the job is shutting down.
                if let Some(existing) = store.load_file_state(&spec.file_id)? {
                    if existing.is_complete() {
                        debug!(file_id = %spec.file_id, "already complete, skipping");
                        if let Some(cb) = &on_skip {
                            cb(&spec.file_id, &spec.file_name);
                        }
                        return Ok(());
                    }
                }

                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    permit = sem.acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
                };

                if let Some(cb) = &on_start {
                    cb(&spec.file_id, &spec.file_name);
                }

                let downloader =
                    FileDownloader::new(spec.clone(), api, store, opts, limiter, on_progress);
                let result = downloader.run(&token).await;

                if let Some(cb) = &on_done {
                    cb(&spec.file_id, &spec.file_name, result.as_ref().err());
                }
                result
            });
        }

        let mut first_err: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(Error::Internal(format!("file task failed: {join_err}"))),
            };
            if let Err(err) = outcome {
                let real = !matches!(err, Error::Cancelled);
                if real {
                    // First terminal error cancels the rest of the job.
                    job_cancel.cancel();
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
}
