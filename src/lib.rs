//! egafetch downloads large files from the European Genome-phenome
//! Archive (EGA) over HTTPS, reliably and in parallel.
//!
//! Files are fetched in byte-range chunks across a two-level worker pool
//! (files × chunks), with every piece of progress persisted under
//! `<output>/.egafetch/`. Killing the process at any instant (crash,
//! Ctrl-C, network loss) leaves a snapshot the next run resumes from at
//! byte granularity.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use egafetch::{
//!     ApiClient, DownloadOptions, Manifest, Orchestrator, StateStore,
//!     auth::StaticTokenProvider, state::FileSpec,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> egafetch::Result<()> {
//! let api = Arc::new(ApiClient::new(Arc::new(StaticTokenProvider::new("token")))?);
//! let store = Arc::new(StateStore::new("downloads"));
//!
//! let mut manifest = Manifest::new(Some("EGAD00000000001".into()));
//! manifest.files.push(FileSpec {
//!     file_id: "EGAF00000000001".into(),
//!     file_name: "sample.bam".into(),
//!     size: 1_073_741_824,
//!     checksum: String::new(),
//!     checksum_type: String::new(),
//! });
//!
//! let orchestrator = Orchestrator::new(api, store, DownloadOptions::default());
//! orchestrator.download(&mut manifest, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`download`] - The engine: chunk downloader, per-file state machine,
//!   orchestrator and merge helper
//! - [`state`] - Durable manifest and per-file state under `.egafetch/`
//! - [`api`] - EGA REST client (metadata and ranged streaming)
//! - [`auth`] - OAuth2 token management
//! - [`limiter`] - Shared token-bucket bandwidth limiter
//! - [`verify`] - Checksum computation and `.md5` sidecars
//! - [`progress`] - Progress bar sink fed by engine callbacks
//! - [`config`] - Session options
//! - [`error`] - Centralized error handling

pub mod api;
pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod limiter;
pub mod progress;
pub mod state;
pub mod verify;

pub use api::ApiClient;
pub use auth::{AuthManager, StaticTokenProvider, TokenProvider};
pub use config::{parse_size, DownloadOptions};
pub use download::{ChunkDownloader, FileDownloader, Orchestrator};
pub use error::{Error, Result};
pub use limiter::RateLimiter;
pub use progress::ProgressTracker;
pub use state::{FileState, Manifest, StateStore};
