//! Client for the EGA REST APIs.
//!
//! Two HTTP clients live here: a metadata client with a bounded timeout
//! and transparent retries, and a streaming client without a body timeout
//! for ranged file transfers. Both attach a fresh bearer token from the
//! session's [`TokenProvider`](crate::auth::TokenProvider) to every
//! request.

mod client;
mod types;

pub use client::ApiClient;
pub use types::{DatasetInfo, FileMetadata, IV_PREFIX_LEN};
