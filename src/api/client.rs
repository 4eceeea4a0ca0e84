//! The EGA REST client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, RANGE};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{DatasetInfo, FileMetadata};
use crate::auth::TokenProvider;
use crate::error::{Error, Result};

/// EGA API v2 base URL for file data (from pyEGA3's server file).
const DATA_BASE_URL: &str = "https://ega.ebi.ac.uk:8443/v2";

/// EGA API v2 base URL for metadata.
const METADATA_BASE_URL: &str = "https://ega.ebi.ac.uk:8443/v2/metadata";

/// Timeout for metadata requests. Streaming requests deliberately carry
/// no body timeout; large chunks routinely take longer than any sane
/// fixed deadline.
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Connect timeout for both clients.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Retries for metadata requests (chunk transfers run their own loop).
const METADATA_RETRIES: u32 = 3;

/// Client for the EGA REST APIs.
///
/// Owns the process-wide connection pools. Clone-cheap via internal Arcs
/// in the underlying clients; typically shared behind one more [`Arc`].
pub struct ApiClient {
    token_provider: Arc<dyn TokenProvider>,
    metadata_client: ClientWithMiddleware,
    stream_client: ClientWithMiddleware,
    data_base: String,
    metadata_base: String,
}

impl ApiClient {
    /// Create a client against the production EGA endpoints.
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Result<Self> {
        Self::with_base_urls(token_provider, DATA_BASE_URL, METADATA_BASE_URL)
    }

    /// Create a client against custom base URLs (tests, mirrors).
    pub fn with_base_urls(
        token_provider: Arc<dyn TokenProvider>,
        data_base: impl Into<String>,
        metadata_base: impl Into<String>,
    ) -> Result<Self> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(METADATA_RETRIES);
        let metadata_client = ClientBuilder::new(
            reqwest::Client::builder()
                .timeout(METADATA_TIMEOUT)
                .connect_timeout(CONNECT_TIMEOUT)
                .build()?,
        )
        .with(TracingMiddleware::default())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

        let stream_client = ClientBuilder::new(
            reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()?,
        )
        .with(TracingMiddleware::default())
        .build();

        Ok(Self {
            token_provider,
            metadata_client,
            stream_client,
            data_base: data_base.into(),
            metadata_base: metadata_base.into(),
        })
    }

    /// List all datasets the authenticated user has access to.
    pub async fn list_datasets(&self) -> Result<Vec<DatasetInfo>> {
        self.get_json(&format!("{}/datasets", self.metadata_base))
            .await
    }

    /// List all files belonging to a dataset.
    pub async fn list_dataset_files(&self, dataset_id: &str) -> Result<Vec<FileMetadata>> {
        self.get_json(&format!(
            "{}/datasets/{dataset_id}/files",
            self.metadata_base
        ))
        .await
    }

    /// Fetch metadata for a single file.
    pub async fn file_metadata(&self, file_id: &str) -> Result<FileMetadata> {
        self.get_json(&format!("{}/files/{file_id}", self.metadata_base))
            .await
    }

    /// The full URL for streaming a file in plain mode. Callers use Range
    /// headers against it to fetch specific byte windows.
    pub fn download_url(&self, file_id: &str) -> String {
        format!(
            "{}/files/{file_id}?destinationFormat=plain",
            self.data_base
        )
    }

    /// Issue a ranged GET on the streaming client and hand back the open
    /// response. `end` is inclusive, per HTTP Range semantics.
    ///
    /// A fresh bearer token is fetched per call. Both `206` (range
    /// honored) and `200` (range ignored) are returned to the caller,
    /// which must handle the distinction; anything else becomes an
    /// [`Error::Api`] carrying the status and body.
    pub async fn stream_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<reqwest::Response> {
        let token = self.token_provider.access_token().await?;
        debug!(url, start, end, "requesting range");

        let response = self
            .stream_client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.token_provider.access_token().await?;

        let response = self
            .metadata_client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}
