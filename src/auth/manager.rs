//! The OAuth2 auth manager.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::credentials::{delete_credentials, load_credentials, save_credentials, Credentials};
use super::TokenProvider;
use crate::error::{Error, Result};

/// EGA OAuth2 token endpoint.
const TOKEN_ENDPOINT: &str = "https://ega.ebi.ac.uk:8443/ega-openid-connect-server/token";

/// Refresh the token this long before it expires.
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Token lifetime assumed when the server omits `expires_in`. EGA tokens
/// typically last about an hour.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Client credentials for the EGA OIDC application. These are public
/// values shipped with pyEGA3, not user secrets.
const CLIENT_ID: &str = "f20cd2d3-682a-4568-a53e-4262ef54c8f4";
const CLIENT_SECRET: &str = "AMenuDLjVdVo4BSwi0QD54LL6NeVDEZRzEQUJ7hJOM3g4imDZBHHX0hNfKHPeQIGkskhtCmqAJtt_jm7EKq-rWw";
const GRANT_SCOPE: &str = "openid";

/// Manages OAuth2 authentication against the EGA AAI.
///
/// Implements [`TokenProvider`] and is safe for concurrent use: the token
/// is refreshed lazily, under the manager's internal mutex, whenever it is
/// within five minutes of expiry.
pub struct AuthManager {
    creds: Mutex<Option<Credentials>>,
    http: reqwest::Client,
    token_endpoint: String,
}

impl AuthManager {
    /// Create an auth manager, loading any stored credentials from disk.
    pub fn new() -> Result<Self> {
        let creds = load_credentials()?;
        Ok(Self {
            creds: Mutex::new(creds),
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(30))
                .build()?,
            token_endpoint: TOKEN_ENDPOINT.to_string(),
        })
    }

    /// Create a manager against a non-default token endpoint.
    pub fn with_token_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let mut manager = Self::new()?;
        manager.token_endpoint = endpoint.into();
        Ok(manager)
    }

    /// Authenticate with username and password and store the session.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let mut guard = self.creds.lock().await;
        let mut creds = self
            .request_token(&[
                ("grant_type", "password"),
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("scope", GRANT_SCOPE),
                ("username", username),
                ("password", password),
            ])
            .await?;
        creds.username = username.to_string();
        save_credentials(&creds)?;
        *guard = Some(creds);
        Ok(())
    }

    /// Clear stored credentials from memory and disk.
    pub async fn logout(&self) -> Result<()> {
        let mut guard = self.creds.lock().await;
        *guard = None;
        delete_credentials()
    }

    /// The current credentials, if logged in. Does not refresh.
    pub async fn status(&self) -> Option<Credentials> {
        self.creds.lock().await.clone()
    }

    /// The stored username, or empty when not logged in.
    pub async fn username(&self) -> String {
        self.creds
            .lock()
            .await
            .as_ref()
            .map(|c| c.username.clone())
            .unwrap_or_default()
    }

    async fn get_or_refresh(&self) -> Result<String> {
        let mut guard = self.creds.lock().await;
        let creds = guard.as_ref().ok_or_else(|| {
            Error::Auth("not authenticated; run 'egafetch auth login' first".into())
        })?;

        if !creds.is_expired(Duration::minutes(REFRESH_MARGIN_MINUTES)) {
            return Ok(creds.access_token.clone());
        }

        debug!("access token near expiry, refreshing");
        if creds.refresh_token.is_empty() {
            return Err(Error::Auth(
                "no refresh token available; run 'egafetch auth login'".into(),
            ));
        }

        let refresh_token = creds.refresh_token.clone();
        let username = creds.username.clone();
        let mut refreshed = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("refresh_token", &refresh_token),
            ])
            .await?;
        refreshed.username = username;
        save_credentials(&refreshed)?;
        let token = refreshed.access_token.clone();
        *guard = Some(refreshed);
        Ok(token)
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<Credentials> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        let parsed: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(Error::Auth(format!(
                    "authentication error ({}): {body}",
                    status.as_u16()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !status.is_success() {
            let detail = parsed.error_description.unwrap_or(body);
            return Err(Error::Auth(format!(
                "authentication error ({}): {detail}",
                status.as_u16()
            )));
        }

        let lifetime = match parsed.expires_in {
            Some(secs) if secs > 0 => Duration::seconds(secs),
            _ => Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
        };

        Ok(Credentials {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            expires_at: Utc::now() + lifetime,
            username: String::new(),
        })
    }
}

impl TokenProvider for AuthManager {
    fn access_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(self.get_or_refresh())
    }
}

/// JSON structure returned by the EGA token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[allow(dead_code)]
    token_type: Option<String>,
    error_description: Option<String>,
}
