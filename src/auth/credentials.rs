//! Credential persistence under `~/.egafetch/`.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CREDENTIALS_FILE: &str = "credentials.json";

/// Stored OAuth2 session: tokens plus expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub username: String,
}

impl Credentials {
    /// Whether the access token expires within `margin` from now.
    pub fn is_expired(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

fn credentials_path() -> Result<PathBuf> {
    let home = home::home_dir()
        .ok_or_else(|| Error::Auth("could not determine home directory".into()))?;
    Ok(home.join(".egafetch").join(CREDENTIALS_FILE))
}

/// Load credentials from disk. Returns `None` when none are stored.
pub fn load_credentials() -> Result<Option<Credentials>> {
    let path = credentials_path()?;
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Save credentials with mode 0600.
pub fn save_credentials(creds: &Credentials) -> Result<()> {
    let path = credentials_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec_pretty(creds)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Remove stored credentials. Missing files are not an error.
pub fn delete_credentials() -> Result<()> {
    let path = credentials_path()?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_margin() {
        let creds = Credentials {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + Duration::minutes(3),
            username: "user".into(),
        };
        // Expires in 3 minutes: stale under a 5-minute margin, fresh under 1.
        assert!(creds.is_expired(Duration::minutes(5)));
        assert!(!creds.is_expired(Duration::minutes(1)));
    }

    #[test]
    fn test_already_expired() {
        let creds = Credentials {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() - Duration::minutes(1),
            username: String::new(),
        };
        assert!(creds.is_expired(Duration::zero()));
    }
}
