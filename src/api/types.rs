//! Data types returned by the EGA metadata API.

use serde::Deserialize;

/// Length of the AES IV prefix included in EGA-reported file sizes.
///
/// In plain mode the server strips a 16-byte IV from the payload, so the
/// size usable for range math is `fileSize - 16`. This correction is
/// applied in exactly one place, [`FileMetadata::plain_size`].
pub const IV_PREFIX_LEN: u64 = 16;

/// A file as returned by the metadata API, either from a dataset listing
/// or from a single-file lookup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub plain_checksum: String,
    #[serde(default)]
    pub unencrypted_checksum: String,
    #[serde(default)]
    pub checksum_type: String,
    #[serde(default)]
    pub file_status: String,
}

impl FileMetadata {
    /// Best available checksum value and its type.
    ///
    /// The API reports the checksum under different field names depending
    /// on its version (`plainChecksum` on v2, `unencryptedChecksum` on
    /// v1). When no type is reported, it is inferred from the hex length:
    /// 32 characters is MD5, 64 is SHA-256.
    pub fn best_checksum(&self) -> (String, String) {
        let value = [
            &self.plain_checksum,
            &self.unencrypted_checksum,
            &self.checksum,
        ]
        .into_iter()
        .find(|c| !c.is_empty())
        .cloned()
        .unwrap_or_default();

        if value.is_empty() {
            return (String::new(), String::new());
        }
        if !self.checksum_type.is_empty() {
            return (value, self.checksum_type.clone());
        }
        let kind = match value.len() {
            32 => "MD5",
            64 => "SHA256",
            _ => "",
        };
        (value, kind.to_string())
    }

    /// File size in plain mode, with the IV prefix subtracted.
    pub fn plain_size(&self) -> u64 {
        self.file_size.saturating_sub(IV_PREFIX_LEN)
    }
}

/// A dataset the authenticated user has access to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    pub dataset_id: String,
}
