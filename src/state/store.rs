//! The state store: crash-safe persistence under `<output>/.egafetch/`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::file_state::FileState;
use crate::error::Result;

const STATE_ROOT: &str = ".egafetch";
const STATE_DIR: &str = "state";
const CHUNKS_DIR: &str = "chunks";
const MANIFEST_FILE: &str = "manifest.json";

/// A file to be downloaded, as resolved from the metadata API.
///
/// Immutable once the manifest has been built. `size` is the plain-mode
/// size, i.e. already corrected for the stripped IV prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    /// Expected checksum, empty when the API did not provide one.
    #[serde(default)]
    pub checksum: String,
    /// Checksum algorithm (`MD5` or `SHA256`), empty when unknown.
    #[serde(default)]
    pub checksum_type: String,
}

/// The job-level record enumerating the files of one download run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    pub files: Vec<FileSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Create an empty manifest stamped with the current time.
    pub fn new(dataset_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            dataset_id,
            files: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Handles persistence of the manifest and per-file states under a job
/// root directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    base_dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at the given output directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The output directory this store is rooted at.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to `.egafetch/` under the base directory.
    pub fn state_root(&self) -> PathBuf {
        self.base_dir.join(STATE_ROOT)
    }

    /// Path to `.egafetch/state/`.
    pub fn state_dir(&self) -> PathBuf {
        self.state_root().join(STATE_DIR)
    }

    /// Path to `.egafetch/chunks/`.
    pub fn chunks_dir(&self) -> PathBuf {
        self.state_root().join(CHUNKS_DIR)
    }

    /// Path to `.egafetch/chunks/<file_id>/`.
    pub fn chunks_dir_for(&self, file_id: &str) -> PathBuf {
        self.chunks_dir().join(file_id)
    }

    /// Path of the final merged output for a file.
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.base_dir.join(file_name)
    }

    fn manifest_path(&self) -> PathBuf {
        self.state_root().join(MANIFEST_FILE)
    }

    fn file_state_path(&self, file_id: &str) -> PathBuf {
        self.state_dir().join(format!("{file_id}.json"))
    }

    /// Idempotently create the state directory tree with mode 0755.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.state_root(), self.state_dir(), self.chunks_dir()] {
            fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }

    /// Read the manifest. Returns `None` when no manifest exists yet.
    pub fn load_manifest(&self) -> Result<Option<Manifest>> {
        read_json(&self.manifest_path())
    }

    /// Write the manifest atomically, stamping `updated_at`.
    pub fn save_manifest(&self, manifest: &mut Manifest) -> Result<()> {
        self.ensure_dirs()?;
        manifest.updated_at = Utc::now();
        atomic_write_json(&self.manifest_path(), manifest)
    }

    /// Read a file's state. Returns `None` when it does not exist.
    pub fn load_file_state(&self, file_id: &str) -> Result<Option<FileState>> {
        read_json(&self.file_state_path(file_id))
    }

    /// Write a file's state atomically.
    pub fn save_file_state(&self, state: &FileState) -> Result<()> {
        self.ensure_dirs()?;
        atomic_write_json(&self.file_state_path(&state.file_id), state)
    }

    /// Remove a file's state. Missing files are not an error.
    pub fn delete_file_state(&self, file_id: &str) -> Result<()> {
        match fs::remove_file(self.file_state_path(file_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every file state found on disk.
    pub fn list_file_states(&self) -> Result<Vec<FileState>> {
        let dir = self.state_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path)?;
            states.push(serde_json::from_slice(&data)?);
        }
        states.sort_by(|a: &FileState, b: &FileState| a.file_id.cmp(&b.file_id));
        Ok(states)
    }

    /// Recursively remove `.egafetch/`. Used by the `--restart` flow.
    pub fn reset(&self) -> Result<()> {
        debug!(root = %self.state_root().display(), "resetting download state");
        match fs::remove_dir_all(self.state_root()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Serialize `value` and write it atomically: temp file in the target
/// directory, flush + fsync, chmod 0644, rename onto the target. The temp
/// file is removed on any failure, so readers see either the previous
/// snapshot or the new one, never a torn write.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(&data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChunkStatus, FileStatus};
    use tempfile::TempDir;

    fn sample_spec() -> FileSpec {
        FileSpec {
            file_id: "EGAF00000000001".into(),
            file_name: "sample.bam".into(),
            size: 1024,
            checksum: "d41d8cd98f00b204e9800998ecf8427e".into(),
            checksum_type: "MD5".into(),
        }
    }

    #[test]
    fn test_ensure_dirs_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.ensure_dirs().unwrap();
        store.ensure_dirs().unwrap();
        assert!(store.state_dir().is_dir());
        assert!(store.chunks_dir().is_dir());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        assert!(store.load_manifest().unwrap().is_none());

        let mut manifest = Manifest::new(Some("EGAD00000000001".into()));
        manifest.files.push(sample_spec());
        let created = manifest.created_at;
        store.save_manifest(&mut manifest).unwrap();

        let loaded = store.load_manifest().unwrap().unwrap();
        assert_eq!(loaded.dataset_id.as_deref(), Some("EGAD00000000001"));
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].file_id, "EGAF00000000001");
        assert!(loaded.updated_at >= created);
    }

    #[test]
    fn test_file_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let spec = sample_spec();

        assert!(store.load_file_state(&spec.file_id).unwrap().is_none());

        let mut state = FileState::new(&spec, 256);
        state.init_chunks();
        state.chunks[0].status = ChunkStatus::Complete;
        state.chunks[0].bytes_downloaded = 256;
        state.status = FileStatus::Downloading;
        store.save_file_state(&state).unwrap();

        let loaded = store.load_file_state(&spec.file_id).unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Downloading);
        assert_eq!(loaded.chunks.len(), 4);
        assert_eq!(loaded.chunks[0].status, ChunkStatus::Complete);
        assert_eq!(loaded.bytes_downloaded(), 256);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = FileState::new(&sample_spec(), 256);
        store.save_file_state(&state).unwrap();
        store.save_file_state(&state).unwrap();

        let leftovers: Vec<_> = fs::read_dir(store.state_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn test_list_and_delete_file_states() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        assert!(store.list_file_states().unwrap().is_empty());

        for id in ["EGAF2", "EGAF1"] {
            let mut spec = sample_spec();
            spec.file_id = id.into();
            store.save_file_state(&FileState::new(&spec, 256)).unwrap();
        }

        let states = store.list_file_states().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].file_id, "EGAF1");

        store.delete_file_state("EGAF1").unwrap();
        store.delete_file_state("EGAF1").unwrap(); // second delete is fine
        assert_eq!(store.list_file_states().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save_file_state(&FileState::new(&sample_spec(), 256)).unwrap();

        store.reset().unwrap();
        assert!(!store.state_root().exists());
        // Resetting a missing tree is not an error.
        store.reset().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = FileState::new(&sample_spec(), 256);
        store.save_file_state(&state).unwrap();

        let meta = fs::metadata(store.state_dir().join("EGAF00000000001.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
    }
}
