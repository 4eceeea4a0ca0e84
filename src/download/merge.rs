//! Merge part-files into the final output.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::chunk::ChunkDownloader;
use crate::error::Result;
use crate::state::ChunkState;

/// Concatenate the part-files of `chunks`, in index order, into
/// `output_path`. Writes to `<output>.tmp` first, fsyncs, then renames,
/// so a crash mid-merge never leaves a half-written output under the
/// final name. The temp file is removed on failure.
pub async fn merge_chunks(
    chunks_dir: &Path,
    output_path: &Path,
    chunks: &[ChunkState],
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp_path = tmp_path_for(output_path);
    debug!(output = %output_path.display(), chunks = chunks.len(), "merging chunks");

    let result = write_merged(chunks_dir, &tmp_path, output_path, chunks).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

async fn write_merged(
    chunks_dir: &Path,
    tmp_path: &Path,
    output_path: &Path,
    chunks: &[ChunkState],
) -> Result<()> {
    let out = File::create(tmp_path).await?;
    let mut writer = BufWriter::new(out);

    for chunk in chunks {
        let part = ChunkDownloader::chunk_path(chunks_dir, chunk.index);
        let mut src = File::open(&part).await?;
        tokio::io::copy(&mut src, &mut writer).await?;
    }

    // Flush the buffer before unwrapping it; into_inner drops anything
    // still buffered.
    writer.flush().await?;
    let out = writer.into_inner();
    out.sync_all().await?;
    drop(out);

    tokio::fs::rename(tmp_path, output_path).await?;
    Ok(())
}

fn tmp_path_for(output_path: &Path) -> PathBuf {
    let mut tmp = OsString::from(output_path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
