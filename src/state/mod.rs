//! Durable download state.
//!
//! Everything the engine needs to survive a crash lives under
//! `<output>/.egafetch/`: the job manifest, one JSON snapshot per file,
//! and the numbered part-files of in-flight chunks. All JSON writes go
//! through the same atomic temp-file-and-rename path, so a reader never
//! observes a torn snapshot.

mod file_state;
mod store;

pub use file_state::{ChunkState, ChunkStatus, FileState, FileStatus};
pub use store::{FileSpec, Manifest, StateStore};
