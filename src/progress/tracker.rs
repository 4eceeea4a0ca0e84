//! Multi-file progress bar coordination.

use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str = "  {msg:30!} [{bar:25}] {bytes}/{total_bytes}";
const FINISHED_TEMPLATE: &str = "  {msg:30!} [{bar:25}] {total_bytes}";
const PROGRESS_CHARS: &str = "=> ";

/// Tracks and renders live download progress for multiple files.
///
/// Safe to call from concurrent download tasks; per-file calls arrive
/// serialized (the engine holds the file's mutex), calls across files do
/// not.
pub struct ProgressTracker {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressTracker {
    /// Create a tracker that draws to stderr.
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Create a tracker that draws nothing (quiet mode, non-TTY runs).
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Register a file for tracking. Must be called before any update for
    /// that file id.
    pub fn register_file(&self, file_id: &str, file_name: &str, total_bytes: u64) {
        let bar = self.multi.add(
            ProgressBar::new(total_bytes).with_style(bar_style(BAR_TEMPLATE)),
        );
        bar.set_message(file_name.to_string());
        self.bars
            .lock()
            .unwrap()
            .insert(file_id.to_string(), bar);
    }

    /// Update the live byte count for a file.
    pub fn update(&self, file_id: &str, bytes_downloaded: u64, total_bytes: u64) {
        if let Some(bar) = self.bars.lock().unwrap().get(file_id) {
            if bar.length() != Some(total_bytes) {
                bar.set_length(total_bytes);
            }
            bar.set_position(bytes_downloaded);
        }
    }

    /// Mark a file as actively downloading.
    pub fn file_started(&self, file_id: &str) {
        if let Some(bar) = self.bars.lock().unwrap().get(file_id) {
            bar.reset_elapsed();
        }
    }

    /// Mark a file as complete.
    pub fn file_completed(&self, file_id: &str) {
        if let Some(bar) = self.bars.lock().unwrap().get(file_id) {
            if let Some(len) = bar.length() {
                bar.set_position(len);
            }
            bar.set_style(bar_style(FINISHED_TEMPLATE));
            bar.finish();
        }
    }

    /// Mark a file as failed.
    pub fn file_failed(&self, file_id: &str) {
        if let Some(bar) = self.bars.lock().unwrap().get(file_id) {
            let name = bar.message();
            bar.abandon_with_message(format!("{name}  FAILED"));
        }
    }

    /// Mark a file as skipped (already complete on disk).
    pub fn file_skipped(&self, file_id: &str) {
        if let Some(bar) = self.bars.lock().unwrap().get(file_id) {
            if let Some(len) = bar.length() {
                bar.set_position(len);
            }
            let name = bar.message();
            bar.set_style(bar_style(FINISHED_TEMPLATE));
            bar.finish_with_message(format!("{name}  (skipped)"));
        }
    }

    /// Remove all bars from the terminal.
    pub fn clear(&self) {
        let _ = self.multi.clear();
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .expect("static progress template")
        .progress_chars(PROGRESS_CHARS)
}
