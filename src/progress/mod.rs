//! Progress display for multi-file downloads.
//!
//! The engine never renders anything itself; it emits callbacks. This
//! module provides [`ProgressTracker`], a passive sink that maps those
//! callbacks onto a set of `indicatif` progress bars, one per file.

mod tracker;

pub use tracker::ProgressTracker;

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    match bytes {
        b if b >= TIB => format!("{:.1} TB", b as f64 / TIB as f64),
        b if b >= GIB => format!("{:.1} GB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KB", b as f64 / KIB as f64),
        b => format!("{b} B"),
    }
}
