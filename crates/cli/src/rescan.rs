//! Subtree rescan after lost changes
//!
//! When a root is invalidated the watcher can no longer say what changed
//! under it, so the caller walks the tree again to rebuild its view.

use anyhow::Result;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// What a rescan found
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RescanSummary {
    pub files: usize,
    pub dirs: usize,
    /// Entries that could not be read
    pub skipped: usize,
}

/// Walk `root` and count what is there now
pub fn rescan(root: &Path) -> Result<RescanSummary> {
    if !root.exists() {
        anyhow::bail!("{} no longer exists", root.display());
    }

    let mut summary = RescanSummary::default();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Rescan skipped an entry under {}: {}", root.display(), e);
                summary.skipped += 1;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            summary.dirs += 1;
        } else {
            summary.files += 1;
        }
    }

    debug!(
        "Rescanned {}: {} files, {} dirs",
        root.display(),
        summary.files,
        summary.dirs
    );
    Ok(summary)
}
