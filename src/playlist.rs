//! M3U export of expansion results.

use crate::config::write_atomic;
use anyhow::{Context, Result};
use log::{info, warn};
use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};

pub const M3U_HEADER: &str = "#EXTM3U";

/// Playlist text: the header, then one entry per line in the given order.
///
/// Entries containing a line break cannot be represented and are dropped.
#[must_use]
pub fn render_m3u(entries: &[String]) -> String {
    let mut out = String::from(M3U_HEADER);
    out.push('\n');
    for entry in entries {
        if entry.contains(['\n', '\r']) {
            warn!("Skipping playlist entry with a line break: {entry:?}");
            continue;
        }
        out.push_str(entry);
        out.push('\n');
    }
    out
}

/// Write `entries` as an M3U playlist at `path` and return the absolute path
/// written.
///
/// # Errors
///
/// Fails if the path cannot be resolved or the file cannot be written.
pub fn write_m3u(path: &Path, entries: &[String]) -> Result<PathBuf> {
    let absolute = path
        .absolutize()
        .with_context(|| format!("Failed to resolve playlist path {}", path.display()))?
        .into_owned();

    write_atomic(&absolute, render_m3u(entries).as_bytes())
        .with_context(|| format!("Failed to write playlist {}", absolute.display()))?;

    info!("Wrote {} entries to {}", entries.len(), absolute.display());
    Ok(absolute)
}
