//! Published frame snapshot
//!
//! Every frame the aggregate is written to a JSON file (an array of 36
//! numbers) for external consumers such as the calibration UI. The file is
//! replaced atomically: the frame goes into a temporary file in the same
//! directory, which is then renamed over the published path.

use crate::error::Result;
use crate::frame::FrameVector;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Atomically replace the snapshot at `path` with `frame`
pub fn write_snapshot(path: &Path, frame: &FrameVector) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, frame)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a snapshot; a missing or malformed file reads as all zeros
pub fn read_snapshot(path: &Path) -> FrameVector {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No snapshot at {}: {}", path.display(), e);
            return FrameVector::zero();
        }
    };
    serde_json::from_slice(&content).unwrap_or_else(|e| {
        debug!("Malformed snapshot at {}: {}", path.display(), e);
        FrameVector::zero()
    })
}
