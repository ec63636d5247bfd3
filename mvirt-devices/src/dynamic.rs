//! Dynamic device patterns.
//!
//! Other agents on the host may drop a file named after a device prefix into
//! the dynamic devices directory; each file `<name>` adds the wildcard
//! pattern `<name>+` to the tracked devices.

use std::io;
use std::path::Path;
use tracing::{debug, info};

/// Read wildcard patterns from the entries of `dir`.
///
/// A missing directory, or a path that is not a directory, yields no patterns.
/// Subdirectories are ignored.
pub fn read_dynamic_devices(dir: &Path) -> io::Result<Vec<String>> {
    let metadata = match std::fs::metadata(dir) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %dir.display(), "Dynamic device directory not found, skip");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    if !metadata.is_dir() {
        info!(path = %dir.display(), "Dynamic device path is not a directory, skip");
        return Ok(Vec::new());
    }

    let mut devices = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        devices.push(format!("{}+", entry.file_name().to_string_lossy()));
    }
    devices.sort();

    if !devices.is_empty() {
        debug!(path = %dir.display(), ?devices, "Read dynamic devices");
    }
    Ok(devices)
}
