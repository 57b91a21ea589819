/// Free-space probing for the capture folder's filesystem.
use std::path::{Path, PathBuf};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Point-in-time free-space reading, in whole megabytes.
///
/// Abstracted so the supervisor's poll loop can be driven by a scripted probe.
pub trait DiskProbe {
    fn free_mb(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads the space available to unprivileged users via `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl DiskProbe for FsProbe {
    fn free_mb(&self, path: &Path) -> std::io::Result<u64> {
        Ok(fs2::available_space(path)? / BYTES_PER_MB)
    }
}

#[derive(Debug)]
pub enum DiskError {
    /// Less free space than the configured minimum.
    Insufficient { required_mb: u64, free_mb: u64 },
    /// The free-space query itself failed.
    Query {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for DiskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskError::Insufficient {
                required_mb,
                free_mb,
            } => write!(
                f,
                "not enough disk space: need at least {required_mb} MB free, have {free_mb} MB"
            ),
            DiskError::Query { path, source } => {
                write!(
                    f,
                    "failed to query free space at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskError::Insufficient { .. } => None,
            DiskError::Query { source, .. } => Some(source),
        }
    }
}

/// Start-up check: ensure at least `required_mb` is free at `path` before launching.
///
/// Returns the free space observed.
pub fn preflight(probe: &dyn DiskProbe, path: &Path, required_mb: u64) -> Result<u64, DiskError> {
    tracing::info!(required_mb, "checking disk space requirements");
    let free_mb = probe.free_mb(path).map_err(|e| DiskError::Query {
        path: path.to_path_buf(),
        source: e,
    })?;
    if free_mb < required_mb {
        return Err(DiskError::Insufficient {
            required_mb,
            free_mb,
        });
    }
    tracing::info!(free_mb, required_mb, "enough free disk space");
    Ok(free_mb)
}
