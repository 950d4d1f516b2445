use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error};

/// Headroom kept free on the destination volume beyond the file itself.
pub const SAFETY_MARGIN_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error(
        "insufficient disk space at {}: required {required} bytes, available {available}",
        path.display()
    )]
    ResourceExhausted {
        required: u64,
        available: u64,
        path: PathBuf,
    },
    #[error("failed to query free space at {}: {source}", path.display())]
    Query {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait FreeSpace {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Space available to unprivileged writers on the volume holding `path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeFreeSpace;

impl FreeSpace for VolumeFreeSpace {
    fn available(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiskGuard<F = VolumeFreeSpace> {
    probe: F,
}

impl<F: FreeSpace> DiskGuard<F> {
    pub fn new(probe: F) -> Self {
        Self { probe }
    }

    pub fn ensure_free(&self, bytes_required: u64, path: &Path) -> Result<(), DiskError> {
        let available = self
            .probe
            .available(path)
            .map_err(|source| DiskError::Query {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(required = bytes_required, available, path = %path.display(), "disk check");
        if available < bytes_required {
            error!(
                required = bytes_required,
                available,
                path = %path.display(),
                "insufficient disk space remaining"
            );
            return Err(DiskError::ResourceExhausted {
                required: bytes_required,
                available,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Checks room for a file of `file_size` bytes plus [`SAFETY_MARGIN_BYTES`].
    pub fn ensure_room_for(&self, file_size: u64, path: &Path) -> Result<(), DiskError> {
        self.ensure_free(file_size.saturating_add(SAFETY_MARGIN_BYTES), path)
    }
}
