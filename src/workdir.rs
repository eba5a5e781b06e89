//! Per-run scratch directories

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{CleanupError, SetupError};

/// An exclusively owned scratch directory with a random suffix.
///
/// It is not removed on drop: the owner calls [`WorkingDirectory::destroy`]
/// exactly once so that a failed removal can be reported.
#[derive(Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
}

impl WorkingDirectory {
    /// Create `<base_dir>/<prefix><random>`; `base_dir` must already exist
    pub fn create(base_dir: &Path, prefix: &str) -> Result<Self, SetupError> {
        if !base_dir.is_dir() {
            return Err(SetupError::BaseMissing(base_dir.to_path_buf()));
        }

        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .rand_bytes(5)
            .keep(true)
            .tempdir_in(base_dir)
            .map_err(|source| SetupError::Create {
                path: base_dir.to_path_buf(),
                source,
            })?;

        let path = dir.path().to_path_buf();
        debug!("Created working directory {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively remove the directory
    pub fn destroy(self) -> Result<(), CleanupError> {
        std::fs::remove_dir_all(&self.path).map_err(|source| CleanupError {
            path: self.path.clone(),
            source,
        })?;
        info!(
            "Removed temporary data in working directory {}",
            self.path.display()
        );
        Ok(())
    }
}
