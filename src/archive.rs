//! Archive extraction
//!
//! The decoder is chosen from the file name alone: `.zip`, `.tar.gz`/`.tgz`
//! and `.tar.bz2`/`.tbz`. Anything else is rejected, never ignored.

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ExtractionError;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    /// Select the format from the file name suffix
    pub fn from_path(path: &Path) -> Result<Self, ExtractionError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz") {
            Ok(Self::TarBz2)
        } else {
            Err(ExtractionError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
        }
    }
}

/// Unpack `file` into `target_dir`, returning the directory it was unpacked into.
///
/// With `derive_subdir`, the archive goes into `target_dir/<file name minus
/// its final extension>` instead. The destination is created if needed; an
/// existing non-directory at that path is an error.
pub fn extract(
    file: &Path,
    target_dir: &Path,
    derive_subdir: bool,
) -> Result<PathBuf, ExtractionError> {
    let format = ArchiveFormat::from_path(file)?;

    let dest = match file.file_stem() {
        Some(stem) if derive_subdir => target_dir.join(stem),
        _ => target_dir.to_path_buf(),
    };
    prepare_dir(&dest)?;

    debug!("Extracting {} as {:?}", file.display(), format);
    let io_failure = |source: std::io::Error| ExtractionError::IoFailure {
        path: file.to_path_buf(),
        source,
    };

    let archive = File::open(file).map_err(io_failure)?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(archive).map_err(|e| io_failure(e.into()))?;
            zip.extract(&dest).map_err(|e| io_failure(e.into()))?;
        }
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(archive), &dest).map_err(io_failure)?,
        ArchiveFormat::TarBz2 => unpack_tar(BzDecoder::new(archive), &dest).map_err(io_failure)?,
    }

    info!(
        "Extracted file: {} -> {}",
        file.display(),
        dest.display()
    );
    Ok(dest)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}

fn prepare_dir(dest: &Path) -> Result<(), ExtractionError> {
    if dest.exists() && !dest.is_dir() {
        return Err(ExtractionError::NotADirectory {
            path: dest.to_path_buf(),
        });
    }
    fs::create_dir_all(dest).map_err(|source| ExtractionError::IoFailure {
        path: dest.to_path_buf(),
        source,
    })
}
