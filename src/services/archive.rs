use std::fs::File;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use crate::errors::{LauncherError, Result};
use crate::utils::paths::is_safe_relative_path;

#[derive(Clone, Copy, Debug)]
pub struct UnzipProgress {
    pub unzipped_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

pub type UnzipObserver = dyn Fn(UnzipProgress) + Send + Sync;

/// Archive capability consumed by the install pipeline. Implementations are
/// blocking; callers run them on a worker thread.
pub trait ArchiveExtractor: Send + Sync {
    /// Full read pass over every entry; corrupt data fails here before the
    /// install directory is touched.
    fn validate(&self, archive: &Path) -> Result<()>;

    /// Extracts into `destination`, creating intermediate directories.
    /// Entries with absolute or parent-escaping paths are skipped.
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        on_progress: &(dyn Fn(UnzipProgress) + Send + Sync + '_),
    ) -> Result<()>;
}

pub struct ZipExtractor;

impl ZipExtractor {
    fn open(archive: &Path) -> Result<ZipArchive<File>> {
        let file = File::open(archive)?;
        ZipArchive::new(file)
            .map_err(|err| LauncherError::Archive(format!("{}: {}", archive.display(), err)))
    }
}

impl ArchiveExtractor for ZipExtractor {
    fn validate(&self, archive: &Path) -> Result<()> {
        let mut zip = Self::open(archive)?;
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|err| LauncherError::Archive(err.to_string()))?;
            // Reading to the end checks the stored CRC.
            io::copy(&mut entry, &mut io::sink()).map_err(|err| {
                LauncherError::Archive(format!("corrupt entry {}: {}", entry.name(), err))
            })?;
        }
        Ok(())
    }

    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        on_progress: &(dyn Fn(UnzipProgress) + Send + Sync + '_),
    ) -> Result<()> {
        let mut zip = Self::open(archive)?;

        let mut total_bytes = 0u64;
        for index in 0..zip.len() {
            let entry = zip
                .by_index(index)
                .map_err(|err| LauncherError::Archive(err.to_string()))?;
            total_bytes += entry.size();
        }

        let mut unzipped_bytes = 0u64;
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|err| LauncherError::Archive(err.to_string()))?;
            let name = entry.name().replace('\\', "/");
            if name.is_empty() {
                continue;
            }
            let entry_path = Path::new(&name);
            if !is_safe_relative_path(entry_path) {
                tracing::warn!("skipping unsafe archive entry: {}", name);
                continue;
            }

            let out_path = destination.join(entry_path);
            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&out_path)?;
            io::copy(&mut entry, &mut outfile).map_err(|err| {
                LauncherError::Archive(format!("corrupt entry {}: {}", name, err))
            })?;

            unzipped_bytes += entry.size();
            let percent = if total_bytes == 0 {
                100.0
            } else {
                (unzipped_bytes as f64 / total_bytes as f64) * 100.0
            };
            on_progress(UnzipProgress {
                unzipped_bytes,
                total_bytes,
                percent,
            });
        }

        Ok(())
    }
}
