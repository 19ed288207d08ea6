use std::fs;
use std::path::Path;

use crate::errors::Result;
use crate::models::{DiffManifest, FileChecksumMap};
use crate::services::fingerprint;
use crate::utils::file::write_atomic;

/// Computes the add/remove delta that turns `old` into `new`.
///
/// Only the new snapshot is walked: a path absent from `old` lands in
/// `added`; a path whose checksum changed lands in `added` with the old
/// checksum recorded in `removed`. Paths present only in `old` (files deleted
/// between versions) are left uncaptured — already-published patch manifests
/// carry this behavior, so the applier treats absence of an entry as
/// leave-in-place.
pub fn diff(old: &FileChecksumMap, new: &FileChecksumMap) -> DiffManifest {
    let mut manifest = DiffManifest::default();
    for (path, checksum) in new {
        match old.get(path) {
            None => {
                manifest.added.insert(path.clone(), checksum.clone());
            }
            Some(previous) if previous != checksum => {
                manifest.added.insert(path.clone(), checksum.clone());
                manifest.removed.insert(path.clone(), previous.clone());
            }
            Some(_) => {}
        }
    }
    manifest
}

/// Offline generator convenience: fingerprint two package trees and diff
/// them.
pub fn diff_trees(old_root: &Path, new_root: &Path) -> Result<DiffManifest> {
    let old = fingerprint::fingerprint_tree(old_root)?;
    let new = fingerprint::fingerprint_tree(new_root)?;
    Ok(diff(&old, &new))
}

/// Writes the `{added, removed}` JSON artifact, UTF-8.
pub fn write_manifest(path: &Path, manifest: &DiffManifest) -> Result<()> {
    let payload = serde_json::to_vec_pretty(manifest)?;
    write_atomic(path, &payload)?;
    Ok(())
}

pub fn load_manifest(path: &Path) -> Result<DiffManifest> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
