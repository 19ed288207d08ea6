use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{LauncherError, Result};
use crate::models::FileChecksumMap;
use crate::utils::file::write_atomic;

/// Computes a content checksum for every regular file under `root`, keyed by
/// the file's root-relative path with `/` separators.
///
/// Directories are not entries. Any unreadable file or directory fails the
/// whole operation; downstream planning cannot work with partial maps.
pub fn fingerprint_tree(root: &Path) -> Result<FileChecksumMap> {
    let mut map = BTreeMap::new();
    walk(root, root, &mut map)?;
    Ok(map)
}

/// `fingerprint_tree` on a blocking worker, for use from async pipelines.
pub async fn snapshot_tree(root: PathBuf) -> Result<FileChecksumMap> {
    tokio::task::spawn_blocking(move || fingerprint_tree(&root))
        .await
        .map_err(|err| LauncherError::Config(format!("fingerprint worker failed: {err}")))?
}

fn walk(root: &Path, dir: &Path, map: &mut FileChecksumMap) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            walk(root, &path, map)?;
        } else if file_type.is_file() {
            map.insert(relative_key(root, &path)?, hash_file(&path)?);
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        LauncherError::Config(format!("{} is outside the tree root", path.display()))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}

/// SHA-256 over the full file content, lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes the offline snapshot artifact: a JSON object mapping relative path
/// to hex checksum, UTF-8.
pub fn write_snapshot(path: &Path, map: &FileChecksumMap) -> Result<()> {
    let payload = serde_json::to_vec_pretty(map)?;
    write_atomic(path, &payload)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<FileChecksumMap> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
