use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::queries::GameInfoQueries;
use crate::db::Database;
use crate::errors::{LauncherError, Result};
use crate::models::{
    DiffManifest, GameInfo, InstallPatch, InstallStatus, LocalGameVersion, RemoteGameInfo,
};
use crate::services::archive::{ArchiveExtractor, UnzipProgress};
use crate::services::deeplink::DeeplinkRegistrar;
use crate::services::fingerprint;
use crate::utils::file::{remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::utils::paths::{is_safe_relative_path, patch_content_dir, patch_metadata_path};

/// Receives install-stage transitions and unzip byte progress as they happen.
pub type InstallObserver = dyn Fn(InstallPatch) + Send + Sync;

pub struct ApplyRequest {
    pub game_client_id: String,
    pub game: RemoteGameInfo,
    pub install_dir: PathBuf,
    pub payload_path: PathBuf,
    /// `None` for full packages, which replace the whole directory content.
    pub manifest: Option<DiffManifest>,
    pub internal_version: u32,
    pub is_full_package: bool,
}

/// Applies one downloaded resource against a live install: unzip, validate,
/// remove, add, record the new version, register the deep link.
#[derive(Clone)]
pub struct InstallApplier {
    db: Database,
    extractor: Arc<dyn ArchiveExtractor>,
    deeplinks: Arc<dyn DeeplinkRegistrar>,
}

impl InstallApplier {
    pub fn new(
        db: Database,
        extractor: Arc<dyn ArchiveExtractor>,
        deeplinks: Arc<dyn DeeplinkRegistrar>,
    ) -> Self {
        Self {
            db,
            extractor,
            deeplinks,
        }
    }

    pub async fn apply(&self, request: ApplyRequest, observer: Arc<InstallObserver>) -> Result<()> {
        let applier = self.clone();
        tokio::task::spawn_blocking(move || applier.apply_blocking(&request, observer.as_ref()))
            .await
            .map_err(|err| LauncherError::Config(format!("install worker failed: {err}")))?
    }

    /// Synchronous body; every failure leaves the matching failure status on
    /// the observer before returning.
    pub fn apply_blocking(&self, request: &ApplyRequest, observer: &InstallObserver) -> Result<()> {
        let result = if request.is_full_package {
            self.apply_full(request, observer)
        } else {
            self.apply_incremental(request, observer)
        };
        if let Err(err) = &result {
            tracing::error!(
                "patch apply failed game={} version={} error={}",
                request.game_client_id,
                request.internal_version,
                err
            );
        }
        result
    }

    fn apply_incremental(&self, request: &ApplyRequest, observer: &InstallObserver) -> Result<()> {
        let report = |status: InstallStatus| {
            observer(InstallPatch {
                status: Some(status),
                ..InstallPatch::default()
            })
        };
        let manifest = request.manifest.as_ref().ok_or_else(|| {
            LauncherError::Config("incremental patch without a diff manifest".to_string())
        })?;

        let staging = patch_content_dir(&request.install_dir);
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)?;

        report(InstallStatus::Unzipping);
        let unzip = self
            .extractor
            .extract(&request.payload_path, &staging, &|progress: UnzipProgress| {
                observer(InstallPatch {
                    unzipped_bytes: Some(progress.unzipped_bytes),
                    total_bytes: Some(progress.total_bytes),
                    percent: Some(progress.percent),
                    status: None,
                })
            });
        if let Err(err) = unzip {
            report(InstallStatus::UnzipFailed);
            return Err(err);
        }
        report(InstallStatus::UnzipSucceeded);

        let staged = match fingerprint::fingerprint_tree(&staging) {
            Ok(map) => map,
            Err(err) => {
                report(InstallStatus::InvalidFile);
                return Err(err);
            }
        };
        let valid = manifest
            .added
            .iter()
            .all(|(path, checksum)| staged.get(path) == Some(checksum));
        if !valid {
            report(InstallStatus::InvalidFile);
            return Err(LauncherError::Archive(
                "patch content does not match its manifest".to_string(),
            ));
        }
        report(InstallStatus::ValidFile);

        report(InstallStatus::RemovingFiles);
        if let Err(err) = remove_manifest_paths(&request.install_dir, manifest) {
            report(InstallStatus::RemovingFilesFailed);
            return Err(err);
        }

        report(InstallStatus::AddingFiles);
        if let Err(err) = add_staged_paths(&request.install_dir, &staging, manifest) {
            report(InstallStatus::AddingFilesFailed);
            return Err(err);
        }

        write_atomic(
            &patch_metadata_path(&request.install_dir),
            &serde_json::to_vec_pretty(manifest)?,
        )?;
        self.record_version(request)?;
        report(InstallStatus::GameInfoSet);

        self.deeplinks.register(
            &request.game_client_id,
            &request.game.deeplink_protocol,
            &request.install_dir.join(&request.game.runnable_path),
        )?;
        report(InstallStatus::DeeplinkRegistered);

        remove_dir_if_exists(&staging)?;
        remove_file_if_exists(&request.payload_path)?;
        Ok(())
    }

    fn apply_full(&self, request: &ApplyRequest, observer: &InstallObserver) -> Result<()> {
        let report = |status: InstallStatus| {
            observer(InstallPatch {
                status: Some(status),
                ..InstallPatch::default()
            })
        };

        fs::create_dir_all(&request.install_dir)?;
        report(InstallStatus::Unzipping);
        let unzip = self.extractor.extract(
            &request.payload_path,
            &request.install_dir,
            &|progress: UnzipProgress| {
                observer(InstallPatch {
                    unzipped_bytes: Some(progress.unzipped_bytes),
                    total_bytes: Some(progress.total_bytes),
                    percent: Some(progress.percent),
                    status: None,
                })
            },
        );
        if let Err(err) = unzip {
            report(InstallStatus::UnzipFailed);
            return Err(err);
        }
        report(InstallStatus::UnzipSucceeded);
        // Every entry's CRC was checked while extracting; there is no
        // manifest to compare a full package against.
        report(InstallStatus::ValidFile);

        // A full package supersedes whatever patch history preceded it.
        remove_file_if_exists(&patch_metadata_path(&request.install_dir))?;
        self.record_version(request)?;
        report(InstallStatus::GameInfoSet);

        self.deeplinks.register(
            &request.game_client_id,
            &request.game.deeplink_protocol,
            &request.install_dir.join(&request.game.runnable_path),
        )?;
        report(InstallStatus::DeeplinkRegistered);

        remove_dir_if_exists(&patch_content_dir(&request.install_dir))?;
        remove_file_if_exists(&request.payload_path)?;
        Ok(())
    }

    fn record_version(&self, request: &ApplyRequest) -> Result<()> {
        self.db.set_game_info(
            &request.game_client_id,
            &GameInfo {
                runnable_path: request.game.runnable_path.clone(),
                root_folder_path: request.install_dir.to_string_lossy().to_string(),
                internal_version: LocalGameVersion::Version(request.internal_version),
            },
        )
    }
}

fn remove_manifest_paths(install_dir: &Path, manifest: &DiffManifest) -> Result<()> {
    for path in manifest.removed.keys() {
        let relative = Path::new(path);
        if !is_safe_relative_path(relative) {
            return Err(LauncherError::Config(format!(
                "unsafe path in manifest: {}",
                path
            )));
        }
        remove_file_if_exists(&install_dir.join(relative))?;
    }
    Ok(())
}

fn add_staged_paths(install_dir: &Path, staging: &Path, manifest: &DiffManifest) -> Result<()> {
    for path in manifest.added.keys() {
        let relative = Path::new(path);
        if !is_safe_relative_path(relative) {
            return Err(LauncherError::Config(format!(
                "unsafe path in manifest: {}",
                path
            )));
        }
        let source = staging.join(relative);
        let target = install_dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_file_if_exists(&target)?;
        if fs::rename(&source, &target).is_err() {
            fs::copy(&source, &target)?;
            remove_file_if_exists(&source)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::SettingsQueries;
    use crate::services::archive::ZipExtractor;
    use crate::services::deeplink::SettingsDeeplinkRegistrar;
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Mutex;
    use uuid::Uuid;
    use zip::write::FileOptions;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("levelup-applier-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn test_db() -> Database {
        let db = Database::in_memory().expect("open in-memory database");
        db.run_migrations().expect("run migrations");
        db
    }

    fn applier(db: &Database) -> InstallApplier {
        InstallApplier::new(
            db.clone(),
            Arc::new(ZipExtractor),
            Arc::new(SettingsDeeplinkRegistrar::new(db.clone())),
        )
    }

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).expect("create archive file");
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .expect("start entry");
            writer.write_all(contents).expect("write entry");
        }
        writer.finish().expect("finish archive");
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn game() -> RemoteGameInfo {
        RemoteGameInfo {
            id: "rf4".to_string(),
            title: "Raid Force 4".to_string(),
            runnable_path: "bin/game.exe".to_string(),
            deeplink_protocol: "levelup-rf4".to_string(),
        }
    }

    fn collecting_observer() -> (Arc<Mutex<Vec<InstallStatus>>>, Box<InstallObserver>) {
        let statuses: Arc<Mutex<Vec<InstallStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let observer = Box::new(move |patch: InstallPatch| {
            if let Some(status) = patch.status {
                sink.lock().expect("status lock").push(status);
            }
        });
        (statuses, observer)
    }

    #[test]
    fn incremental_patch_walks_the_full_status_ladder() {
        let db = test_db();
        let install_dir = scratch_dir();
        fs::write(install_dir.join("a.txt"), b"old a").expect("seed a.txt");
        fs::write(install_dir.join("keep.txt"), b"untouched").expect("seed keep.txt");

        let payload = install_dir.join("patch-5.zip");
        build_zip(
            &payload,
            &[("a.txt", b"new a".as_slice()), ("data/b.txt", b"new b".as_slice())],
        );

        let mut added = BTreeMap::new();
        added.insert("a.txt".to_string(), sha256_hex(b"new a"));
        added.insert("data/b.txt".to_string(), sha256_hex(b"new b"));
        let mut removed = BTreeMap::new();
        removed.insert("a.txt".to_string(), sha256_hex(b"old a"));
        // Also a path that is already absent: removal must tolerate it.
        removed.insert("gone.txt".to_string(), sha256_hex(b"whatever"));
        let manifest = DiffManifest { added, removed };

        let request = ApplyRequest {
            game_client_id: "rf4".to_string(),
            game: game(),
            install_dir: install_dir.clone(),
            payload_path: payload.clone(),
            manifest: Some(manifest.clone()),
            internal_version: 5,
            is_full_package: false,
        };

        let (statuses, observer) = collecting_observer();
        applier(&db)
            .apply_blocking(&request, observer.as_ref())
            .expect("apply patch");

        assert_eq!(
            statuses.lock().expect("status lock").as_slice(),
            [
                InstallStatus::Unzipping,
                InstallStatus::UnzipSucceeded,
                InstallStatus::ValidFile,
                InstallStatus::RemovingFiles,
                InstallStatus::AddingFiles,
                InstallStatus::GameInfoSet,
                InstallStatus::DeeplinkRegistered,
            ]
        );

        assert_eq!(fs::read(install_dir.join("a.txt")).expect("read a"), b"new a");
        assert_eq!(
            fs::read(install_dir.join("data/b.txt")).expect("read b"),
            b"new b"
        );
        assert_eq!(
            fs::read(install_dir.join("keep.txt")).expect("read keep"),
            b"untouched"
        );

        let recorded = crate::services::snapshot_diff::load_manifest(&patch_metadata_path(
            &install_dir,
        ))
        .expect("load recorded manifest");
        assert_eq!(recorded, manifest);

        let info = db.get_game_info("rf4").expect("query").expect("present");
        assert_eq!(info.internal_version, LocalGameVersion::Version(5));
        assert!(db
            .get_setting("deeplink.levelup-rf4")
            .expect("query setting")
            .is_some());

        assert!(!patch_content_dir(&install_dir).exists());
        assert!(!payload.exists());
    }

    #[test]
    fn mismatched_content_is_rejected_before_touching_the_install() {
        let db = test_db();
        let install_dir = scratch_dir();
        fs::write(install_dir.join("a.txt"), b"old a").expect("seed a.txt");

        let payload = install_dir.join("patch-5.zip");
        build_zip(&payload, &[("a.txt", b"tampered".as_slice())]);

        let mut added = BTreeMap::new();
        added.insert("a.txt".to_string(), sha256_hex(b"expected content"));
        let manifest = DiffManifest {
            added,
            removed: BTreeMap::new(),
        };

        let request = ApplyRequest {
            game_client_id: "rf4".to_string(),
            game: game(),
            install_dir: install_dir.clone(),
            payload_path: payload,
            manifest: Some(manifest),
            internal_version: 5,
            is_full_package: false,
        };

        let (statuses, observer) = collecting_observer();
        let result = applier(&db).apply_blocking(&request, observer.as_ref());
        assert!(result.is_err());
        assert_eq!(
            statuses.lock().expect("status lock").last(),
            Some(&InstallStatus::InvalidFile)
        );

        // The live install was never touched.
        assert_eq!(fs::read(install_dir.join("a.txt")).expect("read a"), b"old a");
        assert!(db.get_game_info("rf4").expect("query").is_none());
    }

    #[test]
    fn full_package_replaces_directory_content_without_a_manifest() {
        let db = test_db();
        let install_dir = scratch_dir();
        let payload_dir = patch_content_dir(&install_dir);
        fs::create_dir_all(payload_dir.parent().expect("patch dir")).expect("create patch dir");
        let payload = install_dir.join(".levelup-patch/full-1.zip");
        build_zip(
            &payload,
            &[
                ("bin/game.exe", b"exe".as_slice()),
                ("data/levels.pak", b"levels".as_slice()),
            ],
        );

        let request = ApplyRequest {
            game_client_id: "rf4".to_string(),
            game: game(),
            install_dir: install_dir.clone(),
            payload_path: payload.clone(),
            manifest: None,
            internal_version: 1,
            is_full_package: true,
        };

        let (statuses, observer) = collecting_observer();
        applier(&db)
            .apply_blocking(&request, observer.as_ref())
            .expect("apply full package");

        assert_eq!(
            statuses.lock().expect("status lock").as_slice(),
            [
                InstallStatus::Unzipping,
                InstallStatus::UnzipSucceeded,
                InstallStatus::ValidFile,
                InstallStatus::GameInfoSet,
                InstallStatus::DeeplinkRegistered,
            ]
        );
        assert!(install_dir.join("bin/game.exe").exists());
        assert!(install_dir.join("data/levels.pak").exists());
        let info = db.get_game_info("rf4").expect("query").expect("present");
        assert_eq!(info.internal_version, LocalGameVersion::Version(1));
        assert!(!payload.exists());
    }
}
