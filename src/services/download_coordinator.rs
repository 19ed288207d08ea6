use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sysinfo::Disks;
use tokio::sync::watch;
use uuid::Uuid;

use crate::db::queries::{DownloadStateQueries, GameInfoQueries};
use crate::db::Database;
use crate::errors::{LauncherError, Result};
use crate::models::{
    apply_install_patch, apply_transfer_patch, DownloadInitInfo, DownloadProgressInfo,
    DownloadProgressItem, DownloadStatus, GameUpdateResource, InstallPatch, InstallStatus,
    InterruptReason, TransferPatch,
};
use crate::services::archive::ArchiveExtractor;
use crate::services::deeplink::DeeplinkRegistrar;
use crate::services::install_applier::{ApplyRequest, InstallApplier, InstallObserver};
use crate::services::notify::ProgressSink;
use crate::services::patch_planner::{self, UpdatePlan};
use crate::services::snapshot_diff;
use crate::services::transport::{
    TransferControl, TransferObserver, TransferUpdate, Transport,
};
use crate::utils::file::dir_size;
use crate::utils::paths::{metadata_download_path, patch_dir, payload_path};

const DEFAULT_STORAGE_SAFETY_MARGIN_BYTES: u64 = 256 * 1024 * 1024;
const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// What `start` decided to do. Planning outcomes are signals, not errors; the
/// renderer turns them into the matching dialog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A pipeline for this game already exists; the call was a no-op.
    AlreadyActive,
    UpToDate,
    /// No patch path exists (legacy install, or no published full package).
    NotUpdatable,
}

struct ActiveDownload {
    progress: DownloadProgressInfo,
    control: watch::Sender<TransferControl>,
    task_running: bool,
}

/// Process-owned store of active pipelines, one entry per game at most.
/// Constructed by the embedding application and injected into the
/// coordinator.
#[derive(Clone, Default)]
pub struct DownloadRegistry {
    entries: Arc<Mutex<HashMap<String, ActiveDownload>>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveDownload>>> {
        self.entries
            .lock()
            .map_err(|_| LauncherError::Config("download registry lock poisoned".to_string()))
    }

    pub fn snapshot(&self, game_client_id: &str) -> Result<Option<DownloadProgressInfo>> {
        Ok(self
            .lock()?
            .get(game_client_id)
            .map(|entry| entry.progress.clone()))
    }

    pub fn active_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// Drives every game's download+install pipeline: strict per-game sequencing
/// of planned resources, two sub-state machines per resource, cooperative
/// pause/resume/cancel, explicit retry, and persisted snapshots for crash
/// recovery. Pipelines of different games run independently.
#[derive(Clone)]
pub struct DownloadCoordinator {
    db: Database,
    transport: Arc<dyn Transport>,
    applier: InstallApplier,
    sink: Arc<dyn ProgressSink>,
    registry: DownloadRegistry,
}

impl DownloadCoordinator {
    pub fn new(
        db: Database,
        transport: Arc<dyn Transport>,
        extractor: Arc<dyn ArchiveExtractor>,
        deeplinks: Arc<dyn DeeplinkRegistrar>,
        sink: Arc<dyn ProgressSink>,
        registry: DownloadRegistry,
    ) -> Self {
        let applier = InstallApplier::new(db.clone(), extractor, deeplinks);
        Self {
            db,
            transport,
            applier,
            sink,
            registry,
        }
    }

    pub async fn start(
        &self,
        game_client_id: &str,
        init_info: DownloadInitInfo,
    ) -> Result<StartOutcome> {
        if self.registry.lock()?.contains_key(game_client_id) {
            tracing::info!(
                "download already active for {}, ignoring start",
                game_client_id
            );
            return Ok(StartOutcome::AlreadyActive);
        }

        let local_version = self
            .db
            .get_game_info(game_client_id)?
            .map(|info| info.internal_version);
        let resources =
            match patch_planner::plan(local_version, &init_info.update_info.resources) {
                UpdatePlan::UpToDate => {
                    tracing::info!("{} is already up to date", game_client_id);
                    return Ok(StartOutcome::UpToDate);
                }
                UpdatePlan::NotUpdatable => {
                    tracing::warn!(
                        "{} has no patch path (local version {:?})",
                        game_client_id,
                        local_version
                    );
                    return Ok(StartOutcome::NotUpdatable);
                }
                UpdatePlan::Apply(resources) => resources,
            };

        let items: Vec<DownloadProgressItem> =
            resources.iter().map(DownloadProgressItem::seeded).collect();
        let progress = DownloadProgressInfo {
            pipeline_id: Uuid::new_v4().to_string(),
            game_client_id: game_client_id.to_string(),
            init_info,
            items,
            current_download_index: 0,
        };

        let (control_tx, control_rx) = watch::channel(TransferControl::Running);
        {
            let mut guard = self.registry.lock()?;
            if guard.contains_key(game_client_id) {
                return Ok(StartOutcome::AlreadyActive);
            }
            guard.insert(
                game_client_id.to_string(),
                ActiveDownload {
                    progress: progress.clone(),
                    control: control_tx,
                    task_running: true,
                },
            );
        }
        self.db.save_download_state(&progress)?;
        self.sink.publish(&progress);
        tracing::info!(
            "download pipeline started game={} resources={} target_version={:?} pipeline={}",
            game_client_id,
            progress.items.len(),
            progress.init_info.update_info.latest_internal_version(),
            progress.pipeline_id
        );

        self.spawn_pipeline(game_client_id.to_string(), control_rx);
        Ok(StartOutcome::Started)
    }

    /// Valid only while the current item's transfer is progressing.
    pub async fn pause(&self, game_client_id: &str) -> Result<()> {
        let snapshot = self.with_entry(game_client_id, |entry| {
            let index = entry.progress.current_download_index;
            let Some(item) = entry.progress.items.get_mut(index) else {
                return None;
            };
            if item.download.status != DownloadStatus::Progressing || item.download.is_paused {
                return None;
            }
            let _ = entry.control.send(TransferControl::Paused);
            item.download = apply_transfer_patch(
                &item.download,
                &TransferPatch {
                    is_paused: Some(true),
                    bytes_per_second: Some(0),
                    ..TransferPatch::default()
                },
            );
            Some(entry.progress.clone())
        })?;

        match snapshot {
            None => Err(LauncherError::NotFound("no active download".to_string())),
            Some(None) => Err(LauncherError::Config(
                "pause is only valid while a transfer is progressing".to_string(),
            )),
            Some(Some(snapshot)) => {
                self.db.save_download_state(&snapshot)?;
                self.sink.publish(&snapshot);
                Ok(())
            }
        }
    }

    pub async fn resume(&self, game_client_id: &str) -> Result<()> {
        let snapshot = self.with_entry(game_client_id, |entry| {
            let index = entry.progress.current_download_index;
            let Some(item) = entry.progress.items.get_mut(index) else {
                return None;
            };
            if item.download.status != DownloadStatus::Progressing || !item.download.is_paused {
                return None;
            }
            let _ = entry.control.send(TransferControl::Running);
            item.download = apply_transfer_patch(
                &item.download,
                &TransferPatch {
                    is_paused: Some(false),
                    ..TransferPatch::default()
                },
            );
            Some(entry.progress.clone())
        })?;

        match snapshot {
            None => Err(LauncherError::NotFound("no active download".to_string())),
            Some(None) => Err(LauncherError::Config(
                "resume is only valid while a transfer is paused".to_string(),
            )),
            Some(Some(snapshot)) => {
                self.db.save_download_state(&snapshot)?;
                self.sink.publish(&snapshot);
                Ok(())
            }
        }
    }

    /// Idempotent: cancelling a game with no active pipeline is a no-op.
    /// Halts the transfer, marks non-terminal items cancelled, deletes the
    /// partial content on disk (the whole target directory for a full
    /// package, the patch working folder otherwise), removes the entry, and
    /// notifies observers.
    pub async fn cancel(&self, game_client_id: &str) -> Result<()> {
        let removed = { self.registry.lock()?.remove(game_client_id) };
        let Some(mut entry) = removed else {
            tracing::debug!("cancel ignored for {}: no active download", game_client_id);
            return Ok(());
        };

        let _ = entry.control.send(TransferControl::Cancelled);

        for item in &mut entry.progress.items {
            if !item.install.status.is_terminal_success() {
                item.download = apply_transfer_patch(
                    &item.download,
                    &TransferPatch {
                        status: Some(DownloadStatus::Cancelled),
                        bytes_per_second: Some(0),
                        ..TransferPatch::default()
                    },
                );
            }
        }

        let target_dir = entry.progress.init_info.target_dir.clone();
        let full_package = entry
            .progress
            .current_item()
            .map(|item| item.is_full_package)
            .unwrap_or(false);
        let cleanup_dir = if full_package {
            target_dir
        } else {
            patch_dir(&target_dir)
        };
        let reclaimed = dir_size(&cleanup_dir).unwrap_or(0);
        if let Err(err) = tokio::fs::remove_dir_all(&cleanup_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "cleanup after cancel failed for {}: {}",
                    cleanup_dir.display(),
                    err
                );
            }
        }

        self.db.clear_download_state(game_client_id)?;
        self.sink.publish(&entry.progress);
        tracing::info!(
            "download cancelled game={} reclaimed={} bytes",
            game_client_id,
            reclaimed
        );
        Ok(())
    }

    /// Re-attempts the current item after an interrupted transfer or a failed
    /// install stage. Does not replan; a suspect payload (failed unzip or
    /// validation) is fetched again, filesystem failures rerun the applier on
    /// the already-staged content.
    pub async fn retry(&self, game_client_id: &str) -> Result<()> {
        let prepared = self.with_entry(game_client_id, |entry| {
            if entry.task_running {
                return None;
            }
            let target_dir = entry.progress.init_info.target_dir.clone();
            let index = entry.progress.current_download_index;
            let Some(item) = entry.progress.items.get_mut(index) else {
                return None;
            };

            let payload = payload_path(&target_dir, item.internal_version, item.is_full_package);
            let mut drop_payload = false;
            if item.install.status.is_failure() {
                match item.install.status {
                    InstallStatus::UnzipFailed | InstallStatus::InvalidFile => {
                        drop_payload = true;
                        item.download = apply_transfer_patch(
                            &item.download,
                            &TransferPatch {
                                status: Some(DownloadStatus::Initializing),
                                transferred_bytes: Some(0),
                                bytes_per_second: Some(0),
                                ..TransferPatch::default()
                            },
                        );
                        item.install = apply_install_patch(
                            &item.install,
                            &InstallPatch {
                                status: Some(InstallStatus::Downloading),
                                unzipped_bytes: Some(0),
                                percent: Some(0.0),
                                ..InstallPatch::default()
                            },
                        );
                    }
                    _ => {
                        item.install = apply_install_patch(
                            &item.install,
                            &InstallPatch {
                                status: Some(InstallStatus::Downloaded),
                                ..InstallPatch::default()
                            },
                        );
                    }
                }
            } else if item.download.status == DownloadStatus::Interrupted {
                item.download = apply_transfer_patch(
                    &item.download,
                    &TransferPatch {
                        status: Some(DownloadStatus::Initializing),
                        bytes_per_second: Some(0),
                        ..TransferPatch::default()
                    },
                );
            } else {
                return None;
            }

            let (control_tx, control_rx) = watch::channel(TransferControl::Running);
            entry.control = control_tx;
            entry.task_running = true;
            Some((entry.progress.clone(), control_rx, drop_payload, payload))
        })?;

        let Some(inner) = prepared else {
            return Err(LauncherError::NotFound("no active download".to_string()));
        };
        let Some((snapshot, control_rx, drop_payload, payload)) = inner else {
            return Err(LauncherError::Config(
                "retry is only valid after an interrupted or failed item".to_string(),
            ));
        };

        if drop_payload {
            let _ = tokio::fs::remove_file(&payload).await;
        }
        self.db.save_download_state(&snapshot)?;
        self.sink.publish(&snapshot);
        tracing::info!(
            "retrying download game={} item={}",
            game_client_id,
            snapshot.current_download_index
        );
        self.spawn_pipeline(game_client_id.to_string(), control_rx);
        Ok(())
    }

    pub fn get_progress(&self, game_client_id: &str) -> Result<Option<DownloadProgressInfo>> {
        self.registry.snapshot(game_client_id)
    }

    /// Reloads persisted pipeline snapshots after a crash. Restored entries
    /// sit interrupted in the registry awaiting an explicit retry; nothing is
    /// re-downloaded automatically. Returns how many entries were restored.
    pub fn restore(&self) -> Result<usize> {
        let states = self.db.list_download_states()?;
        let mut restored = 0;
        for mut progress in states {
            if self.registry.lock()?.contains_key(&progress.game_client_id) {
                continue;
            }
            if progress.is_finished() {
                self.db.clear_download_state(&progress.game_client_id)?;
                continue;
            }

            let index = progress.current_download_index;
            if let Some(item) = progress.items.get_mut(index) {
                if matches!(
                    item.download.status,
                    DownloadStatus::Initializing | DownloadStatus::Progressing
                ) {
                    item.download = apply_transfer_patch(
                        &item.download,
                        &TransferPatch {
                            status: Some(DownloadStatus::Interrupted),
                            bytes_per_second: Some(0),
                            is_paused: Some(false),
                            interrupt_reason: Some(InterruptReason::Unknown),
                            ..TransferPatch::default()
                        },
                    );
                }
            }

            let (control_tx, _control_rx) = watch::channel(TransferControl::Running);
            let game_client_id = progress.game_client_id.clone();
            self.registry.lock()?.insert(
                game_client_id.clone(),
                ActiveDownload {
                    progress: progress.clone(),
                    control: control_tx,
                    task_running: false,
                },
            );
            self.db.save_download_state(&progress)?;
            self.sink.publish(&progress);
            tracing::info!("restored interrupted download game={}", game_client_id);
            restored += 1;
        }
        Ok(restored)
    }

    fn spawn_pipeline(&self, game_client_id: String, control_rx: watch::Receiver<TransferControl>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match coordinator.run_pipeline(&game_client_id, control_rx).await {
                Ok(()) => {}
                Err(LauncherError::Cancelled) => {
                    tracing::info!("download pipeline cancelled game={}", game_client_id);
                }
                Err(err) => {
                    // The failure is already recorded on the item; the entry
                    // stays registered so the user can retry.
                    tracing::error!(
                        "download pipeline halted game={} error={}",
                        game_client_id,
                        err
                    );
                    if let Ok(mut guard) = coordinator.registry.entries.lock() {
                        if let Some(entry) = guard.get_mut(&game_client_id) {
                            entry.task_running = false;
                        }
                    }
                }
            }
        });
    }

    async fn run_pipeline(
        &self,
        game_client_id: &str,
        mut control_rx: watch::Receiver<TransferControl>,
    ) -> Result<()> {
        loop {
            let Some(snapshot) = self.registry.snapshot(game_client_id)? else {
                return Err(LauncherError::Cancelled);
            };
            let index = snapshot.current_download_index;
            let Some(item) = snapshot.items.get(index).cloned() else {
                break;
            };

            if !item.install.status.is_terminal_success() {
                let resource = snapshot
                    .init_info
                    .update_info
                    .resources
                    .iter()
                    .find(|resource| resource.internal_version == item.internal_version)
                    .cloned()
                    .ok_or_else(|| {
                        LauncherError::Config(format!(
                            "resource {} missing from update info",
                            item.internal_version
                        ))
                    })?;

                if item.download.status != DownloadStatus::Completed {
                    self.run_download_stage(
                        game_client_id,
                        index,
                        &item,
                        &snapshot.init_info,
                        &resource,
                        &mut control_rx,
                    )
                    .await?;
                }
                self.run_install_stage(game_client_id, index, &snapshot.init_info, &resource)
                    .await?;
            }

            // Only a fully terminal item unlocks the next resource; each
            // incremental manifest assumes its predecessor's end state.
            let advanced = self.with_entry(game_client_id, |entry| {
                if entry.progress.current_download_index + 1 < entry.progress.items.len() {
                    entry.progress.current_download_index += 1;
                    (true, entry.progress.clone())
                } else {
                    (false, entry.progress.clone())
                }
            })?;
            let Some((more, snapshot)) = advanced else {
                return Err(LauncherError::Cancelled);
            };
            self.db.save_download_state(&snapshot)?;
            self.sink.publish(&snapshot);
            if !more {
                break;
            }
        }

        self.finish(game_client_id)
    }

    fn finish(&self, game_client_id: &str) -> Result<()> {
        let removed = { self.registry.lock()?.remove(game_client_id) };
        if let Some(entry) = removed {
            self.db.clear_download_state(game_client_id)?;
            self.sink.publish(&entry.progress);
            tracing::info!(
                "install success game={} version={:?}",
                game_client_id,
                entry
                    .progress
                    .items
                    .last()
                    .map(|item| item.internal_version)
            );
        }
        Ok(())
    }

    async fn run_download_stage(
        &self,
        game_client_id: &str,
        index: usize,
        item: &DownloadProgressItem,
        init_info: &DownloadInitInfo,
        resource: &GameUpdateResource,
        control_rx: &mut watch::Receiver<TransferControl>,
    ) -> Result<()> {
        let target_dir = init_info.target_dir.clone();

        self.patch_transfer(
            game_client_id,
            index,
            TransferPatch {
                status: Some(DownloadStatus::Initializing),
                ..TransferPatch::default()
            },
            true,
        )?;

        // The payload needs room twice: once on disk and once extracted.
        let estimated_payload = item
            .download
            .total_bytes
            .max((resource.patch_size_mb * 1024.0 * 1024.0) as u64);
        let required = estimated_payload
            .saturating_mul(2)
            .saturating_add(storage_safety_margin());
        if let Some(available) = available_disk_space(&target_dir) {
            if available < required {
                self.patch_transfer(
                    game_client_id,
                    index,
                    TransferPatch {
                        status: Some(DownloadStatus::Interrupted),
                        interrupt_reason: Some(InterruptReason::NotEnoughSpaceForDownload),
                        ..TransferPatch::default()
                    },
                    true,
                )?;
                return Err(LauncherError::InsufficientSpace {
                    required,
                    available,
                });
            }
        }

        // The manifest is small and the applier needs it before the payload.
        if !item.is_full_package {
            let metadata_dest = metadata_download_path(&target_dir, item.internal_version);
            if let Err(err) = self
                .transport
                .download(
                    &resource.metadata_url,
                    &metadata_dest,
                    &[],
                    control_rx.clone(),
                    &|_| {},
                )
                .await
            {
                return self.record_transfer_failure(game_client_id, index, err);
            }
        }

        self.patch_transfer(
            game_client_id,
            index,
            TransferPatch {
                status: Some(DownloadStatus::Progressing),
                ..TransferPatch::default()
            },
            true,
        )?;

        let payload = payload_path(&target_dir, item.internal_version, item.is_full_package);
        let observer = self.transfer_observer(game_client_id.to_string(), index);
        match self
            .transport
            .download(
                &item.download_url,
                &payload,
                &[],
                control_rx.clone(),
                observer.as_ref(),
            )
            .await
        {
            Ok(()) => {
                let total = tokio::fs::metadata(&payload)
                    .await
                    .map(|meta| meta.len())
                    .unwrap_or(item.download.total_bytes);
                self.patch_item(
                    game_client_id,
                    index,
                    Some(&TransferPatch {
                        status: Some(DownloadStatus::Completed),
                        transferred_bytes: Some(total),
                        total_bytes: Some(total),
                        bytes_per_second: Some(0),
                        ..TransferPatch::default()
                    }),
                    Some(&InstallPatch {
                        status: Some(InstallStatus::Downloaded),
                        ..InstallPatch::default()
                    }),
                    true,
                )?;
                Ok(())
            }
            Err(err) => self.record_transfer_failure(game_client_id, index, err),
        }
    }

    async fn run_install_stage(
        &self,
        game_client_id: &str,
        index: usize,
        init_info: &DownloadInitInfo,
        resource: &GameUpdateResource,
    ) -> Result<()> {
        let target_dir = init_info.target_dir.clone();
        let payload = payload_path(
            &target_dir,
            resource.internal_version,
            resource.is_full_package,
        );
        let manifest = if resource.is_full_package {
            None
        } else {
            let metadata_path = metadata_download_path(&target_dir, resource.internal_version);
            Some(snapshot_diff::load_manifest(&metadata_path)?)
        };

        let request = ApplyRequest {
            game_client_id: game_client_id.to_string(),
            game: init_info.game.clone(),
            install_dir: target_dir,
            payload_path: payload,
            manifest,
            internal_version: resource.internal_version,
            is_full_package: resource.is_full_package,
        };
        let observer = self.install_observer(game_client_id.to_string(), index);
        self.applier.apply(request, observer).await
    }

    fn record_transfer_failure(
        &self,
        game_client_id: &str,
        index: usize,
        err: LauncherError,
    ) -> Result<()> {
        if matches!(err, LauncherError::Cancelled) {
            return Err(err);
        }
        // A transfer that dies while paused (the server gave up on the held
        // connection) is reported as pause-initiated, not as a server fault.
        let was_paused = self
            .registry
            .snapshot(game_client_id)?
            .and_then(|info| info.items.get(index).map(|item| item.download.is_paused))
            .unwrap_or(false);
        let reason = if was_paused {
            InterruptReason::Pause
        } else {
            classify_interrupt(&err)
        };
        self.patch_transfer(
            game_client_id,
            index,
            TransferPatch {
                status: Some(DownloadStatus::Interrupted),
                bytes_per_second: Some(0),
                interrupt_reason: Some(reason),
                ..TransferPatch::default()
            },
            true,
        )?;
        Err(err)
    }

    fn transfer_observer(&self, game_client_id: String, index: usize) -> Arc<TransferObserver> {
        let coordinator = self.clone();
        let gate = Mutex::new(ReportGate::new());
        Arc::new(move |update: TransferUpdate| {
            let should = gate
                .lock()
                .map(|mut gate| gate.should_report(update.transferred_bytes, update.total_bytes))
                .unwrap_or(false);
            if !should {
                return;
            }
            let patch = TransferPatch {
                transferred_bytes: Some(update.transferred_bytes),
                total_bytes: Some(update.total_bytes),
                bytes_per_second: Some(update.bytes_per_second),
                status: Some(DownloadStatus::Progressing),
                ..TransferPatch::default()
            };
            if let Err(err) = coordinator.patch_transfer(&game_client_id, index, patch, true) {
                tracing::warn!("progress update dropped for {}: {}", game_client_id, err);
            }
        })
    }

    fn install_observer(&self, game_client_id: String, index: usize) -> Arc<InstallObserver> {
        let coordinator = self.clone();
        let gate = Mutex::new(ReportGate::new());
        Arc::new(move |patch: InstallPatch| {
            // Status transitions always flush; byte progress is throttled.
            let is_status = patch.status.is_some();
            if !is_status {
                let should = gate
                    .lock()
                    .map(|mut gate| {
                        gate.should_report(
                            patch.unzipped_bytes.unwrap_or(0),
                            patch.total_bytes.unwrap_or(0),
                        )
                    })
                    .unwrap_or(false);
                if !should {
                    return;
                }
            }
            if let Err(err) =
                coordinator.patch_item(&game_client_id, index, None, Some(&patch), is_status)
            {
                tracing::warn!("install update dropped for {}: {}", game_client_id, err);
            }
        })
    }

    fn with_entry<R>(
        &self,
        game_client_id: &str,
        apply: impl FnOnce(&mut ActiveDownload) -> R,
    ) -> Result<Option<R>> {
        let mut guard = self.registry.lock()?;
        Ok(guard.get_mut(game_client_id).map(apply))
    }

    fn patch_item(
        &self,
        game_client_id: &str,
        index: usize,
        transfer: Option<&TransferPatch>,
        install: Option<&InstallPatch>,
        persist: bool,
    ) -> Result<()> {
        let snapshot = self.with_entry(game_client_id, |entry| {
            if let Some(item) = entry.progress.items.get_mut(index) {
                if let Some(patch) = transfer {
                    item.download = apply_transfer_patch(&item.download, patch);
                }
                if let Some(patch) = install {
                    item.install = apply_install_patch(&item.install, patch);
                }
            }
            entry.progress.clone()
        })?;
        if let Some(snapshot) = snapshot {
            if persist {
                self.db.save_download_state(&snapshot)?;
            }
            self.sink.publish(&snapshot);
        }
        Ok(())
    }

    fn patch_transfer(
        &self,
        game_client_id: &str,
        index: usize,
        patch: TransferPatch,
        persist: bool,
    ) -> Result<()> {
        self.patch_item(game_client_id, index, Some(&patch), None, persist)
    }
}

/// Gates snapshot persistence/publication to whole-percent changes or the
/// report interval, whichever comes first.
struct ReportGate {
    last_sent: Instant,
    last_percent: i32,
}

impl ReportGate {
    fn new() -> Self {
        Self {
            last_sent: Instant::now() - REPORT_INTERVAL,
            last_percent: -1,
        }
    }

    fn should_report(&mut self, transferred: u64, total: u64) -> bool {
        let percent = if total == 0 {
            0
        } else {
            ((transferred * 100) / total.max(1)) as i32
        };
        let now = Instant::now();
        if percent != self.last_percent || now.duration_since(self.last_sent) > REPORT_INTERVAL {
            self.last_percent = percent;
            self.last_sent = now;
            true
        } else {
            false
        }
    }
}

fn classify_interrupt(err: &LauncherError) -> InterruptReason {
    match err {
        LauncherError::InsufficientSpace { .. } => InterruptReason::NotEnoughSpaceForDownload,
        LauncherError::Http(detail) => InterruptReason::ServerError(Some(detail.clone())),
        LauncherError::Network(err) => InterruptReason::ServerError(Some(err.to_string())),
        _ => InterruptReason::Unknown,
    }
}

fn storage_safety_margin() -> u64 {
    std::env::var("LAUNCHER_STORAGE_SAFETY_MARGIN_BYTES")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_STORAGE_SAFETY_MARGIN_BYTES)
}

fn nearest_existing_path(path: &Path) -> std::path::PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return std::path::PathBuf::from(".");
        }
    }
    candidate
}

fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().to_string_lossy().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }

    best.map(|(_, available)| available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::SettingsQueries;
    use crate::models::{
        DiffManifest, GameInfo, GameUpdateInfo, LocalGameVersion, RemoteGameInfo,
    };
    use crate::services::archive::ZipExtractor;
    use crate::services::deeplink::SettingsDeeplinkRegistrar;
    use crate::services::notify::TracingSink;
    use crate::services::transport::wait_for_running;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::path::PathBuf;
    use uuid::Uuid;
    use zip::write::FileOptions;

    fn scratch_dir() -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("levelup-coordinator-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn test_db() -> Database {
        let db = Database::in_memory().expect("open in-memory database");
        db.run_migrations().expect("run migrations");
        db
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            for (name, contents) in entries {
                writer
                    .start_file(*name, FileOptions::default())
                    .expect("start entry");
                writer.write_all(contents).expect("write entry");
            }
            writer.finish().expect("finish archive");
        }
        cursor.into_inner()
    }

    fn resource(version: u32, is_full_package: bool) -> GameUpdateResource {
        GameUpdateResource {
            internal_version: version,
            package_url: format!("https://cdn.example/rf4/pkg-{version}.zip"),
            metadata_url: format!("https://cdn.example/rf4/pkg-{version}.metadata.json"),
            patch_size_mb: 0.1,
            is_full_package,
        }
    }

    fn init_info(target_dir: PathBuf, resources: Vec<GameUpdateResource>) -> DownloadInitInfo {
        DownloadInitInfo {
            target_dir,
            game: RemoteGameInfo {
                id: "rf4".to_string(),
                title: "Raid Force 4".to_string(),
                runnable_path: "bin/game.exe".to_string(),
                deeplink_protocol: "levelup-rf4".to_string(),
            },
            create_desktop_shortcut: false,
            started_at: chrono::Utc::now().timestamp(),
            update_info: GameUpdateInfo { resources },
        }
    }

    /// Serves canned bytes per URL and records, per request, which local
    /// version the game-info store held at that moment.
    struct MockTransport {
        responses: Mutex<HashMap<String, Vec<u8>>>,
        db: Database,
        log: Mutex<Vec<(String, Option<LocalGameVersion>)>>,
    }

    impl MockTransport {
        fn new(db: Database) -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                db,
                log: Mutex::new(Vec::new()),
            }
        }

        fn serve(&self, url: &str, data: Vec<u8>) {
            self.responses
                .lock()
                .expect("responses lock")
                .insert(url.to_string(), data);
        }

        fn requested_urls(&self) -> Vec<String> {
            self.log
                .lock()
                .expect("log lock")
                .iter()
                .map(|(url, _)| url.clone())
                .collect()
        }

        fn version_seen_at(&self, url: &str) -> Option<LocalGameVersion> {
            self.log
                .lock()
                .expect("log lock")
                .iter()
                .find(|(requested, _)| requested == url)
                .and_then(|(_, version)| *version)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn download(
            &self,
            url: &str,
            destination: &Path,
            _headers: &[(String, String)],
            mut control: watch::Receiver<TransferControl>,
            on_progress: &TransferObserver,
        ) -> crate::errors::Result<()> {
            wait_for_running(&mut control).await?;
            let data = self
                .responses
                .lock()
                .expect("responses lock")
                .get(url)
                .cloned()
                .ok_or_else(|| LauncherError::Http(format!("HTTP 404 ({url})")))?;
            let version = self
                .db
                .get_game_info("rf4")
                .expect("read game info")
                .map(|info| info.internal_version);
            self.log
                .lock()
                .expect("log lock")
                .push((url.to_string(), version));

            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(destination, &data).await?;
            on_progress(TransferUpdate {
                transferred_bytes: data.len() as u64,
                total_bytes: data.len() as u64,
                bytes_per_second: data.len() as u64,
            });
            Ok(())
        }
    }

    /// Never completes; unblocks only through cancellation.
    struct BlockedTransport;

    #[async_trait]
    impl Transport for BlockedTransport {
        async fn download(
            &self,
            _url: &str,
            _destination: &Path,
            _headers: &[(String, String)],
            mut control: watch::Receiver<TransferControl>,
            _on_progress: &TransferObserver,
        ) -> crate::errors::Result<()> {
            loop {
                wait_for_running(&mut control).await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// Keeps every published snapshot so tests can assert on the transition
    /// history, not just the end state.
    #[derive(Default)]
    struct CollectingSink {
        snapshots: Mutex<Vec<DownloadProgressInfo>>,
    }

    impl ProgressSink for CollectingSink {
        fn publish(&self, info: &DownloadProgressInfo) {
            self.snapshots
                .lock()
                .expect("sink lock")
                .push(info.clone());
        }
    }

    fn coordinator(db: &Database, transport: Arc<dyn Transport>) -> DownloadCoordinator {
        coordinator_with_sink(db, transport, Arc::new(TracingSink))
    }

    fn coordinator_with_sink(
        db: &Database,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ProgressSink>,
    ) -> DownloadCoordinator {
        std::env::set_var("LAUNCHER_STORAGE_SAFETY_MARGIN_BYTES", "1024");
        DownloadCoordinator::new(
            db.clone(),
            transport,
            Arc::new(ZipExtractor),
            Arc::new(SettingsDeeplinkRegistrar::new(db.clone())),
            sink,
            DownloadRegistry::new(),
        )
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn manifest_json(manifest: &DiffManifest) -> Vec<u8> {
        serde_json::to_vec(manifest).expect("serialize manifest")
    }

    #[tokio::test]
    async fn applies_planned_resources_strictly_in_order() {
        let db = test_db();
        let install_dir = scratch_dir();
        std::fs::write(install_dir.join("a.txt"), b"v3").expect("seed install");
        db.set_game_info(
            "rf4",
            &GameInfo {
                runnable_path: "bin/game.exe".to_string(),
                root_folder_path: install_dir.to_string_lossy().to_string(),
                internal_version: LocalGameVersion::Version(3),
            },
        )
        .expect("seed game info");

        let transport = Arc::new(MockTransport::new(db.clone()));
        let v4 = resource(4, false);
        let v5 = resource(5, false);

        let mut added4 = BTreeMap::new();
        added4.insert("a.txt".to_string(), sha256_hex(b"v4"));
        let mut removed4 = BTreeMap::new();
        removed4.insert("a.txt".to_string(), sha256_hex(b"v3"));
        transport.serve(
            &v4.metadata_url,
            manifest_json(&DiffManifest {
                added: added4,
                removed: removed4,
            }),
        );
        transport.serve(&v4.package_url, zip_bytes(&[("a.txt", b"v4".as_slice())]));

        let mut added5 = BTreeMap::new();
        added5.insert("a.txt".to_string(), sha256_hex(b"v5"));
        added5.insert("b.txt".to_string(), sha256_hex(b"fresh"));
        let mut removed5 = BTreeMap::new();
        removed5.insert("a.txt".to_string(), sha256_hex(b"v4"));
        transport.serve(
            &v5.metadata_url,
            manifest_json(&DiffManifest {
                added: added5,
                removed: removed5,
            }),
        );
        transport.serve(
            &v5.package_url,
            zip_bytes(&[("a.txt", b"v5".as_slice()), ("b.txt", b"fresh".as_slice())]),
        );

        let sink = Arc::new(CollectingSink::default());
        let coordinator = coordinator_with_sink(&db, transport.clone(), sink.clone());
        let outcome = coordinator
            .start("rf4", init_info(install_dir.clone(), vec![v4.clone(), v5.clone()]))
            .await
            .expect("start download");
        assert_eq!(outcome, StartOutcome::Started);

        let probe = coordinator.clone();
        wait_until("pipeline completion", move || {
            probe
                .get_progress("rf4")
                .expect("query progress")
                .is_none()
        })
        .await;

        assert_eq!(
            std::fs::read(install_dir.join("a.txt")).expect("read a"),
            b"v5"
        );
        assert_eq!(
            std::fs::read(install_dir.join("b.txt")).expect("read b"),
            b"fresh"
        );
        let info = db.get_game_info("rf4").expect("query").expect("present");
        assert_eq!(info.internal_version, LocalGameVersion::Version(5));
        assert!(db
            .get_download_state("rf4")
            .expect("query state")
            .is_none());

        // Version 5's payload was requested only after version 4 had fully
        // finished, i.e. the recorded local version had already advanced.
        assert_eq!(
            transport.version_seen_at(&v5.package_url),
            Some(LocalGameVersion::Version(4))
        );
        let urls = transport.requested_urls();
        assert_eq!(
            urls,
            vec![
                v4.metadata_url.clone(),
                v4.package_url.clone(),
                v5.metadata_url.clone(),
                v5.package_url.clone(),
            ]
        );

        // Both items end terminal, and the highest version is the last one
        // to get there.
        let snapshots = sink.snapshots.lock().expect("sink lock");
        let last = snapshots.last().expect("snapshots recorded");
        assert!(last.is_finished());
        assert!(last
            .items
            .iter()
            .all(|item| item.install.status == InstallStatus::DeeplinkRegistered));
        assert_eq!(last.items.last().expect("items").internal_version, 5);
        let item0_terminal = snapshots
            .iter()
            .position(|s| s.items[0].install.status.is_terminal_success())
            .expect("first item reaches terminal");
        let item1_terminal = snapshots
            .iter()
            .position(|s| s.items[1].install.status.is_terminal_success())
            .expect("second item reaches terminal");
        assert!(item0_terminal < item1_terminal);
    }

    #[tokio::test]
    async fn start_is_a_guarded_noop_while_a_pipeline_exists() {
        let db = test_db();
        let install_dir = scratch_dir();
        let coordinator = coordinator(&db, Arc::new(BlockedTransport));

        let resources = vec![resource(1, true)];
        let outcome = coordinator
            .start("rf4", init_info(install_dir.clone(), resources.clone()))
            .await
            .expect("first start");
        assert_eq!(outcome, StartOutcome::Started);

        let outcome = coordinator
            .start("rf4", init_info(install_dir, resources))
            .await
            .expect("second start");
        assert_eq!(outcome, StartOutcome::AlreadyActive);

        coordinator.cancel("rf4").await.expect("cancel");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_removes_the_entry() {
        let db = test_db();
        let install_dir = scratch_dir();
        let coordinator = coordinator(&db, Arc::new(BlockedTransport));

        coordinator
            .start("rf4", init_info(install_dir.clone(), vec![resource(4, false)]))
            .await
            .expect("start download");
        assert!(coordinator
            .get_progress("rf4")
            .expect("query progress")
            .is_some());

        coordinator.cancel("rf4").await.expect("first cancel");
        assert!(coordinator
            .get_progress("rf4")
            .expect("query progress")
            .is_none());
        assert!(db.get_download_state("rf4").expect("state").is_none());
        assert!(!patch_dir(&install_dir).exists());

        coordinator.cancel("rf4").await.expect("second cancel");
    }

    #[tokio::test]
    async fn legacy_installs_are_reported_not_updatable() {
        let db = test_db();
        let install_dir = scratch_dir();
        db.set_game_info(
            "rf4",
            &GameInfo {
                runnable_path: "bin/game.exe".to_string(),
                root_folder_path: install_dir.to_string_lossy().to_string(),
                internal_version: LocalGameVersion::Legacy,
            },
        )
        .expect("seed legacy info");

        let coordinator = coordinator(&db, Arc::new(BlockedTransport));
        let outcome = coordinator
            .start("rf4", init_info(install_dir, vec![resource(4, false)]))
            .await
            .expect("start download");
        assert_eq!(outcome, StartOutcome::NotUpdatable);
        assert!(coordinator
            .get_progress("rf4")
            .expect("query progress")
            .is_none());
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_only_while_progressing() {
        let db = test_db();
        let install_dir = scratch_dir();
        let coordinator = coordinator(&db, Arc::new(BlockedTransport));

        assert!(matches!(
            coordinator.pause("rf4").await,
            Err(LauncherError::NotFound(_))
        ));

        // A full package skips the manifest download, so the transfer parks
        // in `Progressing` against the blocked transport.
        coordinator
            .start("rf4", init_info(install_dir, vec![resource(1, true)]))
            .await
            .expect("start download");

        let probe = coordinator.clone();
        wait_until("transfer to reach progressing", move || {
            probe
                .get_progress("rf4")
                .expect("query progress")
                .and_then(|info| info.current_item().map(|item| item.download.status))
                == Some(DownloadStatus::Progressing)
        })
        .await;

        coordinator.pause("rf4").await.expect("pause");
        let info = coordinator
            .get_progress("rf4")
            .expect("query progress")
            .expect("entry present");
        assert!(info.current_item().expect("current item").download.is_paused);

        // Pausing an already-paused transfer is rejected.
        assert!(matches!(
            coordinator.pause("rf4").await,
            Err(LauncherError::Config(_))
        ));

        coordinator.resume("rf4").await.expect("resume");
        let info = coordinator
            .get_progress("rf4")
            .expect("query progress")
            .expect("entry present");
        assert!(!info.current_item().expect("current item").download.is_paused);

        coordinator.cancel("rf4").await.expect("cancel");
    }

    #[tokio::test]
    async fn server_failure_interrupts_and_explicit_retry_completes() {
        let db = test_db();
        let install_dir = scratch_dir();
        std::fs::write(install_dir.join("a.txt"), b"v3").expect("seed install");
        db.set_game_info(
            "rf4",
            &GameInfo {
                runnable_path: "bin/game.exe".to_string(),
                root_folder_path: install_dir.to_string_lossy().to_string(),
                internal_version: LocalGameVersion::Version(3),
            },
        )
        .expect("seed game info");

        let transport = Arc::new(MockTransport::new(db.clone()));
        let v4 = resource(4, false);
        let mut added = BTreeMap::new();
        added.insert("a.txt".to_string(), sha256_hex(b"v4"));
        let mut removed = BTreeMap::new();
        removed.insert("a.txt".to_string(), sha256_hex(b"v3"));
        transport.serve(
            &v4.metadata_url,
            manifest_json(&DiffManifest { added, removed }),
        );
        // The payload URL is left unserved, so the first attempt 404s.

        let coordinator = coordinator(&db, transport.clone());
        coordinator
            .start("rf4", init_info(install_dir.clone(), vec![v4.clone()]))
            .await
            .expect("start download");

        let probe = coordinator.clone();
        wait_until("transfer to be interrupted", move || {
            probe
                .get_progress("rf4")
                .expect("query progress")
                .and_then(|info| info.current_item().map(|item| item.download.status))
                == Some(DownloadStatus::Interrupted)
        })
        .await;

        let info = coordinator
            .get_progress("rf4")
            .expect("query progress")
            .expect("entry present");
        assert!(matches!(
            info.current_item()
                .expect("current item")
                .download
                .interrupt_reason,
            Some(InterruptReason::ServerError(Some(_)))
        ));

        // The failure is state, not a lost pipeline: serving the payload and
        // retrying finishes the update. The halted task may still be flagging
        // itself as stopped, so give retry a few attempts.
        transport.serve(&v4.package_url, zip_bytes(&[("a.txt", b"v4".as_slice())]));
        let mut retried = false;
        for _ in 0..40 {
            match coordinator.retry("rf4").await {
                Ok(()) => {
                    retried = true;
                    break;
                }
                Err(LauncherError::Config(_)) => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(err) => panic!("retry failed: {err}"),
            }
        }
        assert!(retried, "retry never accepted");

        let probe = coordinator.clone();
        wait_until("pipeline completion", move || {
            probe
                .get_progress("rf4")
                .expect("query progress")
                .is_none()
        })
        .await;

        let info = db.get_game_info("rf4").expect("query").expect("present");
        assert_eq!(info.internal_version, LocalGameVersion::Version(4));
        assert_eq!(
            std::fs::read(install_dir.join("a.txt")).expect("read a"),
            b"v4"
        );
        assert!(db
            .get_setting("deeplink.levelup-rf4")
            .expect("query setting")
            .is_some());
    }

    #[tokio::test]
    async fn restore_resurfaces_persisted_pipelines_as_interrupted() {
        let db = test_db();
        let install_dir = scratch_dir();
        let transport = Arc::new(MockTransport::new(db.clone()));
        let coordinator = coordinator(&db, transport);

        // A snapshot left behind by a crashed process, mid-transfer.
        let v4 = resource(4, false);
        let mut progress = DownloadProgressInfo {
            pipeline_id: Uuid::new_v4().to_string(),
            game_client_id: "rf4".to_string(),
            init_info: init_info(install_dir, vec![v4.clone()]),
            items: vec![DownloadProgressItem::seeded(&v4)],
            current_download_index: 0,
        };
        progress.items[0].download.status = DownloadStatus::Progressing;
        db.save_download_state(&progress).expect("persist snapshot");

        let restored = coordinator.restore().expect("restore");
        assert_eq!(restored, 1);

        let info = coordinator
            .get_progress("rf4")
            .expect("query progress")
            .expect("entry present");
        let item = info.current_item().expect("current item");
        assert_eq!(item.download.status, DownloadStatus::Interrupted);
        assert_eq!(item.download.interrupt_reason, Some(InterruptReason::Unknown));
    }
}
