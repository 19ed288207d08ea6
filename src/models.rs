use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relative POSIX-style path -> lowercase hex SHA-256 of the file content.
pub type FileChecksumMap = BTreeMap<String, String>;

/// File-level delta between two package snapshots.
///
/// A changed file appears under the same path in both maps: the new checksum
/// in `added`, the superseded one in `removed`. Files that exist only in the
/// older snapshot produce no entry at all; published patch manifests rely on
/// that, so absence of an entry means "leave the file in place".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffManifest {
    pub added: FileChecksumMap,
    pub removed: FileChecksumMap,
}

impl DiffManifest {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One published unit of game content: either an incremental patch on top of
/// the immediately preceding internal version, or a complete package.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdateResource {
    pub internal_version: u32,
    pub package_url: String,
    pub metadata_url: String,
    pub patch_size_mb: f64,
    #[serde(default)]
    pub is_full_package: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdateInfo {
    /// Ordered by ascending `internal_version`.
    pub resources: Vec<GameUpdateResource>,
}

impl GameUpdateInfo {
    pub fn latest_internal_version(&self) -> Option<u32> {
        self.resources.iter().map(|r| r.internal_version).max()
    }
}

/// Locally recorded version of an installed game. `Legacy` marks a game that
/// was discovered on disk rather than installed through the patch pipeline;
/// such installs never receive incremental updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalGameVersion {
    Legacy,
    Version(u32),
}

impl fmt::Display for LocalGameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalGameVersion::Legacy => write!(f, "legacy"),
            LocalGameVersion::Version(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for LocalGameVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            LocalGameVersion::Legacy => serializer.serialize_str("legacy"),
            LocalGameVersion::Version(v) => serializer.serialize_u32(*v),
        }
    }
}

struct LocalGameVersionVisitor;

impl Visitor<'_> for LocalGameVersionVisitor {
    type Value = LocalGameVersion;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("the string \"legacy\" or an integer version number")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
        u32::try_from(value)
            .map(LocalGameVersion::Version)
            .map_err(|_| E::custom(format!("version {} out of range", value)))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
        u32::try_from(value)
            .map(LocalGameVersion::Version)
            .map_err(|_| E::custom(format!("version {} out of range", value)))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
        if value == "legacy" {
            Ok(LocalGameVersion::Legacy)
        } else {
            Err(E::custom(format!("unexpected version string: {}", value)))
        }
    }
}

impl<'de> Deserialize<'de> for LocalGameVersion {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(LocalGameVersionVisitor)
    }
}

/// Authoritative per-game record kept in the `games` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameInfo {
    pub runnable_path: String,
    pub root_folder_path: String,
    pub internal_version: LocalGameVersion,
}

/// Remote metadata the coordinator needs about the game being installed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGameInfo {
    pub id: String,
    pub title: String,
    /// Launcher-relative path of the executable inside the install dir.
    pub runnable_path: String,
    /// URL scheme registered on install success, e.g. `levelup-rf4`.
    pub deeplink_protocol: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadStatus {
    Initializing,
    Progressing,
    Completed,
    Interrupted,
    Cancelled,
}

/// Why a transfer moved to `Interrupted`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum InterruptReason {
    NotEnoughSpaceForDownload,
    ServerError(Option<String>),
    Pause,
    Unknown,
}

/// Patch-application stages for one resource. The serialized labels are the
/// exact strings the renderer has always displayed, typo included.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    Downloading,
    Downloaded,
    #[serde(rename = "Unziping")]
    Unzipping,
    #[serde(rename = "Unzip Success")]
    UnzipSucceeded,
    #[serde(rename = "Unzip Failed")]
    UnzipFailed,
    #[serde(rename = "Valid File")]
    ValidFile,
    #[serde(rename = "Invalid File")]
    InvalidFile,
    #[serde(rename = "Removing Files")]
    RemovingFiles,
    #[serde(rename = "Removing Files Failed")]
    RemovingFilesFailed,
    #[serde(rename = "Adding Files")]
    AddingFiles,
    #[serde(rename = "Adding Files Failed")]
    AddingFilesFailed,
    #[serde(rename = "Game Info Set")]
    GameInfoSet,
    #[serde(rename = "Deeplink Registered")]
    DeeplinkRegistered,
}

impl InstallStatus {
    /// Terminal success for the whole per-resource pipeline.
    pub fn is_terminal_success(self) -> bool {
        self == InstallStatus::DeeplinkRegistered
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            InstallStatus::UnzipFailed
                | InstallStatus::InvalidFile
                | InstallStatus::RemovingFilesFailed
                | InstallStatus::AddingFilesFailed
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: u64,
    pub status: DownloadStatus,
    pub is_paused: bool,
    #[serde(default)]
    pub interrupt_reason: Option<InterruptReason>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub unzipped_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub status: InstallStatus,
}

/// Per-resource progress entry; owned exclusively by its parent
/// `DownloadProgressInfo`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressItem {
    pub internal_version: u32,
    pub download_url: String,
    pub is_full_package: bool,
    pub download: TransferProgress,
    pub install: InstallProgress,
}

impl DownloadProgressItem {
    /// Empty progress scaled to the resource's declared patch size; the real
    /// byte totals replace the estimate once the transfer reports them.
    pub fn seeded(resource: &GameUpdateResource) -> Self {
        let estimated = (resource.patch_size_mb * 1024.0 * 1024.0) as u64;
        Self {
            internal_version: resource.internal_version,
            download_url: resource.package_url.clone(),
            is_full_package: resource.is_full_package,
            download: TransferProgress {
                transferred_bytes: 0,
                total_bytes: estimated,
                bytes_per_second: 0,
                status: DownloadStatus::Initializing,
                is_paused: false,
                interrupt_reason: None,
            },
            install: InstallProgress {
                unzipped_bytes: 0,
                total_bytes: estimated,
                percent: 0.0,
                status: InstallStatus::Downloading,
            },
        }
    }
}

/// Immutable context captured when a download is initiated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInitInfo {
    pub target_dir: PathBuf,
    pub game: RemoteGameInfo,
    pub create_desktop_shortcut: bool,
    pub started_at: i64,
    pub update_info: GameUpdateInfo,
}

/// Full mutable state of one game's download+install pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressInfo {
    pub pipeline_id: String,
    pub game_client_id: String,
    pub init_info: DownloadInitInfo,
    pub items: Vec<DownloadProgressItem>,
    pub current_download_index: usize,
}

impl DownloadProgressInfo {
    pub fn current_item(&self) -> Option<&DownloadProgressItem> {
        self.items.get(self.current_download_index)
    }

    pub fn is_finished(&self) -> bool {
        self.items
            .last()
            .map(|item| item.install.status.is_terminal_success())
            .unwrap_or(false)
    }
}

/// Partial update for `TransferProgress`; unset fields fall back to the
/// previous state.
#[derive(Clone, Debug, Default)]
pub struct TransferPatch {
    pub transferred_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub bytes_per_second: Option<u64>,
    pub status: Option<DownloadStatus>,
    pub is_paused: Option<bool>,
    pub interrupt_reason: Option<InterruptReason>,
}

/// Pure transition: returns the next state, leaving the previous one intact.
/// A status change away from `Interrupted` clears the interrupt reason unless
/// the patch supplies a new one.
pub fn apply_transfer_patch(state: &TransferProgress, patch: &TransferPatch) -> TransferProgress {
    let status = patch.status.unwrap_or(state.status);
    let interrupt_reason = match (&patch.interrupt_reason, status) {
        (Some(reason), _) => Some(reason.clone()),
        (None, DownloadStatus::Interrupted) => state.interrupt_reason.clone(),
        (None, _) => None,
    };
    TransferProgress {
        transferred_bytes: patch.transferred_bytes.unwrap_or(state.transferred_bytes),
        total_bytes: patch.total_bytes.unwrap_or(state.total_bytes),
        bytes_per_second: patch.bytes_per_second.unwrap_or(state.bytes_per_second),
        status,
        is_paused: patch.is_paused.unwrap_or(state.is_paused),
        interrupt_reason,
    }
}

/// Partial update for `InstallProgress`.
#[derive(Clone, Debug, Default)]
pub struct InstallPatch {
    pub unzipped_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    pub status: Option<InstallStatus>,
}

pub fn apply_install_patch(state: &InstallProgress, patch: &InstallPatch) -> InstallProgress {
    InstallProgress {
        unzipped_bytes: patch.unzipped_bytes.unwrap_or(state.unzipped_bytes),
        total_bytes: patch.total_bytes.unwrap_or(state.total_bytes),
        percent: patch.percent.unwrap_or(state.percent),
        status: patch.status.unwrap_or(state.status),
    }
}
