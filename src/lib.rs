//! Update and install engine for the LevelUp game launcher: content
//! fingerprinting, snapshot diffing, patch planning, and the per-game
//! download+install pipeline with pause/resume/cancel/retry.

pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use db::Database;
pub use errors::{LauncherError, Result};
pub use models::{
    DiffManifest, DownloadInitInfo, DownloadProgressInfo, FileChecksumMap, GameInfo,
    GameUpdateInfo, GameUpdateResource, LocalGameVersion,
};
pub use services::{DownloadCoordinator, DownloadRegistry, StartOutcome};
