pub mod archive;
pub mod deeplink;
pub mod download_coordinator;
pub mod fingerprint;
pub mod install_applier;
pub mod notify;
pub mod patch_planner;
pub mod snapshot_diff;
pub mod transport;

pub use archive::{ArchiveExtractor, UnzipProgress, ZipExtractor};
pub use deeplink::{DeeplinkRegistrar, SettingsDeeplinkRegistrar};
pub use download_coordinator::{DownloadCoordinator, DownloadRegistry, StartOutcome};
pub use install_applier::{ApplyRequest, InstallApplier};
pub use notify::{BroadcastSink, ProgressSink, TracingSink};
pub use patch_planner::{plan, should_update_game, UpdatePlan};
pub use transport::{HttpTransport, TransferControl, TransferUpdate, Transport};
