use tokio::sync::broadcast;

use crate::models::DownloadProgressInfo;

/// Where the coordinator publishes progress snapshots on every meaningful
/// state change. The renderer-facing transport behind this seam is up to the
/// embedding application.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, info: &DownloadProgressInfo);
}

/// Fans snapshots out to any number of subscribers; lagging receivers drop
/// old snapshots, which is fine because only the latest one matters.
pub struct BroadcastSink {
    tx: broadcast::Sender<DownloadProgressInfo>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<DownloadProgressInfo>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadProgressInfo> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn publish(&self, info: &DownloadProgressInfo) {
        // No receivers is not an error; headless runs just drop snapshots.
        let _ = self.tx.send(info.clone());
    }
}

/// Log-only sink for tooling and tests.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn publish(&self, info: &DownloadProgressInfo) {
        if let Some(item) = info.current_item() {
            tracing::debug!(
                "progress game={} item={}/{} version={} download={:?} install={:?}",
                info.game_client_id,
                info.current_download_index + 1,
                info.items.len(),
                item.internal_version,
                item.download.status,
                item.install.status
            );
        }
    }
}
