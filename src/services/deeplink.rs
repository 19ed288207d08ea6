use std::path::Path;

use crate::db::queries::SettingsQueries;
use crate::db::Database;
use crate::errors::Result;

/// OS hand-off registration: associates a game's URL scheme with its
/// executable so the launcher can delegate execution. Registering is the
/// canonical "install complete" signal for a resource.
pub trait DeeplinkRegistrar: Send + Sync {
    fn register(&self, game_client_id: &str, protocol: &str, runnable_path: &Path) -> Result<()>;
}

/// Records the association in the settings table. The per-platform protocol
/// handler (registry keys, `.desktop` entries) is wired by the shell on top
/// of this record.
pub struct SettingsDeeplinkRegistrar {
    db: Database,
}

impl SettingsDeeplinkRegistrar {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl DeeplinkRegistrar for SettingsDeeplinkRegistrar {
    fn register(&self, game_client_id: &str, protocol: &str, runnable_path: &Path) -> Result<()> {
        self.db.set_setting(
            &format!("deeplink.{}", protocol),
            &runnable_path.to_string_lossy(),
        )?;
        tracing::info!(
            "registered deep link game={} protocol={}://",
            game_client_id,
            protocol
        );
        Ok(())
    }
}
