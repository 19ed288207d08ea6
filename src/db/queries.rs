use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::errors::Result;
use crate::models::{DownloadProgressInfo, GameInfo, LocalGameVersion};

pub trait SettingsQueries {
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn delete_setting(&self, key: &str) -> Result<()>;
}

/// The authoritative local record per game: where it lives, what runs it,
/// and which internal version is on disk.
pub trait GameInfoQueries {
    fn set_game_info(&self, game_client_id: &str, info: &GameInfo) -> Result<()>;
    fn get_game_info(&self, game_client_id: &str) -> Result<Option<GameInfo>>;
    fn delete_game_info(&self, game_client_id: &str) -> Result<()>;
}

/// Serialized pipeline snapshots, enough to offer resume after a crash.
pub trait DownloadStateQueries {
    fn save_download_state(&self, info: &DownloadProgressInfo) -> Result<()>;
    fn get_download_state(&self, game_client_id: &str) -> Result<Option<DownloadProgressInfo>>;
    fn list_download_states(&self) -> Result<Vec<DownloadProgressInfo>>;
    fn clear_download_state(&self, game_client_id: &str) -> Result<()>;
}

impl SettingsQueries for Database {
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl GameInfoQueries for Database {
    fn set_game_info(&self, game_client_id: &str, info: &GameInfo) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO games
                (game_client_id, runnable_path, root_folder_path, internal_version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                game_client_id,
                info.runnable_path,
                info.root_folder_path,
                info.internal_version.to_string(),
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    fn get_game_info(&self, game_client_id: &str) -> Result<Option<GameInfo>> {
        let conn = self.connection()?;
        let info = conn
            .query_row(
                "SELECT runnable_path, root_folder_path, internal_version
                 FROM games WHERE game_client_id = ?1",
                params![game_client_id],
                |row| {
                    let version_text: String = row.get(2)?;
                    Ok(GameInfo {
                        runnable_path: row.get(0)?,
                        root_folder_path: row.get(1)?,
                        internal_version: parse_version_column(&version_text),
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    fn delete_game_info(&self, game_client_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM games WHERE game_client_id = ?1",
            params![game_client_id],
        )?;
        Ok(())
    }
}

fn parse_version_column(text: &str) -> LocalGameVersion {
    text.parse::<u32>()
        .map(LocalGameVersion::Version)
        .unwrap_or(LocalGameVersion::Legacy)
}

impl DownloadStateQueries for Database {
    fn save_download_state(&self, info: &DownloadProgressInfo) -> Result<()> {
        let progress_json = serde_json::to_string(info)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO download_state (game_client_id, progress_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                info.game_client_id,
                progress_json,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    fn get_download_state(&self, game_client_id: &str) -> Result<Option<DownloadProgressInfo>> {
        let conn = self.connection()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT progress_json FROM download_state WHERE game_client_id = ?1",
                params![game_client_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_download_states(&self) -> Result<Vec<DownloadProgressInfo>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT progress_json FROM download_state ORDER BY updated_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut states = Vec::new();
        for raw in rows {
            states.push(serde_json::from_str(&raw?)?);
        }
        Ok(states)
    }

    fn clear_download_state(&self, game_client_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM download_state WHERE game_client_id = ?1",
            params![game_client_id],
        )?;
        Ok(())
    }
}
