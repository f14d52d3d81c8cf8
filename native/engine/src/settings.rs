use std::{error::Error, fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, ensure};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::models::Settings;

pub const SETTINGS_FILE: &str = "settings.json";

/// Handles engine settings persisted as [`SETTINGS_FILE`] in the engine directory.
#[derive(Debug, Clone)]
pub struct SettingsHandler {
    settings_file_path: PathBuf,
    watch_tx: watch::Sender<Settings>,
}

impl SettingsHandler {
    #[instrument(skip(app_dir))]
    pub fn new(app_dir: PathBuf) -> Arc<Self> {
        let watch_tx = watch::Sender::<Settings>::new(Settings::default());
        let handler =
            Arc::new(Self { settings_file_path: app_dir.join(SETTINGS_FILE), watch_tx });

        let settings = match handler.load_settings() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults");
                Settings::default()
            }
        };
        handler.on_settings_change(settings);
        handler
    }

    /// Validates, persists and publishes new settings.
    #[instrument(skip(self, settings), err)]
    pub fn update(&self, settings: Settings) -> Result<()> {
        validate(&settings)?;
        self.save_settings(&settings)?;
        self.on_settings_change(settings);
        Ok(())
    }

    /// Re-reads the settings file, publishing its content.
    pub fn reload(&self) -> Result<()> {
        let settings = self.load_settings()?;
        self.on_settings_change(settings);
        Ok(())
    }

    pub fn current(&self) -> Settings {
        self.watch_tx.borrow().clone()
    }

    #[instrument(skip(self, settings))]
    fn on_settings_change(&self, settings: Settings) {
        self.watch_tx.send_if_modified(|s| {
            if s != &settings {
                debug!(settings = ?settings, "Active settings changed");
                *s = settings;
                true
            } else {
                trace!("Settings unchanged");
                false
            }
        });
    }

    /// Create a receiver for settings changes
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.watch_tx.subscribe()
    }

    /// Load settings from file or return defaults if file doesn't exist
    #[instrument(skip(self))]
    fn load_settings(&self) -> Result<Settings> {
        if !self.settings_file_path.exists() {
            info!(path = %self.settings_file_path.display(), "Settings file doesn't exist, using defaults");
            let settings = Settings::default();
            self.save_settings(&settings)?;
            return Ok(settings);
        }

        info!(path = %self.settings_file_path.display(), "Loading settings from file");
        let file_content =
            fs::read_to_string(&self.settings_file_path).context("Failed to read settings file")?;
        let settings: Settings =
            serde_json::from_str(&file_content).context("Failed to parse settings file")?;
        validate(&settings)?;

        debug!("Loaded engine settings successfully");
        Ok(settings)
    }

    /// Save settings to file
    #[instrument(skip(self, settings))]
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        info!(path = %self.settings_file_path.display(), "Saving settings to file");
        let settings_json =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

        if let Some(parent) = self.settings_file_path.parent()
            && !parent.exists()
        {
            info!(path = %parent.display(), "Creating settings directory");
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        fs::write(&self.settings_file_path, settings_json)
            .context("Failed to write settings file")?;
        Ok(())
    }
}

fn validate(settings: &Settings) -> Result<()> {
    ensure!(!settings.backup_root.is_empty(), "Backup root must not be empty");
    ensure!(!settings.data_dir.is_empty(), "Data directory must not be empty");
    ensure!(!settings.shell_launcher.is_empty(), "Shell launcher must not be empty");
    ensure!(!settings.helper_launcher.is_empty(), "Helper launcher must not be empty");
    ensure!(
        (1..=22).contains(&settings.compression_level),
        "Compression level {} out of range 1..=22",
        settings.compression_level
    );
    if let Some(remote) = &settings.remote {
        ensure!(!remote.remote_name.is_empty(), "Remote name must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::models::{CompressionKind, RemoteSettings};

    #[tokio::test]
    async fn creates_defaults_and_persists_updates() {
        let dir = tempdir().unwrap();
        let handler = SettingsHandler::new(dir.path().to_path_buf());
        assert_eq!(handler.current(), Settings::default());
        assert!(dir.path().join("settings.json").exists());

        let mut rx = handler.subscribe();
        let mut settings = handler.current();
        settings.compression = CompressionKind::Lz4;
        settings.remote = Some(RemoteSettings::default());
        handler.update(settings.clone()).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), settings);

        let reopened = SettingsHandler::new(dir.path().to_path_buf());
        assert_eq!(reopened.current(), settings);
    }

    #[tokio::test]
    async fn rejects_invalid_settings() {
        let dir = tempdir().unwrap();
        let handler = SettingsHandler::new(dir.path().to_path_buf());
        let mut settings = handler.current();
        settings.compression_level = 40;
        assert!(handler.update(settings).is_err());
        assert_eq!(handler.current().compression_level, 1);
    }

    #[tokio::test]
    async fn unreadable_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{ not json").unwrap();
        let handler = SettingsHandler::new(dir.path().to_path_buf());
        assert_eq!(handler.current(), Settings::default());
        assert!(handler.reload().is_err());
    }
}
