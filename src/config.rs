use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Default reconnect interval for the monitor, in seconds.
const DEFAULT_RECONNECT_SECS: u64 = 10;

/// Configuration loaded from `scenesync.toml` in the working directory.
///
/// Everything here can also be given on the command line; CLI values win.
#[derive(Debug, Deserialize, Default)]
pub struct SceneSyncConfig {
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct MonitorSection {
    /// Server address to push changes to.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Push every tracked file after each (re)connect.
    #[serde(default)]
    pub sync: bool,
    /// Reconnect interval in seconds (default 10).
    pub reconnect_secs: Option<u64>,
    /// Directories to track at startup.
    #[serde(default)]
    pub track: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    /// Port to accept a monitor connection on.
    pub port: Option<u16>,
    /// Shell command to run after a batch of changes has been applied.
    pub on_reload: Option<String>,
    /// Incoming id to local directory mappings.
    #[serde(default)]
    pub map: Vec<DirectoryEntry>,
}

/// One `id = path` pair, used for both tracking and server-side mapping.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: String,
    pub path: PathBuf,
}

impl SceneSyncConfig {
    /// Load configuration from `scenesync.toml` in the given directory.
    ///
    /// Returns a default (empty) configuration if the file does not exist or
    /// cannot be parsed.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join("scenesync.toml");

        if !config_path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!(%err, "failed to parse scenesync.toml, using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(%err, "failed to read scenesync.toml, using defaults");
                Self::default()
            }
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(
            self.monitor
                .reconnect_secs
                .unwrap_or(DEFAULT_RECONNECT_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SceneSyncConfig::load(dir.path());
        assert!(config.monitor.host.is_none());
        assert!(config.monitor.track.is_empty());
        assert_eq!(config.reconnect_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("scenesync.toml"),
            r#"
            [monitor]
            host = "10.0.0.2"
            port = 7878
            sync = true
            reconnect_secs = 3
            track = [{ id = "ui", path = "qml" }, { id = "art", path = "assets" }]

            [server]
            port = 7878
            on_reload = "echo reload"
            map = [{ id = "ui", path = "/srv/qml" }]
            "#,
        )
        .unwrap();

        let config = SceneSyncConfig::load(dir.path());
        assert_eq!(config.monitor.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.monitor.port, Some(7878));
        assert!(config.monitor.sync);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(3));
        assert_eq!(config.monitor.track.len(), 2);
        assert_eq!(config.monitor.track[0].id, "ui");
        assert_eq!(config.server.on_reload.as_deref(), Some("echo reload"));
        assert_eq!(config.server.map[0].path, PathBuf::from("/srv/qml"));
    }

    #[test]
    fn test_load_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("scenesync.toml"), "not [ valid { toml").unwrap();
        let config = SceneSyncConfig::load(dir.path());
        assert!(config.server.port.is_none());
    }
}
