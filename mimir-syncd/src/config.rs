use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mimir_core::{DEFAULT_BASE_URL, DEFAULT_CONFIG_BASE_URL};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::sync::ErrorKind;

pub const APP_DIR_NAME: &str = "mimir-mirror";
const DEFAULT_DOWNLOAD_DIR_NAME: &str = "Mimir";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HEARTBEAT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 30 * 60 * 1000;
const DEFAULT_TRANSFER_CONCURRENCY: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const REDACTED_PREFIX_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io { .. } => ErrorKind::Filesystem,
            ConfigError::Parse { .. } | ConfigError::Invalid(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MirrorConfig {
    #[serde(alias = "rossFolderId")]
    pub folder_id: String,
    #[serde(alias = "apiKey")]
    pub credential: String,
    #[serde(alias = "downloadDir")]
    pub download_directory: PathBuf,
    pub port: u16,
    pub public_url: String,
    #[serde(alias = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    #[serde(alias = "syncInterval")]
    pub sync_interval_ms: u64,
    pub api_base_url: String,
    pub config_api_url: String,
    pub log_file: Option<PathBuf>,
    pub transfer_concurrency: usize,
    pub request_timeout_secs: u64,
    pub tunnel_autostart: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            folder_id: String::new(),
            credential: String::new(),
            download_directory: dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(DEFAULT_DOWNLOAD_DIR_NAME),
            port: DEFAULT_PORT,
            public_url: String::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            api_base_url: DEFAULT_BASE_URL.to_string(),
            config_api_url: DEFAULT_CONFIG_BASE_URL.to_string(),
            log_file: dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR_NAME).join("logs").join("mimir-syncd.log")),
            transfer_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            tunnel_autostart: true,
        }
    }
}

impl MirrorConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME)
            .join("config.json")
    }

    /// `.env` must already be loaded; the caller owns process bootstrap.
    pub fn from_env() -> Result<(Self, PathBuf), ConfigError> {
        let lookup = |name: &str| std::env::var(name).ok();
        let home = dirs::home_dir();
        let path = lookup("MIMIR_CONFIG")
            .map(|value| expand_with_home(&value, home.as_deref()))
            .unwrap_or_else(Self::default_path);
        let mut config = Self::load_file(&path)?;
        config.apply_overrides(lookup, home.as_deref());
        config.validate()?;
        Ok((config, path))
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let home = dirs::home_dir();
        config.download_directory = resolve_dir(
            &config.download_directory,
            path.parent(),
            home.as_deref(),
        );
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F, home: Option<&Path>)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup("MIMIR_FOLDER_ID")) {
            self.folder_id = value;
        }
        if let Some(value) = non_empty(lookup("MIMIR_API_KEY")) {
            self.credential = value;
        }
        if let Some(value) = non_empty(lookup("MIMIR_DOWNLOAD_DIR")) {
            self.download_directory = expand_with_home(&value, home);
        }
        if let Some(port) = lookup("MIMIR_PORT").and_then(|value| value.trim().parse().ok()) {
            self.port = port;
        }
        if let Some(value) = lookup("MIMIR_PUBLIC_URL") {
            self.public_url = value;
        }
        self.heartbeat_interval_ms =
            read_u64(&lookup, "MIMIR_HEARTBEAT_MS", self.heartbeat_interval_ms);
        self.sync_interval_ms = read_u64(&lookup, "MIMIR_SYNC_INTERVAL_MS", self.sync_interval_ms);
        if let Some(value) = non_empty(lookup("MIMIR_API_URL")) {
            self.api_base_url = value;
        }
        if let Some(value) = non_empty(lookup("MIMIR_LOG_FILE")) {
            self.log_file = Some(expand_with_home(&value, home));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credential.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "credential is missing (set apiKey or MIMIR_API_KEY)".into(),
            ));
        }
        if self.folder_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "folder id is missing (set folderId or MIMIR_FOLDER_ID)".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.sync_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.transfer_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "transferConcurrency must be positive".into(),
            ));
        }
        if self.download_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("download directory is empty".into()));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Copy safe to hand out over the control surface.
    pub fn redacted(&self) -> Self {
        Self {
            credential: redact(&self.credential),
            ..self.clone()
        }
    }

    /// Same remote binding: folder, credential, directory and endpoints.
    pub fn same_binding(&self, other: &Self) -> bool {
        self.folder_id == other.folder_id
            && self.credential == other.credential
            && self.download_directory == other.download_directory
            && self.api_base_url == other.api_base_url
            && self.transfer_concurrency == other.transfer_concurrency
            && self.request_timeout_secs == other.request_timeout_secs
    }
}

/// Partial update accepted by the control surface; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(alias = "rossFolderId")]
    pub folder_id: Option<String>,
    #[serde(alias = "apiKey")]
    pub credential: Option<String>,
    #[serde(alias = "downloadDir")]
    pub download_directory: Option<PathBuf>,
    pub port: Option<u16>,
    pub public_url: Option<String>,
    #[serde(alias = "heartbeatInterval")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(alias = "syncInterval")]
    pub sync_interval_ms: Option<u64>,
    pub transfer_concurrency: Option<usize>,
    pub tunnel_autostart: Option<bool>,
}

impl ConfigUpdate {
    pub fn apply_to(self, current: &MirrorConfig, base_dir: Option<&Path>) -> MirrorConfig {
        let mut next = current.clone();
        if let Some(value) = self.folder_id {
            next.folder_id = value;
        }
        // The redacted form echoed by GET /api/config means "unchanged".
        if let Some(value) = self.credential.filter(|value| *value != redact(&current.credential))
        {
            next.credential = value;
        }
        if let Some(value) = self.download_directory {
            next.download_directory = resolve_dir(&value, base_dir, dirs::home_dir().as_deref());
        }
        if let Some(value) = self.port {
            next.port = value;
        }
        if let Some(value) = self.public_url {
            next.public_url = value;
        }
        if let Some(value) = self.heartbeat_interval_ms {
            next.heartbeat_interval_ms = value;
        }
        if let Some(value) = self.sync_interval_ms {
            next.sync_interval_ms = value;
        }
        if let Some(value) = self.transfer_concurrency {
            next.transfer_concurrency = value;
        }
        if let Some(value) = self.tunnel_autostart {
            next.tunnel_autostart = value;
        }
        next
    }
}

/// Current configuration plus a channel announcing replacements.
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<Arc<MirrorConfig>>,
}

impl ConfigStore {
    pub fn new(config: MirrorConfig, path: PathBuf) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<MirrorConfig> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MirrorConfig>> {
        self.tx.subscribe()
    }

    /// Validates, persists and publishes `update` on top of the current value.
    pub fn update(&self, update: ConfigUpdate) -> Result<Arc<MirrorConfig>, ConfigError> {
        let next = update.apply_to(&self.current(), self.path.parent());
        next.validate()?;
        next.save(&self.path)?;
        let next = Arc::new(next);
        self.tx.send_replace(Arc::clone(&next));
        Ok(next)
    }

    /// Publishes a value without persisting it.
    pub fn publish(&self, config: MirrorConfig) {
        self.tx.send_replace(Arc::new(config));
    }
}

pub fn redact(credential: &str) -> String {
    if credential.is_empty() {
        return String::new();
    }
    let prefix: String = credential.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{prefix}...")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) if value == "~" => home.to_path_buf(),
        Some(home) => match value.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

fn resolve_dir(value: &Path, base_dir: Option<&Path>, home: Option<&Path>) -> PathBuf {
    let expanded = expand_with_home(&value.to_string_lossy(), home);
    match base_dir {
        Some(base) if expanded.is_relative() => base.join(expanded),
        _ => expanded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn valid() -> MirrorConfig {
        MirrorConfig {
            folder_id: "folder".into(),
            credential: "sakm.abcdefghijklmnop".into(),
            download_directory: PathBuf::from("/data/mirror"),
            ..MirrorConfig::default()
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = MirrorConfig::load_file(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(300));
        assert_eq!(config.sync_interval(), Duration::from_secs(1800));
        assert!(config.tunnel_autostart);
    }

    #[test]
    fn reads_legacy_keys_and_resolves_relative_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "rossFolderId": "f-1",
                "apiKey": "key-123",
                "downloadDir": "ROSS_Images",
                "port": 3100,
                "heartbeatInterval": 60000,
                "syncInterval": 120000
            }"#,
        )
        .unwrap();

        let config = MirrorConfig::load_file(&path).unwrap();
        assert_eq!(config.folder_id, "f-1");
        assert_eq!(config.credential, "key-123");
        assert_eq!(config.download_directory, dir.path().join("ROSS_Images"));
        assert_eq!(config.port, 3100);
        assert_eq!(config.heartbeat_interval_ms, 60_000);
        assert_eq!(config.sync_interval_ms, 120_000);
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = MirrorConfig::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn env_overrides_win() {
        let vars = HashMap::from([
            ("MIMIR_FOLDER_ID", "env-folder"),
            ("MIMIR_API_KEY", "env-key"),
            ("MIMIR_DOWNLOAD_DIR", "~/Mirror"),
            ("MIMIR_PORT", "8080"),
            ("MIMIR_SYNC_INTERVAL_MS", "0"),
            ("MIMIR_HEARTBEAT_MS", "1000"),
        ]);
        let mut config = valid();
        config.apply_overrides(
            |name| vars.get(name).map(|value| value.to_string()),
            Some(Path::new("/home/u")),
        );
        assert_eq!(config.folder_id, "env-folder");
        assert_eq!(config.credential, "env-key");
        assert_eq!(config.download_directory, PathBuf::from("/home/u/Mirror"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.sync_interval_ms, DEFAULT_SYNC_INTERVAL_MS);
    }

    #[test]
    fn validation_rejects_missing_credential_and_folder() {
        assert!(valid().validate().is_ok());
        let err = MirrorConfig {
            credential: " ".into(),
            ..valid()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("credential"));
        assert!(
            MirrorConfig {
                folder_id: String::new(),
                ..valid()
            }
            .validate()
            .is_err()
        );
        assert!(
            MirrorConfig {
                sync_interval_ms: 0,
                ..valid()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn redacts_credential() {
        assert_eq!(redact("sakm.abcdefghijklmnop"), "sakm.abcde...");
        assert_eq!(valid().redacted().credential, "sakm.abcde...");
        assert_eq!(redact(""), "");
    }

    #[test]
    fn store_update_persists_and_publishes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(valid(), path.clone());
        let mut rx = store.subscribe();

        let update: ConfigUpdate = serde_json::from_value(serde_json::json!({
            "syncInterval": 60000,
            "apiKey": "sakm.abcde..."
        }))
        .unwrap();
        let next = store.update(update).unwrap();

        assert_eq!(next.sync_interval_ms, 60_000);
        assert_eq!(next.credential, "sakm.abcdefghijklmnop");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().sync_interval_ms, 60_000);
        assert_eq!(MirrorConfig::load_file(&path).unwrap().sync_interval_ms, 60_000);
        assert!(next.same_binding(&valid()));
    }

    #[test]
    fn invalid_update_is_rejected_and_not_published() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(valid(), dir.path().join("config.json"));
        let rx = store.subscribe();

        let update = ConfigUpdate {
            folder_id: Some(String::new()),
            ..ConfigUpdate::default()
        };
        assert!(store.update(update).is_err());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.current().folder_id, "folder");
    }
}
