use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use relay_llm::{BackendConfig, DEFAULT_BASE_URL, DEFAULT_CHAT_PATH, DEFAULT_HEARTBEAT_URL};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::DEFAULT_MAX_ATTACHMENT_BYTES;

pub const SETTINGS_DIRECTORY_NAME: &str = "relay";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "RELAY_";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_heartbeat_url")]
    pub heartbeat_url: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Unset means chat turns wait for the backend indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            heartbeat_url: default_heartbeat_url(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            request_timeout_secs: None,
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.base_url = non_blank_or(self.base_url, default_base_url);
        self.heartbeat_url = non_blank_or(self.heartbeat_url, default_heartbeat_url);

        let chat_path = non_blank_or(self.chat_path, default_chat_path);
        self.chat_path = if chat_path.starts_with('/') {
            chat_path
        } else {
            format!("/{chat_path}")
        };

        self.heartbeat_interval_secs = self.heartbeat_interval_secs.max(1);
        self.heartbeat_timeout_secs = self.heartbeat_timeout_secs.max(1);
        self.request_timeout_secs = self.request_timeout_secs.filter(|secs| *secs > 0);
        if self.max_attachment_bytes == 0 {
            self.max_attachment_bytes = default_max_attachment_bytes();
        }

        self
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.base_url, &self.chat_path)
            .with_request_timeout(self.request_timeout())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

pub struct SettingsStore {
    settings: Arc<ClientSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".relay"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads `config_path` layered over defaults, then `RELAY_*` environment
    /// variables on top.
    pub fn new(config_path: PathBuf) -> Self {
        let figment = Self::layered(&config_path).merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(figment, config_path)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Like [`SettingsStore::new`] but ignores the environment.
    pub fn from_file(config_path: PathBuf) -> Self {
        let figment = Self::layered(&config_path);
        Self::from_figment(figment, config_path)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        Arc::clone(&self.settings)
    }

    /// Writes a settings file holding the defaults when none exists yet, so
    /// there is something to edit. Returns whether a file was written. The
    /// loaded settings are left as they are.
    pub fn write_defaults_if_missing(&self) -> Result<bool, SettingsError> {
        if self.config_path.exists() {
            return Ok(false);
        }

        self.persist(&ClientSettings::default())?;
        Ok(true)
    }

    fn layered(path: &Path) -> Figment {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        Figment::from(Serialized::defaults(ClientSettings::default())).merge(Json::file(path))
    }

    fn from_figment(figment: Figment, config_path: PathBuf) -> Self {
        let settings = match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to load settings from {:?}: {}. using defaults",
                    config_path,
                    error
                );
                ClientSettings::default()
            }
        };

        Self {
            settings: Arc::new(settings),
            config_path,
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_chat_path() -> String {
    DEFAULT_CHAT_PATH.to_string()
}

fn default_heartbeat_url() -> String {
    DEFAULT_HEARTBEAT_URL.to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_heartbeat_timeout_secs() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

fn default_max_attachment_bytes() -> u64 {
    DEFAULT_MAX_ATTACHMENT_BYTES
}
