use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use vedic_sync_core::{Channel, ConflictPolicy, FileStore, SyncConfig, DEFAULT_ENDPOINT, DEFAULT_NAMESPACE};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding the persisted queue and sync state
    pub data_dir: ConfigValue<PathBuf>,
    /// Sync endpoint base URL
    pub server_url: ConfigValue<String>,
    /// Channel purpose (live-teaching, meditation, community, notifications, general)
    pub channel: ConfigValue<String>,
    /// Token appended to the channel URL
    pub auth_token: ConfigValue<Option<String>>,
    /// User id attached to local changes
    pub user_id: ConfigValue<Option<String>>,
    /// Prefix for storage keys
    pub namespace: ConfigValue<String>,
    pub conflict_policy: ConfigValue<ConflictPolicy>,
    /// Fail the connection after this many silent seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    server_url: Option<String>,
    channel: Option<String>,
    auth_token: Option<String>,
    user_id: Option<String>,
    namespace: Option<String>,
    conflict_policy: Option<String>,
    heartbeat_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut server_url = ConfigValue::new(DEFAULT_ENDPOINT.to_string(), ConfigSource::Default);
        let mut channel = ConfigValue::new("general".to_string(), ConfigSource::Default);
        let mut auth_token = ConfigValue::new(None, ConfigSource::Default);
        let mut user_id = ConfigValue::new(None, ConfigSource::Default);
        let mut namespace = ConfigValue::new(DEFAULT_NAMESPACE.to_string(), ConfigSource::Default);
        let mut conflict_policy = ConfigValue::new(ConflictPolicy::default(), ConfigSource::Default);
        let mut heartbeat_timeout_secs = None;
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(purpose) = file_config.channel {
                channel = ConfigValue::new(purpose, ConfigSource::File);
            }
            if let Some(token) = file_config.auth_token {
                auth_token = ConfigValue::new(Some(token), ConfigSource::File);
            }
            if let Some(user) = file_config.user_id {
                user_id = ConfigValue::new(Some(user), ConfigSource::File);
            }
            if let Some(ns) = file_config.namespace {
                namespace = ConfigValue::new(ns, ConfigSource::File);
            }
            if let Some(policy) = file_config.conflict_policy {
                let policy = policy
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue("conflict_policy", e))?;
                conflict_policy = ConfigValue::new(policy, ConfigSource::File);
            }
            heartbeat_timeout_secs = file_config.heartbeat_timeout_secs;
        }

        // Apply environment variable overrides
        if let Ok(dir) = std::env::var("VSYNC_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("VSYNC_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(token) = std::env::var("VSYNC_AUTH_TOKEN") {
            auth_token = ConfigValue::new(Some(token), ConfigSource::Environment);
        }
        if let Ok(purpose) = std::env::var("VSYNC_CHANNEL") {
            channel = ConfigValue::new(purpose, ConfigSource::Environment);
        }
        if let Ok(user) = std::env::var("VSYNC_USER_ID") {
            user_id = ConfigValue::new(Some(user), ConfigSource::Environment);
        }
        if let Ok(policy) = std::env::var("VSYNC_CONFLICT_POLICY") {
            let policy = policy
                .parse()
                .map_err(|e| ConfigError::InvalidValue("VSYNC_CONFLICT_POLICY", e))?;
            conflict_policy = ConfigValue::new(policy, ConfigSource::Environment);
        }

        Ok(Self {
            data_dir,
            server_url,
            channel,
            auth_token,
            user_id,
            namespace,
            conflict_policy,
            heartbeat_timeout_secs,
            config_file,
        })
    }

    /// Builds the sync client configuration.
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(self.server_url.value.clone())
            .with_channel(Channel::from_purpose(&self.channel.value))
            .with_namespace(self.namespace.value.clone())
            .with_conflict_policy(self.conflict_policy.value);
        if let Some(token) = &self.auth_token.value {
            config = config.with_auth_token(token.clone());
        }
        if let Some(user) = &self.user_id.value {
            config = config.with_user_id(user.clone());
        }
        if let Some(secs) = self.heartbeat_timeout_secs {
            config = config.with_heartbeat_timeout(Duration::from_secs(secs));
        }
        config
    }

    /// Storage rooted at the data directory.
    pub fn store(&self) -> FileStore {
        FileStore::new(self.data_dir.value.clone())
    }

    /// Copy safe to print: the auth token is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.auth_token.value.is_some() {
            config.auth_token.value = Some("********".to_string());
        }
        config
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/vsync/
    /// - macOS: ~/Library/Application Support/vsync/
    /// - Windows: %APPDATA%/vsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/vsync/
    /// - macOS: ~/Library/Application Support/vsync/
    /// - Windows: %APPDATA%/vsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(field, e) => write!(f, "Invalid {}: {}", field, e),
        }
    }
}

impl std::error::Error for ConfigError {}
