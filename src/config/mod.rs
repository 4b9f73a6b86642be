//! Configuration module
//!
//! Handles loading and saving NodeNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::login::{local_machine_hash, PasswordCredentials, PasswordValidator};
use crate::moderation::{FileModerationStore, ModerationError, DEFAULT_DEPARTED_CACHE};
use crate::network::{ClientConfig, ServerConfig, DEFAULT_CHAT_CHANNEL, DEFAULT_MUTE_NOTICE};
use crate::protocol::{DEFAULT_PORT, MAX_MESSAGE_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Ban store error: {0}")]
    Moderation(#[from] ModerationError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Login settings
    #[serde(default)]
    pub login: LoginConfig,

    /// Ban and mute settings
    #[serde(default)]
    pub moderation: ModerationConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name this node asks to be known by
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Player".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection and login timeout for clients, in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// How long a server waits for a login to finish, in ms
    #[serde(default = "default_login_timeout")]
    pub login_timeout_ms: u64,
    /// Heartbeat interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Maximum frame payload
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Whether a server admits new connections on startup
    #[serde(default = "default_true")]
    pub accept_new_connections: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_login_timeout() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            login_timeout_ms: default_login_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_message_size: default_max_message_size(),
            accept_new_connections: default_true(),
        }
    }
}

/// Login configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Shared game password; servers require it, clients answer with it
    pub password: Option<String>,
}

/// Moderation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Chat channel subject to mutes
    #[serde(default = "default_chat_channel")]
    pub chat_channel: String,
    /// Text returned to muted players
    #[serde(default = "default_mute_notice")]
    pub mute_notice: String,
    /// File keeping bans and mutes across restarts (in-memory if unset)
    pub ban_store: Option<PathBuf>,
    /// Departed players whose MAC hashes stay known
    #[serde(default = "default_departed_cache")]
    pub departed_cache: usize,
    /// How often expired entries are purged, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_chat_channel() -> String {
    DEFAULT_CHAT_CHANNEL.to_string()
}

fn default_mute_notice() -> String {
    DEFAULT_MUTE_NOTICE.to_string()
}

fn default_departed_cache() -> usize {
    DEFAULT_DEPARTED_CACHE
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            chat_channel: default_chat_channel(),
            mute_notice: default_mute_notice(),
            ban_store: None,
            departed_cache: default_departed_cache(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Where [`load_default`](Config::load_default) looks, in order
    pub fn search_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("nodenet/config.toml")),
            Some(PathBuf::from("./nodenet.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Server settings, opening the ban store if one is configured
    pub fn server_config(&self) -> ConfigResult<ServerConfig> {
        let mut server = ServerConfig::new(self.network.port, self.general.name.clone());
        server.login_timeout = Duration::from_millis(self.network.login_timeout_ms);
        server.max_message_size = self.network.max_message_size;
        server.accept_new_connections = self.network.accept_new_connections;
        server.chat_channel = self.moderation.chat_channel.clone();
        server.mute_notice = self.moderation.mute_notice.clone();
        server.sweep_interval = Duration::from_secs(self.moderation.sweep_interval_secs.max(1));
        server.departed_cache = self.moderation.departed_cache;

        if let Some(password) = &self.login.password {
            server = server.with_validator(Arc::new(PasswordValidator::new(password.clone())));
        }
        if let Some(path) = &self.moderation.ban_store {
            server = server.with_store(Arc::new(FileModerationStore::open(path)?));
        }
        Ok(server)
    }

    /// Client settings for connecting to `host`
    pub fn client_config(&self, host: &str) -> ClientConfig {
        let mut client = ClientConfig::new(host, self.network.port, self.general.name.clone())
            .with_mac_hash(local_machine_hash())
            .with_connect_timeout(Duration::from_millis(self.network.connect_timeout_ms));
        client.heartbeat_interval = Duration::from_millis(self.network.heartbeat_interval_ms.max(1));
        client.max_message_size = self.network.max_message_size;

        if let Some(password) = &self.login.password {
            client = client.with_credentials(Arc::new(PasswordCredentials::new(password.clone())));
        }
        client
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Host".to_string(),
            verbose: false,
        },
        login: LoginConfig {
            password: Some("change-me".to_string()),
        },
        moderation: ModerationConfig {
            ban_store: Some(PathBuf::from("bans.toml")),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.moderation.chat_channel, DEFAULT_CHAT_CHANNEL);
        assert!(config.login.password.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.port = 4400;
        config.login.password = Some("pw".into());
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 4400);
        assert_eq!(loaded.login.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[network]\nport = 9000\n").unwrap();
        assert_eq!(parsed.network.port, 9000);
        assert_eq!(parsed.network.connect_timeout_ms, 10_000);
        assert_eq!(parsed.moderation.departed_cache, DEFAULT_DEPARTED_CACHE);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "Host");
        assert_eq!(parsed.moderation.ban_store, Some(PathBuf::from("bans.toml")));
    }

    #[test]
    fn test_runtime_configs() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.general.name = "Host".into();
        config.network.login_timeout_ms = 1500;
        config.moderation.ban_store = Some(dir.path().join("bans.toml"));

        let server = config.server_config().unwrap();
        assert_eq!(server.name, "Host");
        assert_eq!(server.login_timeout, Duration::from_millis(1500));

        let client = config.client_config("example.org");
        assert_eq!(client.host, "example.org");
        assert_eq!(client.connect_timeout, Duration::from_secs(10));
    }
}
