use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

pub const TOKEN_ENV: &str = "LISTEN_MOE_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Preferences record (volume, channel, notification toggles).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Reconnect delay after a deliberate channel-switch close.
    #[serde(default = "default_switch_reconnect_ms")]
    pub switch_reconnect_ms: u64,
    /// Reconnect delay after any other close.
    #[serde(default = "default_failure_reconnect_ms")]
    pub failure_reconnect_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,
    #[serde(default = "default_cover_base_url")]
    pub cover_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token for favorites.  Without one the session never shows favorites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Play the stream through an mpv child process.
    #[serde(default = "default_mpv_enabled")]
    pub enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            switch_reconnect_ms: default_switch_reconnect_ms(),
            failure_reconnect_ms: default_failure_reconnect_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            graphql_url: default_graphql_url(),
            cover_base_url: default_cover_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            enabled: default_mpv_enabled(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_switch_reconnect_ms() -> u64 {
    500
}

fn default_failure_reconnect_ms() -> u64 {
    5000
}

fn default_graphql_url() -> String {
    "https://listen.moe/graphql".to_string()
}

fn default_cover_base_url() -> String {
    "https://cdn.listen.moe/covers/".to_string()
}

fn default_user_agent() -> String {
    format!("listen-moe-daemon/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8969
}

fn default_mpv_enabled() -> bool {
    true
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml_str(&content)?
        } else {
            let config = Self::default();
            config.save()?;
            config
        };

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            config.auth.token = Some(token).filter(|t| !t.trim().is_empty());
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
