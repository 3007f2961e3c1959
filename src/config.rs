use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "fetchbridge.toml";

/// chrome.storage.local enforces 8 KiB per item; the sqlite backend mirrors
/// that ceiling so chunking behaves the same against both stores.
pub const DEFAULT_ITEM_SIZE_LIMIT: usize = 8192;
pub const DEFAULT_CHUNK_SIZE: usize = 7500;
pub const DEFAULT_SIGNAL_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Port for the persistent bridge channel. `None` disables the bridge
    /// listener; `0` picks an ephemeral port.
    #[serde(default)]
    pub bridge_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Identity-provider refresh endpoint, e.g. `https://idp.example/auth/refresh`.
    pub refresh_url: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_item_size_limit")]
    pub item_size_limit: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    /// Capacity of the lifecycle-signal channel feeding the correlator loop.
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_item_size_limit() -> usize {
    DEFAULT_ITEM_SIZE_LIMIT
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_signal_buffer() -> usize {
    DEFAULT_SIGNAL_BUFFER
}

impl Config {
    /// Loads config from the given path, or from `./fetchbridge.toml` when no
    /// path is given and that file exists. Without either, built-in defaults
    /// apply (loopback listener, no auth, no durable storage).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
                if default_path.exists() {
                    Self::from_path(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn item_size_limit(&self) -> usize {
        self.storage
            .as_ref()
            .map(|storage| storage.item_size_limit)
            .unwrap_or(DEFAULT_ITEM_SIZE_LIMIT)
    }

    pub fn chunk_size(&self) -> usize {
        self.storage
            .as_ref()
            .map(|storage| storage.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn signal_buffer(&self) -> usize {
        self.capture
            .as_ref()
            .map(|capture| capture.signal_buffer)
            .unwrap_or(DEFAULT_SIGNAL_BUFFER)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen: SocketAddr::from(([127, 0, 0, 1], 7733)),
                bridge_port: None,
            },
            auth: None,
            storage: None,
            capture: None,
            logging: None,
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).context("parse config TOML")?;
        if config.chunk_size() == 0 {
            anyhow::bail!("storage.chunk_size must be greater than zero");
        }
        if config.chunk_size() >= config.item_size_limit() {
            anyhow::bail!(
                "storage.chunk_size ({}) must be smaller than storage.item_size_limit ({})",
                config.chunk_size(),
                config.item_size_limit()
            );
        }
        Ok(config)
    }
}
