//! Configuration system for the `Contrimeter` store server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/contrimeter-store/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::token::{CallCredentials, DEFAULT_TOKEN_TTL};

/// Errors that can occur when loading store configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the store.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreConfigFile {
    server: ServerFileConfig,
    call: CallFileConfig,
}

/// `[server]` section of the store config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
}

/// `[call]` section of the store config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CallFileConfig {
    api_key: Option<String>,
    api_secret: Option<String>,
    server_url: Option<String>,
    token_ttl_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the store server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Contrimeter document store server")]
pub struct StoreCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "CONTRIMETER_STORE_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/contrimeter-store/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum size of one inbound WebSocket frame in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// SFU API key used to sign call tokens.
    #[arg(long, env = "LIVEKIT_API_KEY")]
    pub call_api_key: Option<String>,

    /// SFU API secret used to sign call tokens.
    #[arg(long, env = "LIVEKIT_API_SECRET", hide_env_values = true)]
    pub call_api_secret: Option<String>,

    /// SFU URL handed to clients together with a token.
    #[arg(long, env = "LIVEKIT_URL")]
    pub call_server_url: Option<String>,

    /// Call token lifetime in seconds.
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CONTRIMETER_STORE_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved store server configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// SFU credentials; `None` unless key, secret and URL are all set.
    pub call: Option<CallCredentials>,
    /// Call token lifetime.
    pub token_ttl: Duration,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            max_frame_size: 8 * 1024 * 1024,
            call: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            log_level: "info".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &StoreCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &StoreCliArgs, file: &StoreConfigFile) -> Self {
        let defaults = Self::default();

        let api_key = cli.call_api_key.clone().or_else(|| file.call.api_key.clone());
        let api_secret = cli
            .call_api_secret
            .clone()
            .or_else(|| file.call.api_secret.clone());
        let server_url = cli
            .call_server_url
            .clone()
            .or_else(|| file.call.server_url.clone());
        let call = match (api_key, api_secret, server_url) {
            (Some(api_key), Some(api_secret), Some(server_url)) => Some(CallCredentials {
                api_key,
                api_secret,
                server_url,
            }),
            _ => None,
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            call,
            token_ttl: cli
                .token_ttl_secs
                .or(file.call.token_ttl_secs)
                .map_or(defaults.token_ttl, Duration::from_secs),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the store.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<StoreConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(StoreConfigFile::default());
        };
        config_dir.join("contrimeter-store").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
