//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `KEY_PATH`, `SOCKET_PATH`, `SPARK_PORT`,
//!    `LOG_PORT`, `LOG_PATH`, `LOG_SAVE_FILES`
//! 2. **Config file** — path via `--config <path>`, or `podcloud.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [spark]
//! port = 5683
//! request_timeout_secs = 10
//!
//! [logs]
//! port = 1337
//! path = "./logs"
//! save_files = false
//!
//! [api]
//! listen = "0.0.0.0:1115"
//!
//! [keys]
//! key_path = "key.pem"
//!
//! [control]
//! socket_path = "/deviceinfo/dac.sock"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub spark: SparkConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device-facing CoAP-over-TCP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SparkConfig {
    /// TCP port pods dial for the encrypted CoAP channel (default 5683).
    #[serde(default = "default_spark_port")]
    pub port: u16,
    /// Seconds to wait for a device to acknowledge an outbound request
    /// before failing it (default 10). The session itself stays up.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Log-upload listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// TCP port pods dial for bulk log uploads (default 1337).
    #[serde(default = "default_log_port")]
    pub port: u16,
    /// Directory where completed batches are written as `<id>.RAW`.
    /// Override with `LOG_PATH`.
    #[serde(default = "default_log_path")]
    pub path: String,
    /// Persist uploaded batches to disk (default false — ingest and discard).
    /// Override with `LOG_SAVE_FILES=true`.
    #[serde(default)]
    pub save_files: bool,
}

/// HTTP API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Socket address for the JSON status API (default `0.0.0.0:1115`).
    #[serde(default = "default_api_listen")]
    pub listen: String,
}

/// Server key material.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Path to the PKCS#8 PEM RSA private key. Override with `KEY_PATH`.
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

/// Unix control-socket settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Path of the unix socket each session dials for operator commands.
    /// Override with `SOCKET_PATH`.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_spark_port() -> u16 {
    5683
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_log_port() -> u16 {
    1337
}
fn default_log_path() -> String {
    "./logs".to_string()
}
fn default_api_listen() -> String {
    "0.0.0.0:1115".to_string()
}
fn default_key_path() -> String {
    "key.pem".to_string()
}
fn default_socket_path() -> String {
    "/deviceinfo/dac.sock".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SparkConfig {
    fn default() -> Self {
        Self {
            port: default_spark_port(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            port: default_log_port(),
            path: default_log_path(),
            save_files: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spark: SparkConfig::default(),
            logs: LogConfig::default(),
            api: ApiConfig::default(),
            keys: KeyConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `podcloud.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("podcloud.toml").exists() {
            let content =
                std::fs::read_to_string("podcloud.toml").expect("Failed to read podcloud.toml");
            toml::from_str(&content).expect("Failed to parse podcloud.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(path) = std::env::var("KEY_PATH") {
            config.keys.key_path = path;
        }
        if let Ok(path) = std::env::var("SOCKET_PATH") {
            config.control.socket_path = path;
        }
        if let Ok(port) = std::env::var("SPARK_PORT") {
            match port.parse() {
                Ok(port) => config.spark.port = port,
                Err(_) => eprintln!("Ignoring invalid SPARK_PORT: {port}"),
            }
        }
        if let Ok(port) = std::env::var("LOG_PORT") {
            match port.parse() {
                Ok(port) => config.logs.port = port,
                Err(_) => eprintln!("Ignoring invalid LOG_PORT: {port}"),
            }
        }
        if let Ok(path) = std::env::var("LOG_PATH") {
            config.logs.path = path;
        }
        if let Ok(save) = std::env::var("LOG_SAVE_FILES") {
            config.logs.save_files = save == "true";
        }

        config
    }
}
