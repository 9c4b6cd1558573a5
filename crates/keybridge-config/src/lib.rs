#![warn(missing_docs)]

//! # keybridge-config
//!
//! Configuration loading for keybridge hosts.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [bridge]
//! call_timeout_secs = 30
//! storage_timeout_secs = 10
//! max_message_size_mb = 64
//!
//! [worker]
//! path = "/usr/local/bin/keybridge-worker"
//!
//! [storage]
//! backend = "file"
//! dir = "${HOME}/.keybridge"
//!
//! [client]
//! client_id = "my-app"
//! network = "devnet"
//! key_type = "ed25519"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level keybridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeybridgeConfig {
    /// Bridge timing and framing settings.
    #[serde(default)]
    pub bridge: BridgeOverrides,

    /// Sandbox worker process settings.
    #[serde(default)]
    pub worker: WorkerOverrides,

    /// Host-side storage backend selection.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Options forwarded to the engine when an instance is created.
    #[serde(default)]
    pub client: ClientSettings,
}

/// Bridge configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeOverrides {
    /// Deadline for a host → sandbox call, in seconds.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,

    /// Deadline for a sandbox → host storage call, in seconds.
    #[serde(default)]
    pub storage_timeout_secs: Option<u64>,

    /// Maximum size of a single framed message in megabytes.
    #[serde(default)]
    pub max_message_size_mb: Option<usize>,
}

/// Worker process overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOverrides {
    /// Absolute path of the `keybridge-worker` binary.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Backend kind: "memory" (default) or "file".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Directory for the file backend.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dir: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

/// Engine options supplied by the host application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientSettings {
    /// Application client identifier (required by the engine).
    #[serde(default)]
    pub client_id: Option<String>,

    /// Network: "devnet" or "mainnet".
    #[serde(default)]
    pub network: Option<String>,

    /// Key type: "ed25519" or "secp256k1".
    #[serde(default)]
    pub key_type: Option<String>,

    /// Defer metadata writes until `commit_changes`.
    #[serde(default)]
    pub manual_sync: Option<bool>,
}

impl KeybridgeConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: KeybridgeConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("call_timeout_secs", self.bridge.call_timeout_secs),
            ("storage_timeout_secs", self.bridge.storage_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "bridge.{}: must be greater than zero",
                    name
                )));
            }
        }
        if self.bridge.max_message_size_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "bridge.max_message_size_mb: must be greater than zero".into(),
            ));
        }

        if let Some(path) = &self.worker.path {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "worker.path must be an absolute path, got: {}",
                    path.display()
                )));
            }
        }

        match self.storage.backend.as_str() {
            "memory" => {}
            "file" => {
                if self.storage.dir.is_none() {
                    return Err(ConfigError::Invalid(
                        "storage: file backend requires 'dir'".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "storage: unsupported backend '{}', supported: memory, file",
                    other
                )));
            }
        }

        if let Some(network) = self.client.network.as_deref() {
            if !matches!(network, "devnet" | "mainnet") {
                return Err(ConfigError::Invalid(format!(
                    "client: unsupported network '{}', supported: devnet, mainnet",
                    network
                )));
            }
        }
        if let Some(key_type) = self.client.key_type.as_deref() {
            if !matches!(key_type, "ed25519" | "secp256k1") {
                return Err(ConfigError::Invalid(format!(
                    "client: unsupported key_type '{}', supported: ed25519, secp256k1",
                    key_type
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // unresolved placeholders are kept verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
