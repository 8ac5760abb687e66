//! Global configuration parsing and validation for both binaries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Default branch prefix used when a session does not specify one.
pub const DEFAULT_BRANCH_PREFIX: &str = "fog";

/// Per-tool default model overrides, keyed by tool name.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolModels {
    /// Arbitrary tool name → default model.
    #[serde(flatten)]
    pub models: HashMap<String, String>,
}

/// Global configuration for the local daemon (`fogd`), parsed from
/// `<fog_home>/config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory for all daemon state (db, keys, repos, worktrees).
    pub fog_home: PathBuf,
    /// Tool name used when a session does not specify one.
    #[serde(default = "default_tool")]
    pub default_tool: String,
    /// Per-tool default model overrides.
    #[serde(default)]
    pub tool_models: ToolModels,
    /// Branch prefix used when a session's prompt is slugged into a branch name.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Bind address for the local HTTP API, e.g. `127.0.0.1:4173`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Whether new sessions default to opening a draft PR.
    #[serde(default)]
    pub autopr_default: bool,
    /// Cloud relay base URL, if this daemon participates in the relay (C8).
    pub cloud_base_url: Option<String>,
}

fn default_tool() -> String {
    "claude".to_string()
}

fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:4173".to_string()
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute path to `fog_home`.
    #[must_use]
    pub fn fog_home(&self) -> &Path {
        &self.fog_home
    }

    /// Path to the core `SQLite` database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.fog_home.join("fog.db")
    }

    /// Path to the 32-byte AES-GCM master key (mode 0600).
    #[must_use]
    pub fn master_key_path(&self) -> PathBuf {
        self.fog_home.join("master.key")
    }

    /// Path to the local HTTP API's bearer token file (mode 0600).
    #[must_use]
    pub fn api_token_path(&self) -> PathBuf {
        self.fog_home.join("api.token")
    }

    /// Root directory under which per-repo bare clones and base worktrees live.
    #[must_use]
    pub fn repos_root(&self) -> PathBuf {
        self.fog_home.join("repos")
    }

    fn validate(&mut self) -> Result<()> {
        if self.default_tool.trim().is_empty() {
            return Err(AppError::Config("default_tool must not be empty".into()));
        }
        if self.branch_prefix.trim().is_empty() {
            self.branch_prefix = DEFAULT_BRANCH_PREFIX.to_string();
        }
        if self.fog_home.as_os_str().is_empty() {
            return Err(AppError::Config("fog_home must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration for the cloud relay server (`fogcloud`), parsed from
/// `<cloud_data_dir>/config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CloudConfig {
    /// Root directory for the cloud relay's database and master key.
    pub cloud_data_dir: PathBuf,
    /// Slack signing secret used to verify `POST /slack/events` requests.
    pub slack_signing_secret: String,
    /// Slack OAuth client id, used by the install/callback endpoints.
    pub slack_client_id: String,
    /// Slack OAuth client secret.
    pub slack_client_secret: String,
    /// Bind address for the cloud HTTP API.
    #[serde(default = "default_cloud_bind_addr")]
    pub bind_addr: String,
    /// Default pairing request TTL, in seconds.
    #[serde(default = "default_pairing_ttl_secs")]
    pub pairing_ttl_secs: u64,
}

fn default_cloud_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_pairing_ttl_secs() -> u64 {
    600
}

impl CloudConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path to the cloud relay's `SQLite` database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.cloud_data_dir.join("fogcloud.db")
    }

    /// Path to the cloud-local AES-GCM master key used to seal bot tokens.
    #[must_use]
    pub fn master_key_path(&self) -> PathBuf {
        self.cloud_data_dir.join("master.key")
    }

    fn validate(&self) -> Result<()> {
        if self.slack_signing_secret.trim().is_empty() {
            return Err(AppError::Config(
                "slack_signing_secret must not be empty".into(),
            ));
        }
        if self.pairing_ttl_secs == 0 {
            return Err(AppError::Config("pairing_ttl_secs must be > 0".into()));
        }
        Ok(())
    }
}
