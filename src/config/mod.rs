//! # Configuration Module
//!
//! This module handles loading and validating configuration from
//! environment variables. All settings are centralized here.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `OWNER_KEYPAIR_PATH` | Owner (root) keypair file | `~/.config/solana/id.json` |
//! | `BALANCE_POLL_INTERVAL` | Balance/upgrade poll cadence (seconds) | `30` |
//! | `SWAP_COOLDOWN_SECS` | Minimum gap between swap attempts | `45` |
//! | `BILL_TIMEOUT_SECS` | Foreground bill presentation window | `50` |

use std::env;
use std::fs;

use solana_sdk::signature::Keypair;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Failed to parse a value.
    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),

    /// The owner keypair file could not be read or decoded.
    #[error("Failed to load keypair from {0}: {1}")]
    KeypairError(String, String),
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the owner's root keypair file. Every sub-account in the
    /// tray is derived from this key.
    pub owner_keypair_path: String,

    /// How often to poll balances and run the privacy-upgrade pipeline
    /// (in seconds).
    pub balance_poll_interval: u64,

    /// Minimum gap between swap-conversion attempts (in seconds).
    /// Prevents redundant concurrent conversions when balance is
    /// polled frequently.
    pub swap_cooldown_secs: u64,

    /// Wall-clock window for a foreground bill presentation, after
    /// which the pending send is cancelled client-side (in seconds).
    pub bill_timeout_secs: u64,
}

impl EngineConfig {
    /// Load configuration from environment variables. Values may also
    /// be supplied via a `.env` file in the working directory.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            owner_keypair_path: get_env_or_default(
                "OWNER_KEYPAIR_PATH",
                "~/.config/solana/id.json",
            ),
            balance_poll_interval: parse_env("BALANCE_POLL_INTERVAL", 30)?,
            swap_cooldown_secs: parse_env("SWAP_COOLDOWN_SECS", 45)?,
            bill_timeout_secs: parse_env("BILL_TIMEOUT_SECS", 50)?,
        })
    }

    /// Load the owner keypair from the configured path.
    ///
    /// The file is expected in the standard JSON byte-array format.
    pub fn load_owner_keypair(&self) -> Result<Keypair, ConfigError> {
        let expanded = shellexpand::full(&self.owner_keypair_path).map_err(|e| {
            ConfigError::KeypairError(self.owner_keypair_path.clone(), e.to_string())
        })?;

        let raw = fs::read_to_string(expanded.as_ref()).map_err(|e| {
            ConfigError::KeypairError(self.owner_keypair_path.clone(), e.to_string())
        })?;

        let bytes: Vec<u8> = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::KeypairError(self.owner_keypair_path.clone(), e.to_string())
        })?;

        Keypair::from_bytes(&bytes).map_err(|e| {
            ConfigError::KeypairError(self.owner_keypair_path.clone(), e.to_string())
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner_keypair_path: "~/.config/solana/id.json".to_string(),
            balance_poll_interval: 30,
            swap_cooldown_secs: 45,
            bill_timeout_secs: 50,
        }
    }
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse a numeric environment variable, falling back to a default when
/// unset and erroring when set but unparseable.
fn parse_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| ConfigError::ParseError(key.to_string(), format!("{e}"))),
        Err(_) => Ok(default),
    }
}
