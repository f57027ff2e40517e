//! Configuration management for rollcall.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "rollcall";

/// Default service credential file name.
const CREDENTIAL_FILE_NAME: &str = "service-account.json";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `ROLLCALL_`)
/// 2. TOML config file at `~/.config/rollcall/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Invitation-code configuration.
    pub invitation: InvitationConfig,
    /// Attendance sync configuration.
    pub sync: SyncConfig,
    /// Push notification configuration.
    pub notify: NotifyConfig,
}

/// Invitation-code configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvitationConfig {
    /// Hours until a freshly generated code expires.
    ///
    /// The protocol has been observed with both 24h and 12h windows;
    /// 24h is the default here.
    pub expiry_hours: u32,
    /// How many code draws to attempt before giving up on a collision-free
    /// value.
    pub max_generate_attempts: u32,
}

/// Attendance sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum backoff interval for the scheduled reconciliation task,
    /// in seconds. The scheduler doubles this on each retry.
    pub min_backoff_secs: u64,
}

/// Push notification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Push gateway message endpoint.
    pub gateway_url: String,
    /// OAuth2 token endpoint for the JWT-bearer exchange.
    pub token_url: String,
    /// OAuth2 scope requested in the signed assertion.
    pub scope: String,
    /// Path to the service credential JSON file.
    /// Defaults to `~/.config/rollcall/service-account.json`.
    pub credential_path: Option<PathBuf>,
    /// Assertion validity window in seconds (the provider caps this at 1h).
    pub assertion_lifetime_secs: u64,
    /// How long before the provider-side expiry a cached bearer token is
    /// treated as stale.
    pub refresh_margin_secs: u64,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            expiry_hours: 24,
            max_generate_attempts: 10,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_backoff_secs: 10,
        }
    }
}

impl SyncConfig {
    /// The minimum sync backoff interval as a Duration.
    #[must_use]
    pub fn min_backoff(&self) -> Duration {
        Duration::from_secs(self.min_backoff_secs)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scope: "https://www.googleapis.com/auth/firebase.messaging".to_string(),
            credential_path: None,
            assertion_lifetime_secs: 3600,
            refresh_margin_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `ROLLCALL_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("ROLLCALL_").split("_"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.invitation.expiry_hours == 0 {
            return Err(Error::ConfigValidation {
                message: "invitation.expiry_hours must be greater than 0".to_string(),
            });
        }

        if self.invitation.max_generate_attempts == 0 {
            return Err(Error::ConfigValidation {
                message: "invitation.max_generate_attempts must be greater than 0".to_string(),
            });
        }

        if self.sync.min_backoff_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "sync.min_backoff_secs must be greater than 0".to_string(),
            });
        }

        if self.notify.refresh_margin_secs >= self.notify.assertion_lifetime_secs {
            return Err(Error::ConfigValidation {
                message: format!(
                    "notify.refresh_margin_secs ({}) must be less than assertion_lifetime_secs ({})",
                    self.notify.refresh_margin_secs, self.notify.assertion_lifetime_secs
                ),
            });
        }

        Ok(())
    }

    /// Get the credential path, resolving defaults if not set.
    #[must_use]
    pub fn credential_path(&self) -> PathBuf {
        self.notify.credential_path.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(".config"))
                .join(CONFIG_DIR_NAME)
                .join(CREDENTIAL_FILE_NAME)
        })
    }

    /// Get the code expiry window as a chrono Duration.
    #[must_use]
    pub fn code_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.invitation.expiry_hours))
    }

    /// Get the minimum sync backoff interval as a Duration.
    #[must_use]
    pub fn min_backoff(&self) -> Duration {
        self.sync.min_backoff()
    }

    /// Effective cached-token lifetime: provider lifetime minus the safety
    /// margin (55 minutes with the defaults).
    #[must_use]
    pub fn token_cache_lifetime_secs(&self) -> u64 {
        self.notify
            .assertion_lifetime_secs
            .saturating_sub(self.notify.refresh_margin_secs)
    }
}
