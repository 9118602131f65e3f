//! Configuration for redressal

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::DEFAULT_WRITE_RETRIES;
use crate::escalation::EscalationPolicy;
use crate::services::{ServiceSettings, DEFAULT_AUTO_CLOSE_AFTER_DAYS};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("redressal")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding grievances.db and config.toml
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HS256 secret shared with the auth service. Empty means dev mode.
    #[serde(default)]
    pub jwt_secret: String,

    /// Lifetime of tokens minted by `issue-token`
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,

    #[serde(default = "default_true")]
    pub require_proof_for_resolution: bool,

    /// Days a resolved grievance waits for citizen confirmation
    #[serde(default = "default_auto_close")]
    pub auto_close_after_days: i64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Retries for busy/locked store writes
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Kept last: it serializes as a `[escalation]` table
    #[serde(default)]
    pub escalation: EscalationPolicy,
}

fn default_http_port() -> u16 {
    8095
}

fn default_jwt_expiry() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_auto_close() -> i64 {
    DEFAULT_AUTO_CLOSE_AFTER_DAYS
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_write_retries() -> u32 {
    DEFAULT_WRITE_RETRIES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            jwt_secret: String::new(),
            jwt_expiry_seconds: default_jwt_expiry(),
            escalation: EscalationPolicy::default(),
            require_proof_for_resolution: true,
            auto_close_after_days: DEFAULT_AUTO_CLOSE_AFTER_DAYS,
            sweep_interval_secs: default_sweep_interval(),
            write_retries: DEFAULT_WRITE_RETRIES,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), String> {
        self.escalation.validate()?;
        if self.auto_close_after_days < 1 {
            return Err("auto_close_after_days must be at least 1".into());
        }
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be positive".into());
        }
        Ok(())
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            escalation: self.escalation,
            require_proof_for_resolution: self.require_proof_for_resolution,
            auto_close_after_days: self.auto_close_after_days,
        }
    }
}
