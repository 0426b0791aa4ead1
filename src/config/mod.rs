//! Ledger configuration: limits, canonical day zone, and backend selection.
//!
//! Loaded from `~/.usage-ledger/config.json` with environment overrides
//! (`USAGE_LEDGER_*`). Every field has a default, so a missing file yields a
//! working configuration backed by `~/.usage-ledger/usage.json`.

pub mod watcher;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::policy::DEFAULT_DAILY_LIMIT;

pub use watcher::{ConfigWatcher, Reload};

/// Fraction of the daily limit at or above which a warning is logged.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// Which persistence backend the ledger store uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local concurrent map. Nothing survives a restart.
    Memory,
    /// Single JSON file, rewritten atomically on every mutation (default).
    #[default]
    Json,
    /// SQLite database (requires the `store-sqlite` feature).
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "json" => Ok(BackendKind::Json),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(LedgerError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Ledger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Units a subject may consume per day. Non-positive values mean
    /// "always exhausted" and should not be used in normal operation.
    pub daily_limit: i64,
    /// Utilisation fraction in `(0, 1]` that triggers a warning.
    pub warning_threshold: f64,
    /// Canonical zone for day boundaries, as a UTC offset (`"+00:00"`).
    pub utc_offset: String,
    /// Persistence backend.
    pub backend: BackendKind,
    /// Store location. `None` uses the default under [`LedgerConfig::dir`].
    pub path: Option<PathBuf>,
    /// Log output format used by the binary.
    pub log_format: LogFormat,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            utc_offset: "+00:00".to_string(),
            backend: BackendKind::Json,
            path: None,
            log_format: LogFormat::Text,
        }
    }
}

impl LedgerConfig {
    /// Base directory: `~/.usage-ledger`.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".usage-ledger")
    }

    /// Default config file path: `~/.usage-ledger/config.json`.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path, then apply `.env` and environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with_env(&Self::path())
    }

    /// Load from `path` and apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = if path.exists() {
            Self::load_from_path(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config file without consulting the environment.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            LedgerError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Re-read `path` for a running process: file contents with the same
    /// environment overrides startup applied, validated.
    pub fn reload_from_path(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_path(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("USAGE_LEDGER_DAILY_LIMIT") {
            self.daily_limit = v.trim().parse().map_err(|_| {
                LedgerError::Config(format!("USAGE_LEDGER_DAILY_LIMIT is not an integer: {v}"))
            })?;
        }
        if let Ok(v) = std::env::var("USAGE_LEDGER_WARNING_THRESHOLD") {
            self.warning_threshold = v.trim().parse().map_err(|_| {
                LedgerError::Config(format!(
                    "USAGE_LEDGER_WARNING_THRESHOLD is not a number: {v}"
                ))
            })?;
        }
        if let Ok(v) = std::env::var("USAGE_LEDGER_UTC_OFFSET") {
            self.utc_offset = v.trim().to_string();
        }
        if let Ok(v) = std::env::var("USAGE_LEDGER_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Ok(v) = std::env::var("USAGE_LEDGER_PATH") {
            if !v.trim().is_empty() {
                self.path = Some(PathBuf::from(v.trim()));
            }
        }
        Ok(())
    }

    /// Reject offsets chrono cannot parse and thresholds outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        self.offset()?;
        if !self.warning_threshold.is_finite()
            || self.warning_threshold <= 0.0
            || self.warning_threshold > 1.0
        {
            return Err(LedgerError::Config(format!(
                "warning_threshold must be in (0, 1], got {}",
                self.warning_threshold
            )));
        }
        Ok(())
    }

    /// The canonical day zone as a fixed offset.
    pub fn offset(&self) -> Result<FixedOffset> {
        FixedOffset::from_str(self.utc_offset.trim()).map_err(|e| {
            LedgerError::Config(format!("invalid utc_offset '{}': {}", self.utc_offset, e))
        })
    }

    /// Effective store path for the configured backend.
    pub fn store_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match self.backend {
            BackendKind::Sqlite => Self::dir().join("usage.sqlite"),
            BackendKind::Memory | BackendKind::Json => Self::dir().join("usage.json"),
        }
    }
}
