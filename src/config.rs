//! TOML configuration for the buildwatch service.
//!
//! Layered model: an explicit path, then the `BUILDWATCH_CONFIG` environment
//! variable, then the standard system location, then compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV_VAR: &str = "BUILDWATCH_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/buildwatch/buildwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the buildwatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildwatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BuildwatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .detector
            .validate()
            .with_context(|| format!("invalid detector section in {}", path.display()))?;
        info!(path = %path.display(), "loaded buildwatch configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `BUILDWATCH_CONFIG` environment variable.
    /// 2. `/etc/buildwatch/buildwatch.toml`.
    /// 3. Fall back to compiled-in defaults.
    ///
    /// Files that exist but fail to load are returned alongside the config.
    /// This runs before logging is set up, so the caller reports them.
    pub fn load_or_default() -> (Self, Vec<ConfigFallback>) {
        let mut fallbacks = Vec::new();

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return (cfg, fallbacks),
                Err(e) => fallbacks.push(ConfigFallback::new(path, &e)),
            }
        }

        let system_path = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(&system_path) {
                Ok(cfg) => return (cfg, fallbacks),
                Err(e) => fallbacks.push(ConfigFallback::new(system_path, &e)),
            }
        }

        (Self::default(), fallbacks)
    }
}

/// A config file that was found but rejected by `load_or_default`.
#[derive(Debug, Clone)]
pub struct ConfigFallback {
    pub path: PathBuf,
    pub error: String,
}

impl ConfigFallback {
    fn new(path: PathBuf, error: &anyhow::Error) -> Self {
        Self {
            path,
            error: format!("{:#}", error),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the API binds to.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/buildwatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Tuning for the statistical detector and alert cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Trailing window for continuous sensors, in hours.
    pub window_hours: i64,
    /// Minimum readings in the window before a z-score is computed.
    pub min_samples: usize,
    /// `|z|` strictly above this raises a WARNING.
    pub warning_z: f64,
    /// `|z|` strictly above this raises a CRITICAL.
    pub critical_z: f64,
    /// Minimum minutes between two NEW alerts for one sensor.
    pub cooldown_minutes: i64,
    /// Reading value a status sensor reports when it is not operational.
    pub status_error_value: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_hours: 48,
            min_samples: 10,
            warning_z: 2.0,
            critical_z: 3.0,
            cooldown_minutes: 60,
            status_error_value: 0.0,
        }
    }
}

/// Longest accepted trailing window: one year.
pub const MAX_WINDOW_HOURS: i64 = 24 * 365;

/// Longest accepted alert cooldown: one year.
pub const MAX_COOLDOWN_MINUTES: i64 = 60 * 24 * 365;

impl DetectorConfig {
    /// Trailing window, saturating at `Duration::MAX` for out-of-range values.
    pub fn window(&self) -> Duration {
        Duration::try_hours(self.window_hours).unwrap_or(Duration::MAX)
    }

    /// Alert cooldown, saturating at `Duration::MAX` for out-of-range values.
    pub fn cooldown(&self) -> Duration {
        Duration::try_minutes(self.cooldown_minutes).unwrap_or(Duration::MAX)
    }

    /// Reject settings that would make the detector meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WINDOW_HOURS).contains(&self.window_hours) {
            bail!(
                "window_hours must be between 1 and {}, got {}",
                MAX_WINDOW_HOURS,
                self.window_hours
            );
        }
        if !(0..=MAX_COOLDOWN_MINUTES).contains(&self.cooldown_minutes) {
            bail!(
                "cooldown_minutes must be between 0 and {}, got {}",
                MAX_COOLDOWN_MINUTES,
                self.cooldown_minutes
            );
        }
        if self.min_samples < 2 {
            bail!("min_samples must be at least 2, got {}", self.min_samples);
        }
        if !(self.warning_z >= 0.0 && self.warning_z < self.critical_z) {
            bail!(
                "warning_z ({}) must be non-negative and below critical_z ({})",
                self.warning_z,
                self.critical_z
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
