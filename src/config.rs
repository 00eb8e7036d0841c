//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. `config/echem.toml` (optional)
//! 3. Environment variables prefixed with `ECHEM_`, nested with `__`
//!
//! ```text
//! ECHEM_APPLICATION__LOG_LEVEL=debug
//! ECHEM_STORAGE__SESSIONS_DIR=/data/sessions
//! ECHEM_INSTRUMENT__DISCOVERY_TIMEOUT_MS=2000
//! ```

use crate::error::{AppResult, EchemError};
use crate::instrument::mock::MockConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/echem.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Application identity and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Plan and session locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instrument timing
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Simulated potentiostat used when no hardware driver is linked in
    #[serde(default)]
    pub mock: MockConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Name reported at startup
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "echem_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Where plans and sessions live on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding `{name}.json` plan documents
    #[serde(default = "default_plans_dir")]
    pub plans_dir: PathBuf,
    /// Parent directory of all session directories
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            plans_dir: default_plans_dir(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

/// Instrument collaborator timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    /// Upper bound on channel discovery
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
    /// Upper bound on a single measurement. Unbounded when absent.
    #[serde(default)]
    pub measurement_timeout_ms: Option<u64>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout(),
            measurement_timeout_ms: None,
        }
    }
}

impl InstrumentConfig {
    /// Discovery limit as a `Duration`.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Per-measurement limit, if configured.
    pub fn measurement_timeout(&self) -> Option<Duration> {
        self.measurement_timeout_ms.map(Duration::from_millis)
    }
}

fn default_plans_dir() -> PathBuf {
    PathBuf::from("plans")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_discovery_timeout() -> u64 {
    10_000
}

impl Settings {
    /// Load from the default config path and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ECHEM_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(EchemError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.discovery_timeout_ms == 0 {
            return Err(EchemError::Configuration(
                "discovery_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.mock.batch_size == 0 {
            return Err(EchemError::Configuration(
                "mock.batch_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("missing.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            assert_eq!(settings.instrument.discovery_timeout_ms, 10_000);
            assert_eq!(settings.storage.plans_dir, PathBuf::from("plans"));
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "echem.toml",
                r#"
                [storage]
                sessions_dir = "runs"

                [instrument]
                discovery_timeout_ms = 2500
                "#,
            )?;
            jail.set_env("ECHEM_APPLICATION__LOG_LEVEL", "debug");
            jail.set_env("ECHEM_MOCK__CHANNELS", "4");

            let settings = Settings::load_from("echem.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.storage.sessions_dir, PathBuf::from("runs"));
            assert_eq!(settings.storage.plans_dir, PathBuf::from("plans"));
            assert_eq!(settings.instrument.discovery_timeout_ms, 2500);
            assert_eq!(settings.application.log_level, "debug");
            assert_eq!(settings.mock.channels, 4);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("ECHEM_APPLICATION__LOG_LEVEL", "loud");
            let err = Settings::load_from("missing.toml").unwrap_err();
            assert!(matches!(err, EchemError::Configuration(_)));
            Ok(())
        });
    }

    #[test]
    fn test_zero_discovery_timeout_rejected() {
        let mut settings = Settings::default();
        settings.instrument.discovery_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }
}
