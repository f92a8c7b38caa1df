//! Configuration loading using Figment.
//!
//! Settings are merged from:
//! 1. `config/acq_chain.toml` (or the file given on the command line)
//! 2. Environment variables prefixed with `ACQ_CHAIN_`, nested keys separated
//!    by `__` (`ACQ_CHAIN_CHAIN__PARALLEL_PREPARE=true`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use acq_chain::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), acq_chain::error::AcqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AcqError, AcqResult};
use crate::events::DEFAULT_EVENT_CAPACITY;

/// Default settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/acq_chain.toml";

/// Prefix of the environment overrides.
pub const ENV_PREFIX: &str = "ACQ_CHAIN_";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub chain: ChainSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Scheduler settings applied to every chain built from this configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Prepare all depths at once instead of level by level
    #[serde(default)]
    pub parallel_prepare: bool,
    /// Events buffered per subscriber before old ones are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Simulated step scan run by `acq-chain run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_npoints")]
    pub npoints: usize,
    #[serde(default)]
    pub start: f64,
    #[serde(default = "default_stop")]
    pub stop: f64,
    /// Integration time per point
    #[serde(default = "default_count_time_ms")]
    pub count_time_ms: u64,
    /// Names of the simulated counters
    #[serde(default = "default_counters")]
    pub counters: Vec<String>,
}

impl SimulationSettings {
    pub fn count_time(&self) -> Duration {
        Duration::from_millis(self.count_time_ms)
    }
}

// Default value functions
fn default_name() -> String {
    "acq-chain".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_npoints() -> usize {
    10
}

fn default_stop() -> f64 {
    1.0
}

fn default_count_time_ms() -> u64 {
    10
}

fn default_counters() -> Vec<String> {
    vec!["diode".to_string()]
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            parallel_prepare: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            npoints: default_npoints(),
            start: 0.0,
            stop: default_stop(),
            count_time_ms: default_count_time_ms(),
            counters: default_counters(),
        }
    }
}

impl Settings {
    /// Load from the default file and the environment
    pub fn load() -> AcqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AcqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.chain.event_capacity == 0 {
            return Err(AcqError::Configuration(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        if self.simulation.npoints == 0 {
            return Err(AcqError::Configuration(
                "simulation.npoints must be greater than 0".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for counter in &self.simulation.counters {
            if !names.insert(counter) {
                return Err(AcqError::Configuration(format!(
                    "Duplicate counter name: {}",
                    counter
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.chain.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(settings.simulation.count_time(), Duration::from_millis(10));
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[chain]\nparallel_prepare = true\n\n[simulation]\nnpoints = 3\ncounters = [\"a\", \"b\"]"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.chain.parallel_prepare);
        assert_eq!(settings.simulation.npoints, 3);
        assert_eq!(settings.simulation.counters, vec!["a", "b"]);
        assert_eq!(settings.application.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("ACQ_CHAIN_SIMULATION__NPOINTS", "7");
        let settings = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("ACQ_CHAIN_SIMULATION__NPOINTS");
        assert_eq!(settings.unwrap().simulation.npoints, 7);
    }

    #[test]
    fn test_invalid_values() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.simulation.counters = vec!["a".to_string(), "a".to_string()];
        assert!(matches!(
            settings.validate(),
            Err(AcqError::Configuration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_settings_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[simulation]\nnpoints = \"many\"").unwrap();
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(AcqError::Settings(_))
        ));
    }
}
