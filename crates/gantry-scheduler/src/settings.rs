//! Scheduler settings.

use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the scheduling engine.
///
/// Loaded from an optional YAML file, then overridden by `GANTRY_*`
/// environment variables (`GANTRY_FANIN_BACKTRACK_LIMIT`,
/// `GANTRY_HUNG_JOB_THRESHOLD_SECS`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How many older upstream runs fan-in may try before giving up.
    #[serde(default = "default_fanin_backtrack_limit")]
    pub fanin_backtrack_limit: usize,
    /// A building job with no transition for this long is rescheduled.
    #[serde(default = "default_hung_job_threshold_secs")]
    pub hung_job_threshold_secs: u64,
    /// Interval between scheduling ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Attempts for a config write before giving up.
    #[serde(default = "default_config_write_attempts")]
    pub config_write_attempts: u32,
    /// Initial delay between config write attempts; doubles on each retry.
    #[serde(default = "default_config_write_backoff_ms")]
    pub config_write_backoff_ms: u64,
}

fn default_fanin_backtrack_limit() -> usize {
    100
}

fn default_hung_job_threshold_secs() -> u64 {
    300
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_config_write_attempts() -> u32 {
    5
}

fn default_config_write_backoff_ms() -> u64 {
    50
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            fanin_backtrack_limit: default_fanin_backtrack_limit(),
            hung_job_threshold_secs: default_hung_job_threshold_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            config_write_attempts: default_config_write_attempts(),
            config_write_backoff_ms: default_config_write_backoff_ms(),
        }
    }
}

impl SchedulerSettings {
    /// Load settings from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, config::Environment::with_prefix("GANTRY"))
    }

    fn load_with(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(environment.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(format!("scheduler settings: {}", e)))
    }

    pub fn hung_job_threshold(&self) -> Duration {
        Duration::from_secs(self.hung_job_threshold_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn config_write_backoff(&self) -> Duration {
        Duration::from_millis(self.config_write_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("GANTRY").source(Some(source))
    }

    #[test]
    fn test_defaults() {
        let settings = SchedulerSettings::load_with(None, env(&[])).unwrap();
        assert_eq!(settings, SchedulerSettings::default());
        assert_eq!(settings.fanin_backtrack_limit, 100);
        assert_eq!(settings.hung_job_threshold(), Duration::from_secs(300));
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "fanin_backtrack_limit: 20\nhung_job_threshold_secs: 60").unwrap();

        let settings = SchedulerSettings::load_with(
            Some(file.path()),
            env(&[("GANTRY_HUNG_JOB_THRESHOLD_SECS", "90")]),
        )
        .unwrap();

        assert_eq!(settings.fanin_backtrack_limit, 20);
        assert_eq!(settings.hung_job_threshold_secs, 90);
        assert_eq!(settings.config_write_attempts, 5);
    }
}
