//! Throttle configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

const MIB: i64 = 1024 * 1024;

/// Write-admission throttle configuration.
///
/// Example YAML:
/// ```yaml
/// initial_rate_bytes_per_sec: 419430400
/// refill_period_us: 100000
/// tune_requests: 200000
/// reference_disk_rate_bytes_per_sec: 734003200
/// min_rate_bytes_per_sec: 10485760
/// fallback_io:
///   flush_bytes: 3
///   compaction_bytes: 97
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Target rate installed by `start()` (default: 400 MiB/s)
    #[serde(default = "default_initial_rate")]
    pub initial_rate_bytes_per_sec: i64,

    /// Interval between bucket credits (default: 100ms)
    #[serde(default = "default_refill_period_us")]
    pub refill_period_us: i64,

    /// Run a tuning cycle every N admitted requests (default: 200_000)
    #[serde(default = "default_tune_requests")]
    pub tune_requests: u64,

    /// Plausible device bandwidth used to bound the target (default: 700 MiB/s)
    #[serde(default = "default_reference_disk_rate")]
    pub reference_disk_rate_bytes_per_sec: i64,

    /// Floor for the write-amplification ceiling (default: 10 MiB/s). The
    /// committed target itself may drop below it under heavy backlog.
    #[serde(default = "default_min_rate")]
    pub min_rate_bytes_per_sec: i64,

    /// Background I/O pair substituted when engine statistics are disabled
    #[serde(default)]
    pub fallback_io: FallbackIoConfig,
}

/// Substitute flush/compaction byte counts used when the engine exposes no
/// cumulative I/O counters. Both values feed the blend weights, so the
/// default pair weights level-0 pressure at 97%.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackIoConfig {
    #[serde(default = "default_fallback_flush")]
    pub flush_bytes: u64,
    #[serde(default = "default_fallback_compaction")]
    pub compaction_bytes: u64,
}

impl Default for FallbackIoConfig {
    fn default() -> Self {
        Self {
            flush_bytes: default_fallback_flush(),
            compaction_bytes: default_fallback_compaction(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            initial_rate_bytes_per_sec: default_initial_rate(),
            refill_period_us: default_refill_period_us(),
            tune_requests: default_tune_requests(),
            reference_disk_rate_bytes_per_sec: default_reference_disk_rate(),
            min_rate_bytes_per_sec: default_min_rate(),
            fallback_io: FallbackIoConfig::default(),
        }
    }
}

fn default_initial_rate() -> i64 {
    400 * MIB
}

fn default_refill_period_us() -> i64 {
    100 * 1000
}

fn default_tune_requests() -> u64 {
    200 * 1000
}

fn default_reference_disk_rate() -> i64 {
    700 * MIB
}

fn default_min_rate() -> i64 {
    10 * MIB
}

fn default_fallback_flush() -> u64 {
    3
}

fn default_fallback_compaction() -> u64 {
    97
}

impl ThrottleConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::Parse(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Supported variables:
    /// - NORI_THROTTLE_INITIAL_RATE
    /// - NORI_THROTTLE_REFILL_PERIOD_US
    /// - NORI_THROTTLE_TUNE_REQUESTS
    /// - NORI_THROTTLE_REFERENCE_DISK_RATE
    /// - NORI_THROTTLE_MIN_RATE
    /// - NORI_THROTTLE_FALLBACK_FLUSH_BYTES
    /// - NORI_THROTTLE_FALLBACK_COMPACTION_BYTES
    pub fn load_from_env() -> Result<Self> {
        let mut config = ThrottleConfig::default();

        if let Some(v) = env_var("NORI_THROTTLE_INITIAL_RATE")? {
            config.initial_rate_bytes_per_sec = v;
        }
        if let Some(v) = env_var("NORI_THROTTLE_REFILL_PERIOD_US")? {
            config.refill_period_us = v;
        }
        if let Some(v) = env_var("NORI_THROTTLE_TUNE_REQUESTS")? {
            config.tune_requests = v;
        }
        if let Some(v) = env_var("NORI_THROTTLE_REFERENCE_DISK_RATE")? {
            config.reference_disk_rate_bytes_per_sec = v;
        }
        if let Some(v) = env_var("NORI_THROTTLE_MIN_RATE")? {
            config.min_rate_bytes_per_sec = v;
        }
        if let Some(v) = env_var("NORI_THROTTLE_FALLBACK_FLUSH_BYTES")? {
            config.fallback_io.flush_bytes = v;
        }
        if let Some(v) = env_var("NORI_THROTTLE_FALLBACK_COMPACTION_BYTES")? {
            config.fallback_io.compaction_bytes = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.refill_period_us <= 0 {
            return Err(Error::Config("refill_period_us must be > 0".to_string()));
        }

        if self.tune_requests == 0 {
            return Err(Error::Config("tune_requests must be > 0".to_string()));
        }

        if self.initial_rate_bytes_per_sec <= 0 {
            return Err(Error::Config(
                "initial_rate_bytes_per_sec must be > 0".to_string(),
            ));
        }

        if self.min_rate_bytes_per_sec <= 0 {
            return Err(Error::Config("min_rate_bytes_per_sec must be > 0".to_string()));
        }

        if self.reference_disk_rate_bytes_per_sec < self.min_rate_bytes_per_sec {
            return Err(Error::Config(format!(
                "reference_disk_rate_bytes_per_sec ({}) must be >= min_rate_bytes_per_sec ({})",
                self.reference_disk_rate_bytes_per_sec, self.min_rate_bytes_per_sec
            )));
        }

        if self.fallback_io.flush_bytes.saturating_add(self.fallback_io.compaction_bytes) == 0 {
            return Err(Error::Config(
                "fallback_io pair must not be all zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Parse(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}
