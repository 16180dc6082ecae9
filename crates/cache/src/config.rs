//! Configuration for bundle cache planning.
//!
//! Holds the scalar knobs read once when a planning session is constructed:
//! budget fragmentation compensation, yielding, thrashing prevention, the
//! pipeline depth used as the yielding safety margin, the device topology and
//! the all-required size threshold of the requirement analysis. Configuration
//! can be loaded from a file, environment variables, or created
//! programmatically.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Policy for turning reclaim dependencies into ordering edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThrashingPreventionMode {
    /// Add an edge for every dependency that is not already implied by data flow
    #[default]
    AddAll,
    /// Skip edges between operations running on the same engine
    SkipSameEngine,
    /// Never add edges
    Disabled,
}

impl ThrashingPreventionMode {
    /// Parse the numeric form used by the environment and file formats.
    pub fn from_level(level: u32) -> Option<Self> {
        match level {
            0 => Some(Self::AddAll),
            1 => Some(Self::SkipSameEngine),
            2 => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn level(&self) -> u32 {
        match self {
            Self::AddAll => 0,
            Self::SkipSameEngine => 1,
            Self::Disabled => 2,
        }
    }
}

/// Configuration for a bundle cache planning session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePlannerConfig {
    /// Fraction of the raw budget usable for allocations (0.0 to 1.0)
    pub fragmentation_factor: f64,
    /// Retroactively release not-yet-consumed buffers when an allocation fails
    pub enable_yielding: bool,
    pub thrashing_prevention_mode: ThrashingPreventionMode,
    /// Lanes closer than this to the current one are never yielded
    pub pipeline_depth: u32,
    /// All-required inputs above this size in bytes are not cached
    pub all_required_size_threshold: u64,
    /// Number of accelerator cores sharing the cache
    pub num_dcores: u32,
}

impl Default for CachePlannerConfig {
    fn default() -> Self {
        Self {
            fragmentation_factor: 0.9,
            enable_yielding: true,
            thrashing_prevention_mode: ThrashingPreventionMode::AddAll,
            pipeline_depth: 2,
            all_required_size_threshold: 8 * 1024 * 1024, // 8 MB
            num_dcores: 4,
        }
    }
}

impl CachePlannerConfig {
    /// Sets the fragmentation compensation factor, clamped to 0.0..=1.0.
    pub fn with_fragmentation_factor(mut self, factor: f64) -> Self {
        self.fragmentation_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_yielding(mut self, enabled: bool) -> Self {
        self.enable_yielding = enabled;
        self
    }

    pub fn with_thrashing_prevention_mode(mut self, mode: ThrashingPreventionMode) -> Self {
        self.thrashing_prevention_mode = mode;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: u32) -> Self {
        self.pipeline_depth = depth;
        self
    }

    pub fn with_all_required_size_threshold(mut self, bytes: u64) -> Self {
        self.all_required_size_threshold = bytes;
        self
    }

    pub fn with_num_dcores(mut self, dcores: u32) -> Self {
        self.num_dcores = dcores.max(1);
        self
    }

    /// Budget left for allocations once fragmentation is compensated for.
    pub fn effective_budget(&self, budget: u64) -> u64 {
        (budget as f64 * self.fragmentation_factor).floor() as u64
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BUNDLE_CACHE_FRAGMENTATION_FACTOR`: usable budget fraction (default: 0.9)
    /// - `BUNDLE_CACHE_ENABLE_YIELDING`: `true`/`false` or `1`/`0` (default: true)
    /// - `BUNDLE_CACHE_THRASHING_PREVENTION_MODE`: 0, 1 or 2 (default: 0)
    /// - `BUNDLE_CACHE_PIPELINE_DEPTH`: yielding safety margin in lanes (default: 2)
    /// - `BUNDLE_CACHE_ALL_REQUIRED_THRESHOLD`: size in bytes (default: 8 MB)
    /// - `BUNDLE_CACHE_NUM_DCORES`: accelerator cores (default: 4)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (var, key) in ENV_KEYS {
            if let Ok(value) = std::env::var(var) {
                config.set(key, value.trim()).map_err(|_| ConfigError::InvalidValue(var.to_string()))?;
            }
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// fragmentation_factor = 0.9
    /// enable_yielding = true
    /// thrashing_prevention_mode = 0
    /// pipeline_depth = 2
    /// all_required_size_threshold = 8388608
    /// num_dcores = 4
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;

        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.split_once('#').map_or(value, |(value, _)| value);
                let value = value.trim().trim_matches('"');
                config.set(key, value)?;
            }
        }

        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> String {
        format!(
            "# Bundle cache planner configuration\n\
             fragmentation_factor = {}\n\
             enable_yielding = {}\n\
             thrashing_prevention_mode = {}\n\
             pipeline_depth = {}\n\
             all_required_size_threshold = {}\n\
             num_dcores = {}\n",
            self.fragmentation_factor,
            self.enable_yielding,
            self.thrashing_prevention_mode.level(),
            self.pipeline_depth,
            self.all_required_size_threshold,
            self.num_dcores
        )
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue(key.to_string());
        match key {
            "fragmentation_factor" => {
                let factor = value.parse::<f64>().map_err(|_| invalid())?;
                if !(0.0..=1.0).contains(&factor) {
                    return Err(invalid());
                }
                self.fragmentation_factor = factor;
            }
            "enable_yielding" => {
                self.enable_yielding = parse_bool(value).ok_or_else(invalid)?;
            }
            "thrashing_prevention_mode" => {
                let level = value.parse::<u32>().map_err(|_| invalid())?;
                self.thrashing_prevention_mode =
                    ThrashingPreventionMode::from_level(level).ok_or_else(invalid)?;
            }
            "pipeline_depth" => {
                self.pipeline_depth = value.parse().map_err(|_| invalid())?;
            }
            "all_required_size_threshold" => {
                self.all_required_size_threshold = value.parse().map_err(|_| invalid())?;
            }
            "num_dcores" => {
                let dcores = value.parse::<u32>().map_err(|_| invalid())?;
                if dcores == 0 {
                    return Err(invalid());
                }
                self.num_dcores = dcores;
            }
            _ => {} // Ignore unknown keys
        }
        Ok(())
    }
}

const ENV_KEYS: [(&str, &str); 6] = [
    ("BUNDLE_CACHE_FRAGMENTATION_FACTOR", "fragmentation_factor"),
    ("BUNDLE_CACHE_ENABLE_YIELDING", "enable_yielding"),
    ("BUNDLE_CACHE_THRASHING_PREVENTION_MODE", "thrashing_prevention_mode"),
    ("BUNDLE_CACHE_PIPELINE_DEPTH", "pipeline_depth"),
    ("BUNDLE_CACHE_ALL_REQUIRED_THRESHOLD", "all_required_size_threshold"),
    ("BUNDLE_CACHE_NUM_DCORES", "num_dcores"),
];

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
