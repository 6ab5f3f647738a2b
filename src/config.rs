//! Configuration management.
//!
//! Two sources feed a run:
//!
//! 1. The **filter configuration**, a whitespace-delimited `key value` file holding the
//!    L2 and burst thresholds. Every recognised key must appear exactly once.
//! 2. The **run settings** (chunk durations, clock tolerances, archive locations, alert
//!    endpoint), loaded with Figment from built-in defaults, an optional TOML file, and
//!    environment variables prefixed with `ZDAB_L2_` (use `__` to reach nested keys,
//!    e.g. `ZDAB_L2_CHUNK__UNIQUE_SECS=2.0`).
//!
//! # Example
//! ```no_run
//! use zdab_l2::config::{FilterConfig, RunSettings};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let filter = FilterConfig::load(Path::new("l2.cfg"))?;
//! let settings = RunSettings::load(Some(Path::new("run.toml")))?;
//! settings.validate()?;
//! println!("hi cut {}", filter.nhit_hi);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, L2Error};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Ticks of the 50 MHz clock per second.
pub const TICKS_PER_SECOND: u64 = 50_000_000;

/// Convert seconds to 50 MHz ticks.
pub fn secs_to_ticks(secs: f64) -> u64 {
    (secs * TICKS_PER_SECOND as f64).round().max(0.0) as u64
}

/// L2 and burst thresholds, fixed for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Normal hit-count cut.
    pub nhit_hi: u32,
    /// Lowered hit-count cut applied after a large event.
    pub nhit_lo: u32,
    /// Hit count above which an event lowers the cut.
    pub large_event_threshold: u32,
    /// How long the lowered cut stays in force, in ticks.
    pub low_window: u64,
    /// Hit-count cut for retriggers of an accepted event.
    pub retrig_cut: u32,
    /// Maximum spacing of a retrigger, in ticks.
    pub retrig_window: u64,
    /// Hit count above which an event is a burst candidate.
    pub nhit_burst: u32,
    /// Burst integration window, in seconds.
    pub burst_window_secs: u64,
    /// Buffer occupancy that opens a burst.
    pub burst_size: u32,
    /// Buffer occupancy below which a burst closes.
    pub end_rate: u32,
    /// External trigger bits.
    pub bitmask: u32,
}

const KEYS: [&str; 11] = [
    "nhithi",
    "nhitlo",
    "lothresh",
    "lowindow",
    "nhitretrig",
    "retrigwindow",
    "nhitburst",
    "burstwindow",
    "burstsize",
    "endrate",
    "bitmask",
];

impl FilterConfig {
    /// Read and validate a filter configuration file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| L2Error::Config {
            line: 0,
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut values: [Option<u64>; 11] = [None; 11];

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (Some(key), Some(value), None) = (tokens.next(), tokens.next(), tokens.next()) else {
                return Err(L2Error::Config {
                    line: n + 1,
                    message: format!("expected 'key value', got '{}'", line),
                });
            };
            let Some(slot) = KEYS.iter().position(|k| *k == key) else {
                warn!(key, "unrecognised configuration parameter, ignoring");
                continue;
            };
            if values[slot].is_some() {
                return Err(L2Error::DuplicateConfigKey(key.to_string()));
            }
            let parsed = if key == "bitmask" {
                let digits = value.trim_start_matches("0x").trim_start_matches("0X");
                u64::from_str_radix(digits, 16)
            } else {
                value.parse::<u64>()
            };
            values[slot] = Some(parsed.map_err(|e| L2Error::Config {
                line: n + 1,
                message: format!("bad value '{}' for {}: {}", value, key, e),
            })?);
        }

        let get = |slot: usize| values[slot].ok_or(L2Error::MissingConfigKey(KEYS[slot]));
        let narrow = |slot: usize| -> AppResult<u32> {
            u32::try_from(get(slot)?).map_err(|_| L2Error::Config {
                line: 0,
                message: format!("{} out of range", KEYS[slot]),
            })
        };

        Ok(Self {
            nhit_hi: narrow(0)?,
            nhit_lo: narrow(1)?,
            large_event_threshold: narrow(2)?,
            low_window: get(3)?,
            retrig_cut: narrow(4)?,
            retrig_window: get(5)?,
            nhit_burst: narrow(6)?,
            burst_window_secs: get(7)?,
            burst_size: narrow(8)?,
            end_rate: narrow(9)?,
            bitmask: narrow(10)?,
        })
    }

    /// Burst integration window in ticks.
    pub fn burst_window_ticks(&self) -> u64 {
        self.burst_window_secs * TICKS_PER_SECOND
    }

    /// JSON record of the effective configuration, for the run log.
    pub fn to_record(&self, run: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "L2CONFIG",
            "version": 0,
            "run": run,
            "config": self,
            "timestamp": chrono::Utc::now().timestamp(),
        })
    }
}

/// Top-level run settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Output chunking.
    pub chunk: ChunkSettings,
    /// Clock anomaly tolerances.
    pub clock: ClockSettings,
    /// Burst buffer.
    pub burst: BurstSettings,
    /// Where closed files go.
    pub archive: ArchiveSettings,
    /// Monitoring alerts.
    pub alerts: AlertSettings,
    /// Statistics egress.
    pub stats: StatsSettings,
    /// Local logging.
    pub logging: LoggingSettings,
}

/// Chunk durations and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    /// Unique interval of each chunk, in seconds.
    pub unique_secs: f64,
    /// Trailing interval shared with the next chunk, in seconds.
    pub overlap_secs: f64,
    /// Stop after this many chunks have been opened.
    pub max_files: Option<u64>,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            unique_secs: 1.2,
            overlap_secs: 0.1,
            max_files: None,
        }
    }
}

/// Clock consistency tolerances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    /// Largest forward step accepted between events, in ticks.
    pub max_jump_ticks: u64,
    /// Largest disagreement between the two counters, in ticks.
    pub max_drift_ticks: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            max_jump_ticks: 10 * TICKS_PER_SECOND,
            max_drift_ticks: 5000,
        }
    }
}

/// Burst buffer geometry and checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstSettings {
    /// Buffer slots.
    pub capacity: usize,
    /// Trailing margin kept in the buffer while a burst is being written, in seconds.
    pub end_window_secs: f64,
    /// Base path of the three checkpoint files. Defaults to `<output>_buffer`.
    pub checkpoint: Option<PathBuf>,
}

impl Default for BurstSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            end_window_secs: 1.0,
            checkpoint: None,
        }
    }
}

/// Archival of closed chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Closed chunks are moved here.
    pub completed_dir: Option<PathBuf>,
    /// Append-only log of opened and closed chunks.
    pub run_log: PathBuf,
    /// Job tickets for downstream processing are written here.
    pub job_dir: Option<PathBuf>,
    /// Chunks containing EXTASY triggers are linked here.
    pub pca_dir: Option<PathBuf>,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            completed_dir: None,
            run_log: PathBuf::from("l2.run.log"),
            job_dir: None,
            pca_dir: None,
        }
    }
}

/// Monitoring alert endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Endpoint URL. Alerts are only logged locally when unset.
    pub url: Option<String>,
    /// Basic-auth user for the endpoint.
    pub user: Option<String>,
    /// Client name reported with each alert.
    pub client_name: String,
    /// Messages per severity class per second.
    pub budget_per_second: u32,
    /// Outbound queue depth.
    pub queue_depth: usize,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            client_name: "L2-client".to_string(),
            budget_per_second: 10,
            queue_depth: 256,
        }
    }
}

/// Statistics egress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// JSON-lines file receiving per-second samples.
    pub path: Option<PathBuf>,
}

/// Local log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Level (trace, debug, info, warn, error).
    pub level: String,
    /// Format (pretty, compact, json).
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl RunSettings {
    /// Load defaults, then `path` if given, then `ZDAB_L2_` environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(RunSettings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment
            .merge(Env::prefixed("ZDAB_L2_").split("__"))
            .extract()?)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(L2Error::InvalidSettings(msg));

        if !(self.chunk.unique_secs > 0.0) {
            return invalid(format!("chunk.unique_secs must be > 0, got {}", self.chunk.unique_secs));
        }
        if !(self.chunk.overlap_secs >= 0.0) || self.chunk.overlap_secs > self.chunk.unique_secs {
            return invalid(format!(
                "chunk.overlap_secs must be within 0..={}, got {}",
                self.chunk.unique_secs, self.chunk.overlap_secs
            ));
        }
        if self.chunk.max_files == Some(0) {
            return invalid("chunk.max_files must be at least 1".to_string());
        }
        if self.burst.capacity == 0 {
            return invalid("burst.capacity must be at least 1".to_string());
        }
        if !(self.burst.end_window_secs >= 0.0) {
            return invalid("burst.end_window_secs must not be negative".to_string());
        }
        if self.alerts.budget_per_second == 0 {
            return invalid("alerts.budget_per_second must be at least 1".to_string());
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }
        Ok(())
    }

    /// Unique chunk interval in ticks.
    pub fn unique_ticks(&self) -> u64 {
        secs_to_ticks(self.chunk.unique_secs)
    }

    /// Overlap interval in ticks.
    pub fn overlap_ticks(&self) -> u64 {
        secs_to_ticks(self.chunk.overlap_secs)
    }
}
