//! Cache configuration: serde-backed settings tree with file/env loading
//! and a guard-rail validation pass.

pub mod validate;

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub use validate::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, validate};

/// Source that produced the cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Execution environment, read from `$QSMON_ENV`. Validation is mandatory
/// in production and skipped under test unless explicitly requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Test,
}

impl Environment {
    pub fn detect() -> Self {
        match env::var("QSMON_ENV") {
            Ok(v) if v.trim().eq_ignore_ascii_case("test") => Environment::Test,
            _ => Environment::Production,
        }
    }
}

/// Top-level cache settings. Tune these to trade retention depth against
/// memory; the per-group knobs can be overridden at runtime via
/// `configure_group`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-group ring capacity. A full ring overwrites its oldest event.
    pub max_events: usize,
    /// Hard age ceiling (ms); older events are pruned regardless of space.
    pub max_age_ms: u64,
    /// Cross-group memory ceiling that drives the pressure ladder.
    pub global_memory_limit_mb: u64,
    /// Cadence of the memory pressure check and trend sampling.
    pub memory_check_interval_ms: u64,
    pub compression: CompressionConfig,
    pub spillover: SpilloverConfig,
    pub query_cache: QueryCacheConfig,
    pub thresholds: ThresholdConfig,
    /// Bypass guard-rail validation. Only honored when the environment is
    /// `test`; production constructs always validate.
    pub skip_validation: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_age_ms: 3_600_000,
            global_memory_limit_mb: 500,
            memory_check_interval_ms: 5_000,
            compression: CompressionConfig::default(),
            spillover: SpilloverConfig::default(),
            query_cache: QueryCacheConfig::default(),
            thresholds: ThresholdConfig::default(),
            skip_validation: false,
        }
    }
}

/// Tiered retention windows for aging events.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Tier-1 cutoff: everything younger is kept untouched.
    pub recent_window_ms: u64,
    /// Tier-2 cutoff: transitions, threshold crossings, significant or
    /// sufficiently spaced events survive.
    pub medium_window_ms: u64,
    /// Tier-3 cutoff: only transitions and threshold crossings survive.
    pub ancient_window_ms: u64,
    /// Numeric change (percent of previous value) counted as significant.
    pub significant_change_percent: f64,
    /// Minimum gap preserved between kept events in the medium tier.
    pub min_time_between_events_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            recent_window_ms: 60_000,
            medium_window_ms: 600_000,
            ancient_window_ms: 3_600_000,
            significant_change_percent: 5.0,
            min_time_between_events_ms: 100,
            check_interval_ms: 60_000,
        }
    }
}

/// Disk spillover for buffer tails under memory pressure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpilloverConfig {
    pub enabled: bool,
    /// Required when enabled. Created lazily on the first spill attempt.
    pub directory: Option<PathBuf>,
    /// Memory level that triggers spilling. Defaults to 80% of
    /// `global_memory_limit_mb` when unset.
    pub threshold_mb: Option<u64>,
    pub max_file_size_mb: u64,
}

impl Default for SpilloverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            threshold_mb: None,
            max_file_size_mb: 100,
        }
    }
}

/// Bounded LRU of materialized query results.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub size: usize,
    pub ttl_ms: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            size: 100,
            ttl_ms: 60_000,
        }
    }
}

fn default_db_thresholds() -> Vec<f64> {
    vec![-60.0, -40.0, -20.0, -12.0, -6.0, -3.0, 0.0]
}

fn default_level_patterns() -> Vec<String> {
    vec!["level".into(), "meter".into(), "gain".into()]
}

/// Threshold-crossing detection for audio-level controls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// dB rungs checked for crossings. 0 dB and -60 dB are always checked
    /// even when omitted here.
    #[serde(default = "default_db_thresholds")]
    pub db_thresholds: Vec<f64>,
    /// Lower-cased substrings of control names treated as level-like.
    #[serde(default = "default_level_patterns")]
    pub control_name_patterns: Vec<String>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            db_thresholds: default_db_thresholds(),
            control_name_patterns: default_level_patterns(),
        }
    }
}

impl CacheConfig {
    /// Memory level (bytes) at which spillover engages.
    pub fn spill_threshold_bytes(&self) -> u64 {
        let mb = self
            .spillover
            .threshold_mb
            .unwrap_or(self.global_memory_limit_mb * 8 / 10);
        mb * 1024 * 1024
    }

    pub fn global_memory_limit_bytes(&self) -> u64 {
        self.global_memory_limit_mb * 1024 * 1024
    }

    /// Fill derived defaults for absent fields. Serde already fills the
    /// static ones; this resolves the fields that depend on siblings.
    pub fn sanitize(mut self) -> Self {
        if self.spillover.threshold_mb.is_none() {
            self.spillover.threshold_mb = Some(self.global_memory_limit_mb * 8 / 10);
        }
        self
    }

    /// Load cache configuration overrides using environment variables.
    /// Evaluation order:
    /// 1) `$QSMON_CACHE_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$QSMON_CACHE_CONFIG_JSON` (inline JSON),
    /// 3) `cache.toml` / `config/cache.toml` if present,
    /// 4) defaults.
    pub fn load_from_env() -> Result<(Self, CacheConfigSource)> {
        if let Ok(path_str) = env::var("QSMON_CACHE_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, CacheConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var("QSMON_CACHE_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed: Self = serde_json::from_str(&raw).map_err(|err| {
                CacheError::ConfigInvalid(format!(
                    "failed to parse QSMON_CACHE_CONFIG_JSON: {err}"
                ))
            })?;
            return Ok((parsed, CacheConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, CacheConfigSource::File(path)));
        }

        Ok((Self::default(), CacheConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            CacheError::ConfigInvalid(format!(
                "failed to read cache config from {}: {err}",
                path.display()
            ))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|err| {
                CacheError::ConfigInvalid(format!(
                    "invalid cache config {}: {err}",
                    path.display()
                ))
            }),
            Some("toml") | Some("tml") => toml::from_str(&contents).map_err(|err| {
                CacheError::ConfigInvalid(format!(
                    "invalid cache config {}: {err}",
                    path.display()
                ))
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> Result<Self> {
        // Try TOML first, then JSON for convenience.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                CacheError::ConfigInvalid(format!(
                    "failed to parse cache config {origin}: toml error: {toml_err}; json error: {json_err}"
                ))
            })
        })
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "cache.toml",
            "cache.json",
            "config/cache.toml",
            "config/cache.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }
}
