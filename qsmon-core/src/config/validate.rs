//! Guard-rail validation for [`CacheConfig`].
//!
//! Errors reject the configuration outright; warnings are surfaced but the
//! configuration is accepted. Under the `test` environment validation is
//! skipped unless the caller forces it, matching how the server treats
//! throwaway fixture configs.

use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use super::{CacheConfig, Environment};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigGuardRailError {
    #[error("global_memory_limit_mb must be at least 10 (got {0})")]
    MemoryLimitTooSmall(u64),

    #[error("memory_check_interval_ms must be at least 1000 (got {0})")]
    CheckIntervalTooShort(u64),

    #[error(
        "compression windows must be positive and strictly ordered: recent {recent} < medium {medium} < ancient {ancient}"
    )]
    CompressionWindowsInvalid {
        recent: u64,
        medium: u64,
        ancient: u64,
    },

    #[error("significant_change_percent must be within [0, 100] (got {0})")]
    SignificantChangeOutOfRange(f64),

    #[error("spillover is enabled but no directory is configured")]
    SpilloverDirectoryMissing,

    #[error("spillover directory {0} exists but is not a directory")]
    SpilloverDirectoryNotADirectory(String),

    #[error("spillover threshold_mb must be at least 10 (got {0})")]
    SpilloverThresholdTooSmall(u64),

    #[error("spillover max_file_size_mb must be at least 1 (got {0})")]
    SpilloverFileSizeTooSmall(u64),
}

/// Non-fatal findings from validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    MemoryLimitUnusual { limit_mb: u64 },
    RetentionOutsideTypicalRange { max_age_ms: u64 },
    RecentWindowDominatesRetention { recent_window_ms: u64, max_age_ms: u64 },
    EstimatedMemoryNearLimit { estimated_mb: u64, limit_mb: u64 },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::MemoryLimitUnusual { limit_mb } => write!(
                f,
                "global_memory_limit_mb = {limit_mb} is outside the typical 50..4096 range"
            ),
            ConfigWarning::RetentionOutsideTypicalRange { max_age_ms } => write!(
                f,
                "max_age_ms = {max_age_ms} is outside the typical 1 minute..24 hour range"
            ),
            ConfigWarning::RecentWindowDominatesRetention {
                recent_window_ms,
                max_age_ms,
            } => write!(
                f,
                "compression.recent_window_ms = {recent_window_ms} exceeds half of max_age_ms = {max_age_ms}; little will ever compress"
            ),
            ConfigWarning::EstimatedMemoryNearLimit {
                estimated_mb,
                limit_mb,
            } => write!(
                f,
                "estimated buffer memory ~{estimated_mb} MB approaches the {limit_mb} MB limit"
            ),
        }
    }
}

/// Collected warnings, logged once at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigWarnings(pub Vec<ConfigWarning>);

impl ConfigWarnings {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn log(&self) {
        for warning in &self.0 {
            warn!("cache config: {warning}");
        }
    }
}

/// Validate a configuration for the given environment.
///
/// Returns the warning list on acceptance. In `test`, validation is skipped
/// (empty warnings) unless `force` is set.
pub fn validate(
    config: &CacheConfig,
    environment: Environment,
    force: bool,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    if environment == Environment::Test && !force {
        return Ok(ConfigWarnings::default());
    }

    check_guard_rails(config)?;
    Ok(collect_warnings(config))
}

fn check_guard_rails(config: &CacheConfig) -> Result<(), ConfigGuardRailError> {
    if config.global_memory_limit_mb < 10 {
        return Err(ConfigGuardRailError::MemoryLimitTooSmall(
            config.global_memory_limit_mb,
        ));
    }

    if config.memory_check_interval_ms < 1_000 {
        return Err(ConfigGuardRailError::CheckIntervalTooShort(
            config.memory_check_interval_ms,
        ));
    }

    let c = &config.compression;
    if c.recent_window_ms == 0
        || c.medium_window_ms == 0
        || c.ancient_window_ms == 0
        || c.recent_window_ms >= c.medium_window_ms
        || c.medium_window_ms >= c.ancient_window_ms
    {
        return Err(ConfigGuardRailError::CompressionWindowsInvalid {
            recent: c.recent_window_ms,
            medium: c.medium_window_ms,
            ancient: c.ancient_window_ms,
        });
    }

    if !(0.0..=100.0).contains(&c.significant_change_percent) {
        return Err(ConfigGuardRailError::SignificantChangeOutOfRange(
            c.significant_change_percent,
        ));
    }

    let s = &config.spillover;
    if s.enabled {
        let Some(directory) = &s.directory else {
            return Err(ConfigGuardRailError::SpilloverDirectoryMissing);
        };
        check_spill_directory(directory)?;

        if let Some(threshold) = s.threshold_mb
            && threshold < 10
        {
            return Err(ConfigGuardRailError::SpilloverThresholdTooSmall(threshold));
        }

        if s.max_file_size_mb < 1 {
            return Err(ConfigGuardRailError::SpilloverFileSizeTooSmall(
                s.max_file_size_mb,
            ));
        }
    }

    Ok(())
}

// The directory itself is created lazily on the first spill; here we only
// reject paths that can never become a writable directory.
fn check_spill_directory(path: &Path) -> Result<(), ConfigGuardRailError> {
    if path.exists() && !path.is_dir() {
        return Err(ConfigGuardRailError::SpilloverDirectoryNotADirectory(
            path.display().to_string(),
        ));
    }
    Ok(())
}

fn collect_warnings(config: &CacheConfig) -> ConfigWarnings {
    let mut warnings = Vec::new();

    if !(50..=4096).contains(&config.global_memory_limit_mb) {
        warnings.push(ConfigWarning::MemoryLimitUnusual {
            limit_mb: config.global_memory_limit_mb,
        });
    }

    if !(60_000..=86_400_000).contains(&config.max_age_ms) {
        warnings.push(ConfigWarning::RetentionOutsideTypicalRange {
            max_age_ms: config.max_age_ms,
        });
    }

    if config.compression.recent_window_ms > config.max_age_ms / 2 {
        warnings.push(ConfigWarning::RecentWindowDominatesRetention {
            recent_window_ms: config.compression.recent_window_ms,
            max_age_ms: config.max_age_ms,
        });
    }

    // 300 bytes is a deliberately pessimistic per-event estimate.
    let estimated_mb = (config.max_events as u64 * 300) / (1024 * 1024);
    if estimated_mb * 10 >= config.global_memory_limit_mb * 8 {
        warnings.push(ConfigWarning::EstimatedMemoryNearLimit {
            estimated_mb,
            limit_mb: config.global_memory_limit_mb,
        });
    }

    ConfigWarnings(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionConfig, SpilloverConfig};

    fn base() -> CacheConfig {
        CacheConfig::default()
    }

    #[test]
    fn default_config_passes_clean() {
        let warnings = validate(&base(), Environment::Production, false).unwrap();
        assert!(warnings.is_empty(), "unexpected: {warnings:?}");
    }

    #[test]
    fn tiny_memory_limit_is_rejected() {
        let config = CacheConfig {
            global_memory_limit_mb: 5,
            ..base()
        };
        assert_eq!(
            validate(&config, Environment::Production, false),
            Err(ConfigGuardRailError::MemoryLimitTooSmall(5))
        );
    }

    #[test]
    fn out_of_order_windows_are_rejected() {
        let config = CacheConfig {
            compression: CompressionConfig {
                recent_window_ms: 600_000,
                medium_window_ms: 60_000,
                ..Default::default()
            },
            ..base()
        };
        assert!(matches!(
            validate(&config, Environment::Production, false),
            Err(ConfigGuardRailError::CompressionWindowsInvalid { .. })
        ));
    }

    #[test]
    fn spillover_needs_a_directory() {
        let config = CacheConfig {
            spillover: SpilloverConfig {
                enabled: true,
                ..Default::default()
            },
            ..base()
        };
        assert_eq!(
            validate(&config, Environment::Production, false),
            Err(ConfigGuardRailError::SpilloverDirectoryMissing)
        );
    }

    #[test]
    fn test_environment_skips_unless_forced() {
        let config = CacheConfig {
            global_memory_limit_mb: 1,
            ..base()
        };
        assert!(validate(&config, Environment::Test, false).is_ok());
        assert!(validate(&config, Environment::Test, true).is_err());
    }

    #[test]
    fn generous_ring_capacity_warns_near_limit() {
        let config = CacheConfig {
            global_memory_limit_mb: 30,
            max_events: 100_000,
            ..base()
        };
        let warnings = validate(&config, Environment::Production, false).unwrap();
        assert!(warnings.0.iter().any(|w| matches!(
            w,
            ConfigWarning::EstimatedMemoryNearLimit { .. }
        )));
    }
}
