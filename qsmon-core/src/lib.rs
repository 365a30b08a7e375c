//! Event cache core for the Qsmon monitoring server.
//!
//! Ingests control-change events from polled change groups into per-group
//! time-indexed ring buffers, enforces a global memory budget with
//! priority-weighted eviction, compresses aging events through tiered
//! retention, spills buffer tails to disk under pressure, and answers
//! time-range / value-filter queries through an LRU result cache.

pub mod buffer;
pub mod compression;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod manager;
pub mod query;
pub mod query_cache;
pub mod spillover;
pub mod stats;

pub use buffer::TimeIndexedBuffer;
pub use config::{
    CacheConfig, CacheConfigSource, CompressionConfig, ConfigGuardRailError,
    ConfigWarning, ConfigWarnings, Environment, QueryCacheConfig, SpilloverConfig,
    ThresholdConfig,
};
pub use error::{CacheError, Result};
pub use events::{CacheEventBus, NotificationPublisher};
pub use manager::{
    CacheStatistics, EventCacheManager, GroupOverrides, GroupPriority, GroupStats,
    QueryResponse,
};
pub use stats::{HealthReport, HealthStatus, LastError};

pub use qsmon_model as model;
