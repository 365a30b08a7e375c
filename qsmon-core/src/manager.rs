//! The event cache manager: owns per-group buffers, enforces the global
//! memory budget, schedules compression and spillover, and serves queries.
//!
//! Ownership is deliberately one-directional: buffers, the spill manager,
//! and the query cache are values owned here, never peers that call back.
//! Each group's buffer and last-values map form one unit of mutation,
//! serialized by its `DashMap` entry; queries clone candidates out of the
//! guard before touching disk so no lock is held across a suspension point.

use std::cmp::Reverse;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use qsmon_model::{
    CacheNotification, CachedEvent, ChangeBatch, ControlChange, EventQuery,
    PressureLevel,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::TimeIndexedBuffer;
use crate::compression::compress_group;
use crate::config::{CacheConfig, Environment, validate};
use crate::error::{CacheError, Result};
use crate::events::CacheEventBus;
use crate::ingest::{EventEnricher, LastValue, LastValues};
use crate::query::{QueryPlan, merge_by_time};
use crate::query_cache::{QueryCache, QueryCacheStats};
use crate::spillover::SpilloverManager;
use crate::stats::{HealthReport, LastError, StatsRecorder};

/// Eviction bias under memory pressure; lower priorities are drained first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GroupPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-group settings applied through [`EventCacheManager::configure_group`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupOverrides {
    pub max_events: Option<usize>,
    pub max_age_ms: Option<u64>,
    pub priority: Option<GroupPriority>,
}

/// Query result plus provenance.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub events: Vec<CachedEvent>,
    pub from_cache: bool,
}

/// Point-in-time snapshot of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group_id: String,
    pub enabled: bool,
    pub priority: GroupPriority,
    pub events_ingested: u64,
    pub buffered_events: usize,
    pub memory_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_timestamp_ms: Option<u64>,
}

/// Full statistics snapshot, assembled on demand.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub total_events_ingested: u64,
    pub events_per_second: f64,
    pub queries_per_minute: f64,
    pub avg_query_latency_ms: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_pct: f64,
    pub memory_trend: Vec<(u64, u64)>,
    pub disk_spillover_usage_bytes: u64,
    pub compression_effectiveness: Option<f64>,
    pub query_cache: QueryCacheStats,
    pub group_count: usize,
    pub groups: Vec<GroupStats>,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub uptime_ms: u64,
}

/// One change group's unit of mutation.
#[derive(Debug)]
struct GroupState {
    buffer: TimeIndexedBuffer,
    last_values: LastValues,
    enabled: bool,
    priority: GroupPriority,
    events_ingested: u64,
}

impl GroupState {
    fn new(config: &CacheConfig) -> Self {
        Self {
            buffer: TimeIndexedBuffer::new(config.max_events, config.max_age_ms),
            last_values: LastValues::new(),
            enabled: true,
            priority: GroupPriority::default(),
            events_ingested: 0,
        }
    }
}

// Pressure latch ordinals; reset when memory drops back under the limit.
const PRESSURE_NONE: u8 = 0;
const PRESSURE_HIGH: u8 = 1;
const PRESSURE_CRITICAL: u8 = 2;

const EVICTION_PASS_LIMIT: usize = 4;
const SPILL_BATCH_LIMIT: usize = 64;

pub struct EventCacheManager {
    config: CacheConfig,
    groups: DashMap<String, GroupState>,
    enricher: EventEnricher,
    sequence: AtomicU64,
    global_memory: AtomicU64,
    query_cache: Mutex<QueryCache>,
    spillover: Option<SpilloverManager>,
    stats: StatsRecorder,
    bus: CacheEventBus,
    pressure_latch: Mutex<u8>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCacheManager")
            .field("groups", &self.groups.len())
            .field("memory_bytes", &self.memory_usage_bytes())
            .field("spillover", &self.spillover.is_some())
            .finish()
    }
}

impl EventCacheManager {
    /// Construct with the environment detected from `$QSMON_ENV`.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::new_with_environment(config, Environment::detect())
    }

    pub fn new_with_environment(config: CacheConfig, environment: Environment) -> Result<Self> {
        let warnings = validate(&config, environment, !config.skip_validation)
            .map_err(|err| CacheError::ConfigInvalid(err.to_string()))?;
        warnings.log();

        let config = config.sanitize();

        let spillover = if config.spillover.enabled {
            match &config.spillover.directory {
                Some(directory) => Some(SpilloverManager::new(directory.clone())),
                None => {
                    // Only reachable when validation was skipped.
                    warn!("spillover enabled without a directory; disabling");
                    None
                }
            }
        } else {
            None
        };

        let enricher = EventEnricher::new(
            config.thresholds.clone(),
            config.compression.significant_change_percent,
        );

        let query_cache = QueryCache::new(
            config.query_cache.size,
            Duration::from_millis(config.query_cache.ttl_ms),
        );

        Ok(Self {
            config,
            groups: DashMap::new(),
            enricher,
            sequence: AtomicU64::new(0),
            global_memory: AtomicU64::new(0),
            query_cache: Mutex::new(query_cache),
            spillover,
            stats: StatsRecorder::new(),
            bus: CacheEventBus::default(),
            pressure_latch: Mutex::new(PRESSURE_NONE),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the periodic maintenance tasks. Call once after construction;
    /// [`shutdown`](Self::shutdown) stops them.
    pub fn start(self: &std::sync::Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock");

        let manager = std::sync::Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                manager.config.memory_check_interval_ms,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.check_memory_pressure().await;
            }
        }));

        if self.config.compression.enabled {
            let manager = std::sync::Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(
                    manager.config.compression.check_interval_ms,
                ));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    manager.run_compression_cycle();
                }
            }));
        }

        if self.spillover.is_some() {
            let manager = std::sync::Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(
                    manager.config.compression.check_interval_ms.max(60_000),
                ));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    manager.run_spillover_cleanup().await;
                }
            }));
        }

        info!(
            memory_check_ms = self.config.memory_check_interval_ms,
            compression = self.config.compression.enabled,
            spillover = self.spillover.is_some(),
            "event cache manager started"
        );
    }

    /// Stop periodic tasks, then flush every group's still-buffered events
    /// to spill files so nothing buffered dies with the process. Spill
    /// writes land via temp-file rename, so no file is ever half-written.
    pub async fn shutdown(&self) {
        {
            let mut tasks = self.tasks.lock().expect("task list lock");
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.flush_spillover().await;
        info!("event cache manager shut down");
    }

    /// Final spill pass over every group, unconditional on memory levels.
    /// Buffers drain oldest-first in `max_file_size_mb`-bounded batches.
    async fn flush_spillover(&self) {
        let Some(spill) = &self.spillover else {
            return;
        };
        let max_batch_bytes = (self.config.spillover.max_file_size_mb as usize) * 1024 * 1024;

        for group_id in self.group_ids() {
            while spill.is_enabled() {
                let batch = match self.groups.get_mut(&group_id) {
                    Some(mut group) => group.buffer.drain_oldest_until_bytes(max_batch_bytes),
                    None => break,
                };
                if batch.is_empty() {
                    break;
                }
                let drained_bytes: u64 =
                    batch.iter().map(|ev| ev.estimated_size() as u64).sum();
                sub_saturating(&self.global_memory, drained_bytes);

                match spill.spill(&group_id, batch).await {
                    Ok(receipt) => {
                        self.bus.send(CacheNotification::DiskSpillover {
                            group_id: group_id.clone(),
                            event_count: receipt.event_count,
                            file_path: receipt.file_path.display().to_string(),
                        });
                    }
                    Err(err) => {
                        error!(group_id, %err, "final spill flush failed; batch lost");
                        self.record_failure(&err, "spillover-flush");
                        break;
                    }
                }
            }
        }
    }

    /// Subscribe to cache notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheNotification> {
        self.bus.subscribe()
    }

    pub fn memory_usage_bytes(&self) -> u64 {
        self.global_memory.load(Ordering::Acquire)
    }

    fn now_ms() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    // ---------------------------------------------------------------------
    // Ingest
    // ---------------------------------------------------------------------

    /// Ingest one polled batch. Changes keep their batch-relative order and
    /// receive individually assigned sequence numbers. Returns how many
    /// events were stored (zero for a disabled group).
    pub fn ingest_batch(&self, batch: &ChangeBatch) -> Result<usize> {
        if batch.group_id.is_empty() {
            return Err(CacheError::ConfigInvalid(
                "ingest contract violation: empty group_id".into(),
            ));
        }
        if batch.changes.is_empty() {
            return Ok(0);
        }

        let stored = {
            let mut group = self
                .groups
                .entry(batch.group_id.clone())
                .or_insert_with(|| GroupState::new(&self.config));

            if !group.enabled {
                return Ok(0);
            }

            let mut added_bytes: u64 = 0;
            let mut evicted_bytes: u64 = 0;
            for change in &batch.changes {
                let (added, evicted) = self.store_one(
                    &mut group,
                    &batch.group_id,
                    change,
                    batch.timestamp_ns,
                    batch.timestamp_ms,
                );
                added_bytes += added;
                evicted_bytes += evicted;
            }

            self.global_memory.fetch_add(added_bytes, Ordering::AcqRel);
            sub_saturating(&self.global_memory, evicted_bytes);

            (batch.changes.len(), group.buffer.len())
        };

        self.after_ingest(&batch.group_id, stored.0, stored.1);
        Ok(stored.0)
    }

    /// Ingest a single decoded change event.
    pub fn ingest(
        &self,
        group_id: &str,
        change: &ControlChange,
        timestamp_ns: u64,
        timestamp_ms: u64,
    ) -> Result<bool> {
        if group_id.is_empty() {
            return Err(CacheError::ConfigInvalid(
                "ingest contract violation: empty group_id".into(),
            ));
        }

        let buffered = {
            let mut group = self
                .groups
                .entry(group_id.to_string())
                .or_insert_with(|| GroupState::new(&self.config));

            if !group.enabled {
                return Ok(false);
            }

            let (added, evicted) =
                self.store_one(&mut group, group_id, change, timestamp_ns, timestamp_ms);
            self.global_memory.fetch_add(added, Ordering::AcqRel);
            sub_saturating(&self.global_memory, evicted);
            group.buffer.len()
        };

        self.after_ingest(group_id, 1, buffered);
        Ok(true)
    }

    /// Store one change into a held group entry. Returns
    /// `(bytes_added, bytes_evicted)`.
    fn store_one(
        &self,
        group: &mut GroupState,
        group_id: &str,
        change: &ControlChange,
        timestamp_ns: u64,
        timestamp_ms: u64,
    ) -> (u64, u64) {
        let sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = group.last_values.get(&change.name);
        let event = self.enricher.enrich(
            group_id,
            change,
            timestamp_ns,
            timestamp_ms,
            sequence_number,
            previous,
        );

        group.last_values.insert(
            change.name.clone(),
            LastValue {
                value: event.value.clone(),
                string_repr: event.string_repr.clone(),
                timestamp_ms,
            },
        );

        let added = event.estimated_size() as u64;
        let evicted = group
            .buffer
            .add(event)
            .map(|old| old.estimated_size() as u64)
            .unwrap_or(0);
        group.events_ingested += 1;
        (added, evicted)
    }

    fn after_ingest(&self, group_id: &str, count: usize, total_events: usize) {
        self.query_cache
            .lock()
            .expect("query cache lock")
            .invalidate_group(group_id);
        self.stats.record_ingest(count as u64);
        self.bus.send(CacheNotification::EventsStored {
            group_id: group_id.to_string(),
            count,
            total_events,
        });
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Full query: consults the result cache, merges memory with any
    /// intersecting spill files, then filters, aggregates, orders, and
    /// paginates. Dropping the returned future cancels cleanly at a spill
    /// file boundary.
    pub async fn query(&self, query: &EventQuery) -> Result<QueryResponse> {
        let started = Instant::now();
        let result = self.query_inner(query, true).await;
        self.finish_query(started, result)
    }

    /// Like [`query`](Self::query) but fails with `QueryTimeout` once the
    /// deadline elapses, returning no partial results.
    pub async fn query_with_deadline(
        &self,
        query: &EventQuery,
        deadline: Duration,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, self.query_inner(query, true)).await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::QueryTimeout {
                elapsed_ms: deadline.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
        };
        self.finish_query(started, result)
    }

    /// Memory-only variant kept for callers that cannot await disk; the
    /// result cache is bypassed because cached entries may contain spilled
    /// events.
    pub fn query_sync(&self, query: &EventQuery) -> Result<QueryResponse> {
        let started = Instant::now();
        let result: Result<QueryResponse> = (|| {
            let plan = QueryPlan::new(query.normalize(Self::now_ms())?)?;
            let candidates = self.memory_candidates(&plan);
            Ok(QueryResponse {
                events: plan.execute(candidates),
                from_cache: false,
            })
        })();
        self.finish_query(started, result)
    }

    async fn query_inner(&self, query: &EventQuery, use_cache: bool) -> Result<QueryResponse> {
        let plan = QueryPlan::new(query.normalize(Self::now_ms())?)?;
        let key = plan.query.cache_key();

        if use_cache
            && let Some(result) = self.query_cache.lock().expect("query cache lock").get(&key)
        {
            return Ok(QueryResponse {
                events: result.as_ref().clone(),
                from_cache: true,
            });
        }

        let group_ids = match &plan.query.group_id {
            Some(group_id) => vec![group_id.clone()],
            None => self.group_ids(),
        };

        let mut candidates = Vec::new();
        for group_id in &group_ids {
            let memory: Vec<CachedEvent> = match self.groups.get(group_id) {
                Some(group) => group
                    .buffer
                    .query_wall_range(plan.query.start_time_ms, plan.query.end_time_ms)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };

            let disk = match &self.spillover {
                Some(spill) if spill.is_enabled() => spill
                    .load_range(group_id, plan.query.start_time_ms, plan.query.end_time_ms)
                    .await
                    .map_err(|err| {
                        let err = err.with_context("spill-read");
                        self.record_failure(&err, "spill-read");
                        err
                    })?,
                _ => Vec::new(),
            };

            candidates.extend(merge_by_time(disk, memory));
        }

        let events = plan.execute(candidates);

        if use_cache && !events.is_empty() {
            self.query_cache.lock().expect("query cache lock").put(
                key,
                plan.query.group_id.as_deref(),
                std::sync::Arc::new(events.clone()),
            );
        }

        Ok(QueryResponse {
            events,
            from_cache: false,
        })
    }

    fn finish_query(
        &self,
        started: Instant,
        result: Result<QueryResponse>,
    ) -> Result<QueryResponse> {
        self.stats.record_query(started.elapsed());
        if let Err(err) = &result
            && !matches!(err, CacheError::QueryFailed { .. })
        {
            // QueryFailed already went through record_failure with context.
            self.record_failure(err, err.context_label());
        }
        result
    }

    fn memory_candidates(&self, plan: &QueryPlan) -> Vec<CachedEvent> {
        let group_ids = match &plan.query.group_id {
            Some(group_id) => vec![group_id.clone()],
            None => self.group_ids(),
        };

        let mut candidates = Vec::new();
        for group_id in &group_ids {
            if let Some(group) = self.groups.get(group_id) {
                candidates.extend(
                    group
                        .buffer
                        .query_wall_range(plan.query.start_time_ms, plan.query.end_time_ms)
                        .cloned(),
                );
            }
        }
        candidates
    }

    // ---------------------------------------------------------------------
    // Group administration
    // ---------------------------------------------------------------------

    /// Apply per-group overrides, creating the group if absent.
    pub fn configure_group(&self, group_id: &str, overrides: GroupOverrides) {
        let mut group = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupState::new(&self.config));

        if let Some(max_events) = overrides.max_events {
            let reclaimed = group.buffer.set_capacity(max_events);
            sub_saturating(&self.global_memory, reclaimed as u64);
        }
        if let Some(max_age_ms) = overrides.max_age_ms {
            group.buffer.set_max_age_ms(max_age_ms);
        }
        if let Some(priority) = overrides.priority {
            group.priority = priority;
        }
    }

    pub fn enable_group(&self, group_id: &str) {
        self.set_group_enabled(group_id, true);
    }

    /// Disable ingest for a group; buffered events stay queryable.
    pub fn disable_group(&self, group_id: &str) {
        self.set_group_enabled(group_id, false);
    }

    fn set_group_enabled(&self, group_id: &str, enabled: bool) {
        let mut group = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| GroupState::new(&self.config));
        group.enabled = enabled;
    }

    /// Destroy a group's buffer, last values, cache entries, and spill
    /// files. Returns false when the group was not present (idempotent).
    pub async fn clear_group(&self, group_id: &str) -> bool {
        let Some((_, state)) = self.groups.remove(group_id) else {
            return false;
        };

        sub_saturating(
            &self.global_memory,
            state.buffer.memory_estimate_bytes() as u64,
        );
        self.query_cache
            .lock()
            .expect("query cache lock")
            .invalidate_group(group_id);

        if let Some(spill) = &self.spillover
            && let Err(err) = spill.remove_group(group_id).await
        {
            warn!(group_id, %err, "failed to remove spill files for cleared group");
        }

        self.bus.send(CacheNotification::GroupCleared {
            group_id: group_id.to_string(),
        });
        true
    }

    pub async fn clear_all(&self) {
        for group_id in self.group_ids() {
            self.clear_group(&group_id).await;
        }
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }

    pub fn group_stats(&self, group_id: &str) -> Option<GroupStats> {
        let group = self.groups.get(group_id)?;
        Some(GroupStats {
            group_id: group_id.to_string(),
            enabled: group.enabled,
            priority: group.priority,
            events_ingested: group.events_ingested,
            buffered_events: group.buffer.len(),
            memory_bytes: group.buffer.memory_estimate_bytes(),
            oldest_timestamp_ms: group.buffer.get_oldest().map(|ev| ev.timestamp_ms),
            newest_timestamp_ms: group.buffer.get_newest().map(|ev| ev.timestamp_ms),
        })
    }

    // ---------------------------------------------------------------------
    // Statistics & health
    // ---------------------------------------------------------------------

    pub async fn statistics(&self) -> CacheStatistics {
        let memory_usage_bytes = self.memory_usage_bytes();
        let memory_limit_bytes = self.config.global_memory_limit_bytes();

        let disk_spillover_usage_bytes = match &self.spillover {
            Some(spill) => spill.disk_usage_bytes().await.unwrap_or_else(|err| {
                warn!(%err, "failed to scan spill directory for statistics");
                0
            }),
            None => 0,
        };

        let mut groups: Vec<GroupStats> = self
            .group_ids()
            .iter()
            .filter_map(|group_id| self.group_stats(group_id))
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));

        CacheStatistics {
            total_events_ingested: self.stats.total_events(),
            events_per_second: self.stats.events_per_second(),
            queries_per_minute: self.stats.queries_per_minute(),
            avg_query_latency_ms: self.stats.avg_query_latency_ms(),
            memory_usage_bytes,
            memory_limit_bytes,
            memory_pct: percent(memory_usage_bytes, memory_limit_bytes),
            memory_trend: self.stats.memory_trend(),
            disk_spillover_usage_bytes,
            compression_effectiveness: self.stats.compression_effectiveness(),
            query_cache: self.query_cache.lock().expect("query cache lock").stats(),
            group_count: groups.len(),
            groups,
            error_count: self.stats.error_count(),
            last_error: self.stats.last_error(),
            uptime_ms: self.stats.uptime_ms(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let memory_pct = percent(
            self.memory_usage_bytes(),
            self.config.global_memory_limit_bytes(),
        );
        self.stats.health(memory_pct)
    }

    // ---------------------------------------------------------------------
    // Maintenance: pressure ladder, compression, spill cleanup
    // ---------------------------------------------------------------------

    /// One memory-check tick: sample the trend, prune aged events, then walk
    /// the pressure ladder (spill, priority eviction, emergency eviction).
    pub async fn check_memory_pressure(&self) {
        let now_ms = Self::now_ms();
        self.evict_aged_events(now_ms);

        let bytes = self.memory_usage_bytes();
        self.stats.sample_memory(now_ms, bytes);

        if self.spillover.is_some() && bytes >= self.config.spill_threshold_bytes() {
            self.spill_until_below_threshold().await;
        }

        let limit = self.config.global_memory_limit_bytes();
        let bytes = self.memory_usage_bytes();
        if bytes <= limit {
            *self.pressure_latch.lock().expect("pressure latch") = PRESSURE_NONE;
            return;
        }

        self.emit_pressure(PRESSURE_HIGH, bytes, limit);
        self.evict_by_priority(limit);

        let bytes = self.memory_usage_bytes();
        if bytes > limit {
            self.emit_pressure(PRESSURE_CRITICAL, bytes, limit);
            self.perform_emergency_eviction("memory still above limit after eviction passes");
        }
    }

    fn evict_aged_events(&self, now_ms: u64) {
        let mut reclaimed: u64 = 0;
        for mut group in self.groups.iter_mut() {
            let before = group.buffer.memory_estimate_bytes();
            let pruned = group.buffer.evict_old_events(now_ms);
            if pruned > 0 {
                reclaimed += (before - group.buffer.memory_estimate_bytes()) as u64;
                debug!(group_id = %group.key(), pruned, "pruned events past max age");
            }
        }
        if reclaimed > 0 {
            sub_saturating(&self.global_memory, reclaimed);
        }
    }

    fn emit_pressure(&self, level: u8, bytes: u64, limit: u64) {
        let mut latch = self.pressure_latch.lock().expect("pressure latch");
        if *latch >= level {
            return;
        }
        *latch = level;
        drop(latch);

        let pressure = if level >= PRESSURE_CRITICAL {
            PressureLevel::Critical
        } else {
            PressureLevel::High
        };
        warn!(?pressure, bytes, limit, "memory pressure crossing");
        self.bus.send(CacheNotification::MemoryPressure {
            level: pressure,
            percent: percent(bytes, limit),
        });
    }

    /// Spill the oldest batches from the lowest-priority, largest groups
    /// until memory drops below the spill threshold.
    async fn spill_until_below_threshold(&self) {
        let Some(spill) = &self.spillover else {
            return;
        };
        let threshold = self.config.spill_threshold_bytes();
        let max_batch_bytes = (self.config.spillover.max_file_size_mb as usize) * 1024 * 1024;

        for _ in 0..SPILL_BATCH_LIMIT {
            if !spill.is_enabled() || self.memory_usage_bytes() < threshold {
                return;
            }

            // Candidate order: ascending priority, then largest resident set.
            let candidate = self
                .groups
                .iter()
                .filter(|g| !g.buffer.is_empty())
                .min_by_key(|g| (g.priority, Reverse(g.buffer.memory_estimate_bytes())))
                .map(|g| g.key().clone());
            let Some(group_id) = candidate else {
                return;
            };

            let batch = match self.groups.get_mut(&group_id) {
                Some(mut group) => group.buffer.drain_oldest_until_bytes(max_batch_bytes),
                None => continue,
            };
            if batch.is_empty() {
                return;
            }
            let drained_bytes: u64 =
                batch.iter().map(|ev| ev.estimated_size() as u64).sum();
            // The batch left the buffer either way; the write is best-effort.
            sub_saturating(&self.global_memory, drained_bytes);

            match spill.spill(&group_id, batch).await {
                Ok(receipt) => {
                    self.bus.send(CacheNotification::DiskSpillover {
                        group_id: group_id.clone(),
                        event_count: receipt.event_count,
                        file_path: receipt.file_path.display().to_string(),
                    });
                }
                Err(err) => {
                    error!(group_id, %err, "spill write failed; batch lost");
                    self.record_failure(&err, "spillover");
                    if !spill.is_enabled() {
                        // Disk is gone; relieve memory the hard way.
                        self.perform_emergency_eviction("spillover disabled by write failure");
                    }
                    return;
                }
            }
        }
    }

    /// Repeated passes over groups in `(priority ascending, memory
    /// descending)` order. Each visit evicts only as many oldest events as
    /// the shortfall requires, capped at half the group's buffer, so
    /// higher-priority groups keep more when an earlier victim suffices.
    fn evict_by_priority(&self, limit: u64) {
        for _ in 0..EVICTION_PASS_LIMIT {
            if self.memory_usage_bytes() <= limit {
                return;
            }

            let mut order: Vec<(String, GroupPriority, usize)> = self
                .groups
                .iter()
                .filter(|g| !g.buffer.is_empty())
                .map(|g| {
                    (
                        g.key().clone(),
                        g.priority,
                        g.buffer.memory_estimate_bytes(),
                    )
                })
                .collect();
            if order.is_empty() {
                return;
            }
            order.sort_by_key(|(_, priority, bytes)| (*priority, Reverse(*bytes)));

            for (group_id, _, _) in order {
                let need = self
                    .memory_usage_bytes()
                    .saturating_sub(limit);
                if need == 0 {
                    return;
                }

                let reclaimed = match self.groups.get_mut(&group_id) {
                    Some(mut group) => {
                        let len = group.buffer.len();
                        if len == 0 {
                            continue;
                        }
                        let avg = (group.buffer.memory_estimate_bytes() / len).max(1) as u64;
                        let wanted = (need / avg + 1) as usize;
                        let capped = wanted.min(len.div_ceil(2));
                        let (evicted, reclaimed) = group.buffer.force_evict(capped);
                        if evicted > 0 {
                            info!(
                                group_id,
                                evicted, "evicted oldest events under memory pressure"
                            );
                        }
                        reclaimed
                    }
                    None => 0,
                };
                sub_saturating(&self.global_memory, reclaimed as u64);
                self.query_cache
                    .lock()
                    .expect("query cache lock")
                    .invalidate_group(&group_id);

                if self.memory_usage_bytes() <= limit {
                    return;
                }
            }
        }
    }

    /// Last resort: drop half of every group's events.
    pub fn perform_emergency_eviction(&self, reason: &str) {
        let mut reclaimed: u64 = 0;
        let mut dropped = 0;
        for mut group in self.groups.iter_mut() {
            let half = group.buffer.len().div_ceil(2);
            let (evicted, bytes) = group.buffer.force_evict(half);
            dropped += evicted;
            reclaimed += bytes as u64;
        }
        sub_saturating(&self.global_memory, reclaimed);
        self.query_cache
            .lock()
            .expect("query cache lock")
            .invalidate_all();

        let err = CacheError::MemoryCritical(format!("{reason}; dropped {dropped} events"));
        error!(%err, "emergency eviction");
        self.record_failure(&err, "memory-critical");
    }

    /// One compression tick over every group.
    pub fn run_compression_cycle(&self) {
        if !self.config.compression.enabled {
            return;
        }
        let now_ms = Self::now_ms();

        for group_id in self.group_ids() {
            let Some(mut group) = self.groups.get_mut(&group_id) else {
                continue;
            };
            let bytes_before = group.buffer.memory_estimate_bytes() as u64;
            let outcome = compress_group(&mut group.buffer, &self.config.compression, now_ms);
            drop(group);

            self.stats
                .record_compression(bytes_before, outcome.bytes_reclaimed as u64);
            if outcome.removed() == 0 {
                continue;
            }

            sub_saturating(&self.global_memory, outcome.bytes_reclaimed as u64);
            self.query_cache
                .lock()
                .expect("query cache lock")
                .invalidate_group(&group_id);
            self.bus.send(CacheNotification::Compression {
                group_id,
                before: outcome.before,
                after: outcome.after,
                bytes_reclaimed: outcome.bytes_reclaimed,
            });
        }
    }

    /// Unlink spill files entirely past the retention window.
    pub async fn run_spillover_cleanup(&self) {
        let Some(spill) = &self.spillover else {
            return;
        };
        if let Err(err) = spill.cleanup(self.config.max_age_ms, Self::now_ms()).await {
            warn!(%err, "spill cleanup failed");
        }
    }

    fn record_failure(&self, err: &CacheError, context: &str) {
        let timestamp_ms = Self::now_ms();
        self.stats
            .record_error(err.to_string(), context.to_string(), timestamp_ms);
        self.bus.send(CacheNotification::Error {
            message: err.to_string(),
            context: context.to_string(),
            timestamp_ms,
        });
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64) * 100.0
}

fn sub_saturating(counter: &AtomicU64, value: u64) {
    if value == 0 {
        return;
    }
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(value))
    });
}
