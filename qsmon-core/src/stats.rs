//! Rolling counters, sliding windows, and health derivation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const EVENTS_WINDOW: Duration = Duration::from_secs(1);
const QUERIES_WINDOW: Duration = Duration::from_secs(60);
const ERRORS_WINDOW: Duration = Duration::from_secs(60);
const LATENCY_SAMPLES: usize = 1_000;
const MEMORY_TREND_SAMPLES: usize = 100;

/// Most recent error surfaced by any component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub message: String,
    pub context: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_ms: u64,
    pub memory_pct: f64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub issues: Vec<String>,
}

#[derive(Debug, Default)]
struct Windows {
    ingests: VecDeque<(Instant, u64)>,
    queries: VecDeque<Instant>,
    errors: VecDeque<Instant>,
    latencies_us: VecDeque<u64>,
    latency_sum_us: u64,
    memory_trend: VecDeque<(u64, u64)>,
    last_error: Option<LastError>,
    compression_reclaimed: u64,
    compression_considered: u64,
    compression_runs: u64,
}

/// Central recorder owned by the manager. Cheap to poke from the ingest
/// hot path; snapshots are assembled on demand.
#[derive(Debug)]
pub struct StatsRecorder {
    started: Instant,
    total_events: AtomicU64,
    total_queries: AtomicU64,
    error_count: AtomicU64,
    windows: Mutex<Windows>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_events: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn record_ingest(&self, count: u64) {
        self.total_events.fetch_add(count, Ordering::Relaxed);
        let mut windows = self.windows.lock().expect("stats lock");
        let now = Instant::now();
        windows.ingests.push_back((now, count));
        prune_window(&mut windows.ingests, now, EVENTS_WINDOW, |(t, _)| *t);
    }

    /// Record one query with its duration. Microsecond resolution keeps
    /// sub-millisecond queries from reporting as zero.
    pub fn record_query(&self, elapsed: Duration) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.windows.lock().expect("stats lock");
        let now = Instant::now();
        windows.queries.push_back(now);
        prune_window(&mut windows.queries, now, QUERIES_WINDOW, |t| *t);

        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        windows.latencies_us.push_back(us);
        windows.latency_sum_us += us;
        while windows.latencies_us.len() > LATENCY_SAMPLES {
            if let Some(old) = windows.latencies_us.pop_front() {
                windows.latency_sum_us -= old;
            }
        }
    }

    pub fn record_error(&self, message: String, context: String, timestamp_ms: u64) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.windows.lock().expect("stats lock");
        let now = Instant::now();
        windows.errors.push_back(now);
        prune_window(&mut windows.errors, now, ERRORS_WINDOW, |t| *t);
        windows.last_error = Some(LastError {
            message,
            context,
            timestamp_ms,
        });
    }

    pub fn record_compression(&self, bytes_considered: u64, bytes_reclaimed: u64) {
        let mut windows = self.windows.lock().expect("stats lock");
        windows.compression_considered += bytes_considered;
        windows.compression_reclaimed += bytes_reclaimed;
        windows.compression_runs += 1;
    }

    pub fn sample_memory(&self, timestamp_ms: u64, bytes: u64) {
        let mut windows = self.windows.lock().expect("stats lock");
        windows.memory_trend.push_back((timestamp_ms, bytes));
        while windows.memory_trend.len() > MEMORY_TREND_SAMPLES {
            windows.memory_trend.pop_front();
        }
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }

    pub fn events_per_second(&self) -> f64 {
        let mut windows = self.windows.lock().expect("stats lock");
        let now = Instant::now();
        prune_window(&mut windows.ingests, now, EVENTS_WINDOW, |(t, _)| *t);
        windows.ingests.iter().map(|(_, count)| *count).sum::<u64>() as f64
    }

    pub fn queries_per_minute(&self) -> f64 {
        let mut windows = self.windows.lock().expect("stats lock");
        let now = Instant::now();
        prune_window(&mut windows.queries, now, QUERIES_WINDOW, |t| *t);
        windows.queries.len() as f64
    }

    /// Rolling mean over the last 1000 queries, in milliseconds.
    pub fn avg_query_latency_ms(&self) -> f64 {
        let windows = self.windows.lock().expect("stats lock");
        if windows.latencies_us.is_empty() {
            return 0.0;
        }
        (windows.latency_sum_us as f64 / windows.latencies_us.len() as f64) / 1_000.0
    }

    /// `reclaimed / considered` across all runs; `None` until compression
    /// has actually executed.
    pub fn compression_effectiveness(&self) -> Option<f64> {
        let windows = self.windows.lock().expect("stats lock");
        if windows.compression_runs == 0 || windows.compression_considered == 0 {
            return None;
        }
        Some(windows.compression_reclaimed as f64 / windows.compression_considered as f64)
    }

    pub fn memory_trend(&self) -> Vec<(u64, u64)> {
        let windows = self.windows.lock().expect("stats lock");
        windows.memory_trend.iter().copied().collect()
    }

    pub fn last_error(&self) -> Option<LastError> {
        let windows = self.windows.lock().expect("stats lock");
        windows.last_error.clone()
    }

    /// Derive health from memory occupancy and recent error pressure.
    pub fn health(&self, memory_pct: f64) -> HealthReport {
        let recent_errors = {
            let mut windows = self.windows.lock().expect("stats lock");
            let now = Instant::now();
            prune_window(&mut windows.errors, now, ERRORS_WINDOW, |t| *t);
            windows.errors.len()
        };

        let mut issues = Vec::new();
        if memory_pct >= 75.0 {
            issues.push(format!("memory usage at {memory_pct:.1}% of limit"));
        }
        if recent_errors > 1 {
            issues.push(format!("{recent_errors} errors in the last minute"));
        }

        let status = if memory_pct > 90.0 || recent_errors > 10 {
            HealthStatus::Unhealthy
        } else if memory_pct >= 75.0 || recent_errors > 1 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            uptime_ms: self.uptime_ms(),
            memory_pct,
            error_count: self.error_count(),
            last_error: self.last_error(),
            issues,
        }
    }
}

fn prune_window<T>(
    window: &mut VecDeque<T>,
    now: Instant,
    span: Duration,
    at: impl Fn(&T) -> Instant,
) {
    while let Some(front) = window.front() {
        if now.duration_since(at(front)) <= span {
            break;
        }
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_mean_keeps_microsecond_resolution() {
        let stats = StatsRecorder::new();
        stats.record_query(Duration::from_micros(250));
        stats.record_query(Duration::from_micros(750));
        let avg = stats.avg_query_latency_ms();
        assert!(avg > 0.0, "sub-ms latency reported as zero");
        assert!((avg - 0.5).abs() < 1e-9);
    }

    #[test]
    fn latency_window_is_bounded() {
        let stats = StatsRecorder::new();
        for _ in 0..1_500 {
            stats.record_query(Duration::from_micros(100));
        }
        let windows = stats.windows.lock().unwrap();
        assert_eq!(windows.latencies_us.len(), LATENCY_SAMPLES);
        assert_eq!(windows.latency_sum_us, 100 * LATENCY_SAMPLES as u64);
    }

    #[test]
    fn memory_trend_is_a_bounded_ring() {
        let stats = StatsRecorder::new();
        for i in 0..250u64 {
            stats.sample_memory(i, i * 10);
        }
        let trend = stats.memory_trend();
        assert_eq!(trend.len(), MEMORY_TREND_SAMPLES);
        assert_eq!(trend.first().copied(), Some((150, 1_500)));
        assert_eq!(trend.last().copied(), Some((249, 2_490)));
    }

    #[test]
    fn compression_effectiveness_is_none_before_first_run() {
        let stats = StatsRecorder::new();
        assert_eq!(stats.compression_effectiveness(), None);
        stats.record_compression(1_000, 400);
        assert_eq!(stats.compression_effectiveness(), Some(0.4));
    }

    #[test]
    fn health_thresholds_follow_memory_occupancy() {
        let stats = StatsRecorder::new();
        assert_eq!(stats.health(10.0).status, HealthStatus::Healthy);
        assert_eq!(stats.health(80.0).status, HealthStatus::Degraded);
        assert_eq!(stats.health(95.0).status, HealthStatus::Unhealthy);
        assert!(!stats.health(80.0).issues.is_empty());
    }

    #[test]
    fn error_burst_degrades_health() {
        let stats = StatsRecorder::new();
        for i in 0..12 {
            stats.record_error(format!("boom {i}"), "test".into(), i);
        }
        let report = stats.health(10.0);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.error_count, 12);
        assert_eq!(report.last_error.unwrap().message, "boom 11");
    }
}
