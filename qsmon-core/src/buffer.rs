//! Fixed-capacity event ring with a sorted time index.
//!
//! The ring stores events in arrival order; a `BTreeMap` keyed by
//! `(timestamp_ns, slot)` gives O(log n) lower/upper-bound lookups for range
//! queries. Slot ids are monotonic per buffer so an overwrite can remove the
//! stale index entry before the replacement is inserted, keeping the index
//! and ring in lockstep across wrap-around.

use std::collections::{BTreeMap, VecDeque};

use qsmon_model::CachedEvent;
use tracing::trace;

/// Ring of timestamped events for one change group.
#[derive(Debug)]
pub struct TimeIndexedBuffer {
    capacity: usize,
    max_age_ms: u64,
    ring: VecDeque<CachedEvent>,
    /// Slot id of `ring[0]`. Slots increase by one per insert and are never
    /// reused within a buffer's lifetime.
    base_slot: u64,
    /// `(timestamp_ns, slot) -> slot`. The slot in the key disambiguates
    /// events sharing a capture timestamp (batched changes).
    time_index: BTreeMap<(u64, u64), u64>,
    /// Running max of `timestamp_ms`, aligned with the ring. Non-decreasing
    /// by construction even when the wall clock steps backward, so wall
    /// lookups can binary-search it safely.
    wall_watermarks: VecDeque<u64>,
    memory_bytes: usize,
}

impl TimeIndexedBuffer {
    pub fn new(capacity: usize, max_age_ms: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age_ms,
            ring: VecDeque::with_capacity(capacity.min(4096)),
            base_slot: 0,
            time_index: BTreeMap::new(),
            wall_watermarks: VecDeque::with_capacity(capacity.min(4096)),
            memory_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age_ms
    }

    pub fn memory_estimate_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// Shrink or grow the ring capacity, evicting oldest events on shrink.
    /// Returns the evicted events' total size in bytes.
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.max(1);
        let mut reclaimed = 0;
        while self.ring.len() > self.capacity {
            if let Some(evicted) = self.pop_oldest() {
                reclaimed += evicted.estimated_size();
            }
        }
        reclaimed
    }

    pub fn set_max_age_ms(&mut self, max_age_ms: u64) {
        self.max_age_ms = max_age_ms;
    }

    /// Append an event, evicting the oldest if the ring is full. Returns the
    /// evicted event, if any. O(log n).
    pub fn add(&mut self, event: CachedEvent) -> Option<CachedEvent> {
        let evicted = if self.ring.len() == self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        let slot = self.base_slot + self.ring.len() as u64;
        let watermark = self
            .wall_watermarks
            .back()
            .copied()
            .unwrap_or(0)
            .max(event.timestamp_ms);
        self.time_index.insert((event.timestamp_ns, slot), slot);
        self.wall_watermarks.push_back(watermark);
        self.memory_bytes += event.estimated_size();
        self.ring.push_back(event);
        evicted
    }

    /// Remove and return the oldest event, keeping the index consistent.
    pub fn pop_oldest(&mut self) -> Option<CachedEvent> {
        let event = self.ring.pop_front()?;
        self.time_index.remove(&(event.timestamp_ns, self.base_slot));
        self.wall_watermarks.pop_front();
        self.base_slot += 1;
        self.memory_bytes = self.memory_bytes.saturating_sub(event.estimated_size());
        Some(event)
    }

    pub fn get_oldest(&self) -> Option<&CachedEvent> {
        self.ring.front()
    }

    pub fn get_newest(&self) -> Option<&CachedEvent> {
        self.ring.back()
    }

    pub fn get_all(&self) -> impl Iterator<Item = &CachedEvent> {
        self.ring.iter()
    }

    /// Events whose monotonic timestamp falls within `[start_ns, end_ns]`,
    /// in time order. O(log n + k) via the sorted index.
    pub fn query_time_range(
        &self,
        start_ns: u64,
        end_ns: u64,
    ) -> impl Iterator<Item = &CachedEvent> {
        self.time_index
            .range((start_ns, 0)..=(end_ns, u64::MAX))
            .map(|(_, slot)| {
                let pos = (slot - self.base_slot) as usize;
                &self.ring[pos]
            })
    }

    /// Events whose wall-clock timestamp falls within `[start_ms, end_ms]`.
    ///
    /// The wall clock may step backward between captures, so raw
    /// `timestamp_ms` values are never binary-searched. The watermark
    /// sequence locates the oldest possible candidate in O(log n); from
    /// its monotonic timestamp onward the sorted time index supplies
    /// candidates and the exact bounds are checked per event. Windows
    /// ending near the newest event (the common poll-and-query shape) cost
    /// O(log n + k); older windows additionally walk the newer-than-window
    /// suffix.
    pub fn query_wall_range(
        &self,
        start_ms: u64,
        end_ms: u64,
    ) -> impl Iterator<Item = &CachedEvent> {
        // Everything before this position has timestamp_ms < start_ms.
        let start_pos = self.wall_watermarks.partition_point(|wm| *wm < start_ms);
        let lo_ns = self
            .ring
            .get(start_pos)
            .map_or(u64::MAX, |ev| ev.timestamp_ns);
        self.query_time_range(lo_ns, u64::MAX)
            .filter(move |ev| ev.timestamp_ms >= start_ms && ev.timestamp_ms <= end_ms)
    }

    /// Evict up to `n` oldest events; returns how many were evicted and the
    /// bytes reclaimed.
    pub fn force_evict(&mut self, n: usize) -> (usize, usize) {
        let mut evicted = 0;
        let mut reclaimed = 0;
        while evicted < n {
            match self.pop_oldest() {
                Some(event) => {
                    evicted += 1;
                    reclaimed += event.estimated_size();
                }
                None => break,
            }
        }
        if evicted > 0 {
            trace!(evicted, reclaimed, "force-evicted oldest events");
        }
        (evicted, reclaimed)
    }

    /// Prune events older than `max_age_ms` relative to `now_ms`. Returns
    /// the number pruned.
    pub fn evict_old_events(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.max_age_ms);
        let mut pruned = 0;
        while let Some(oldest) = self.ring.front() {
            if oldest.timestamp_ms >= cutoff {
                break;
            }
            self.pop_oldest();
            pruned += 1;
        }
        pruned
    }

    /// Drain the oldest events until just before `max_bytes` of estimated
    /// size would be exceeded, returning them in time order. At least one
    /// event is drained if the buffer is non-empty and `max_bytes > 0`.
    pub fn drain_oldest_until_bytes(&mut self, max_bytes: usize) -> Vec<CachedEvent> {
        let mut drained = Vec::new();
        let mut total = 0;
        while let Some(oldest) = self.ring.front() {
            let size = oldest.estimated_size();
            if total + size > max_bytes && !drained.is_empty() {
                break;
            }
            total += size;
            if let Some(event) = self.pop_oldest() {
                drained.push(event);
            }
            if total >= max_bytes {
                break;
            }
        }
        drained
    }

    /// Rebuild the ring keeping only events where `keep` returns true; the
    /// closure may mutate retained events (compression flips their marker).
    /// Returns `(before, after, bytes_reclaimed)`.
    pub fn compact<F>(&mut self, mut keep: F) -> (usize, usize, usize)
    where
        F: FnMut(&mut CachedEvent) -> bool,
    {
        let before = self.ring.len();
        let bytes_before = self.memory_bytes;

        let mut retained: VecDeque<CachedEvent> =
            VecDeque::with_capacity(self.ring.len());
        for mut event in self.ring.drain(..) {
            if keep(&mut event) {
                retained.push_back(event);
            }
        }

        // Slots restart past the old range so stale ids can never collide.
        self.base_slot += before as u64;
        self.ring = retained;
        self.time_index.clear();
        self.wall_watermarks.clear();
        self.memory_bytes = 0;
        let mut watermark = 0;
        for (offset, event) in self.ring.iter().enumerate() {
            let slot = self.base_slot + offset as u64;
            self.time_index.insert((event.timestamp_ns, slot), slot);
            watermark = watermark.max(event.timestamp_ms);
            self.wall_watermarks.push_back(watermark);
            self.memory_bytes += event.estimated_size();
        }

        let after = self.ring.len();
        (before, after, bytes_before.saturating_sub(self.memory_bytes))
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.ring.len();
        self.base_slot += cleared as u64;
        self.ring.clear();
        self.time_index.clear();
        self.wall_watermarks.clear();
        self.memory_bytes = 0;
        cleared
    }
}
