//! Disk spillover: offloads buffer tails to per-group JSON files and
//! streams them back for range queries.
//!
//! Files are immutable once renamed into place. Names follow
//! `<group>_<start_ms>_<index>.json` with a per-manager monotonic index, so
//! a group's files sort by `(start_ts_ms, file_index)`. The manager never
//! touches files that do not match the pattern.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use qsmon_model::CachedEvent;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

const SPILL_EXT: &str = "json";

/// On-disk record, one per spill file. Self-describing so files survive
/// renames of the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillFileRecord {
    pub group_id: String,
    pub start_ts_ms: u64,
    pub end_ts_ms: u64,
    pub event_count: usize,
    pub events: Vec<CachedEvent>,
}

/// Outcome of a successful spill write.
#[derive(Debug, Clone)]
pub struct SpillReceipt {
    pub file_path: PathBuf,
    pub event_count: usize,
}

/// Writes and reads spill files for every group under one directory.
#[derive(Debug)]
pub struct SpilloverManager {
    directory: PathBuf,
    file_index: AtomicU64,
    dir_ready: AtomicBool,
    disabled: AtomicBool,
}

impl SpilloverManager {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            file_index: AtomicU64::new(0),
            dir_ready: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        }
    }

    /// Spillover turns itself off after unrecoverable I/O failures; queries
    /// then degrade to memory-only.
    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            warn!(reason, "disabling disk spillover");
        }
    }

    /// Write one time-ordered batch for a group. The caller sizes batches
    /// against `max_file_size_mb`; events must be non-empty.
    pub async fn spill(
        &self,
        group_id: &str,
        events: Vec<CachedEvent>,
    ) -> Result<SpillReceipt> {
        if !self.is_enabled() {
            return Err(CacheError::Internal("spillover is disabled".into()));
        }
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Err(CacheError::Internal("refusing to spill empty batch".into()));
        };

        self.ensure_directory().await?;

        let record = SpillFileRecord {
            group_id: group_id.to_string(),
            start_ts_ms: first.timestamp_ms,
            end_ts_ms: last.timestamp_ms,
            event_count: events.len(),
            events,
        };

        let index = self.file_index.fetch_add(1, Ordering::Relaxed);
        let file_name = format!(
            "{}_{}_{}.{SPILL_EXT}",
            sanitize_group(group_id),
            record.start_ts_ms,
            index
        );
        let final_path = self.directory.join(&file_name);
        let tmp_path = self.directory.join(format!("{file_name}.tmp"));

        let bytes = serde_json::to_vec(&record)?;
        if let Err(err) = fs::write(&tmp_path, &bytes).await {
            if err.kind() == ErrorKind::StorageFull {
                self.disable("disk full during spill write");
            }
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        fs::rename(&tmp_path, &final_path).await?;

        debug!(
            group_id,
            events = record.event_count,
            path = %final_path.display(),
            "spilled events to disk"
        );

        Ok(SpillReceipt {
            file_path: final_path,
            event_count: record.event_count,
        })
    }

    /// Load every spilled event for `group_id` whose file range intersects
    /// `[start_ms, end_ms]`, in `(start_ts_ms, file_index)` order. A file
    /// that fails to read is skipped with a warning; remaining files still
    /// contribute.
    pub async fn load_range(
        &self,
        group_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<CachedEvent>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }

        let mut files = self.group_files(group_id).await?;
        files.sort_by_key(|f| (f.start_ms, f.index));

        let mut events = Vec::new();
        for file in files {
            // The name only carries the start; files starting after the
            // window can be skipped without a read.
            if file.start_ms > end_ms {
                continue;
            }
            match self.read_record(&file.path).await {
                Ok(record) => {
                    if record.end_ts_ms < start_ms {
                        continue;
                    }
                    events.extend(
                        record
                            .events
                            .into_iter()
                            .filter(|ev| {
                                ev.timestamp_ms >= start_ms && ev.timestamp_ms <= end_ms
                            }),
                    );
                }
                Err(err) => {
                    warn!(
                        path = %file.path.display(),
                        %err,
                        "skipping unreadable spill file"
                    );
                }
            }
        }
        Ok(events)
    }

    /// Unlink files whose newest event is older than `max_age_ms`. Returns
    /// the number removed.
    pub async fn cleanup(&self, max_age_ms: u64, now_ms: u64) -> Result<usize> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let mut removed = 0;

        for file in self.all_files().await? {
            let expired = match self.read_record(&file.path).await {
                Ok(record) => record.end_ts_ms < cutoff,
                // An unreadable record older than the window by name is
                // garbage either way.
                Err(_) => file.start_ms < cutoff,
            };
            if expired {
                match fs::remove_file(&file.path).await {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(path = %file.path.display(), %err, "failed to unlink spill file");
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "cleaned up expired spill files");
        }
        Ok(removed)
    }

    /// Sum of on-disk spill file sizes. Scanned on demand for statistics,
    /// not maintained per write.
    pub async fn disk_usage_bytes(&self) -> Result<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let mut total = 0;
        for file in self.all_files().await? {
            if let Ok(meta) = fs::metadata(&file.path).await {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Remove every spill file belonging to `group_id`.
    pub async fn remove_group(&self, group_id: &str) -> Result<usize> {
        let mut removed = 0;
        for file in self.group_files(group_id).await? {
            if fs::remove_file(&file.path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ensure_directory(&self) -> Result<()> {
        if self.dir_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Err(err) = fs::create_dir_all(&self.directory).await {
            self.disable("spill directory could not be created");
            return Err(CacheError::from(err).with_context("spillover-init"));
        }
        self.dir_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn read_record(&self, path: &Path) -> Result<SpillFileRecord> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn group_files(&self, group_id: &str) -> Result<Vec<SpillFileInfo>> {
        let prefix = sanitize_group(group_id);
        Ok(self
            .all_files()
            .await?
            .into_iter()
            .filter(|f| f.group == prefix)
            .collect())
    }

    async fn all_files(&self) -> Result<Vec<SpillFileInfo>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            // Nothing spilled yet.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((group, start_ms, index)) = parse_spill_filename(name) {
                files.push(SpillFileInfo {
                    path,
                    group,
                    start_ms,
                    index,
                });
            }
        }
        Ok(files)
    }
}

#[derive(Debug)]
struct SpillFileInfo {
    path: PathBuf,
    group: String,
    start_ms: u64,
    index: u64,
}

/// Group ids are arbitrary strings; flatten anything path-hostile before it
/// reaches a filename. The true id lives inside the record.
fn sanitize_group(group_id: &str) -> String {
    group_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Parse `<group>_<start_ms>_<index>.json`, where the group itself may not
/// contain underscores after sanitizing. Returns `None` for foreign files.
fn parse_spill_filename(name: &str) -> Option<(String, u64, u64)> {
    let stem = name.strip_suffix(&format!(".{SPILL_EXT}"))?;
    let (rest, index) = stem.rsplit_once('_')?;
    let (group, start_ms) = rest.rsplit_once('_')?;
    let index = index.parse::<u64>().ok()?;
    let start_ms = start_ms.parse::<u64>().ok()?;
    if group.is_empty() {
        return None;
    }
    Some((group.to_string(), start_ms, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsmon_model::ControlValue;

    fn event(seq: u64, ts_ms: u64) -> CachedEvent {
        CachedEvent {
            group_id: "amps".into(),
            control_name: "Amp.level".into(),
            timestamp_ns: ts_ms * 1_000_000,
            timestamp_ms: ts_ms,
            value: ControlValue::Float(seq as f64),
            string_repr: seq.to_string(),
            previous_value: None,
            previous_string: None,
            delta: None,
            duration_ms: None,
            sequence_number: seq,
            event_type: None,
            compressed: false,
        }
    }

    #[test]
    fn filename_parses_from_the_right() {
        assert_eq!(
            parse_spill_filename("main-amps_1700000_3.json"),
            Some(("main-amps".into(), 1_700_000, 3))
        );
        // Sanitized underscores collapse to dashes, so two trailing fields
        // always belong to the timestamp and index.
        assert_eq!(parse_spill_filename("notes.txt"), None);
        assert_eq!(parse_spill_filename("amps_xx_1.json"), None);
    }

    #[test]
    fn sanitize_flattens_path_hostile_ids() {
        assert_eq!(sanitize_group("Main Amps/2"), "Main-Amps-2");
        assert_eq!(sanitize_group("room_b"), "room-b");
    }

    #[tokio::test]
    async fn spill_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpilloverManager::new(dir.path().to_path_buf());

        let receipt = spill
            .spill("amps", vec![event(1, 1_000), event(2, 2_000)])
            .await
            .unwrap();
        assert_eq!(receipt.event_count, 2);
        assert!(receipt.file_path.exists());

        let loaded = spill.load_range("amps", 0, 10_000).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].sequence_number, 1);
        assert_eq!(loaded[0].timestamp_ns, 1_000_000_000);

        // Range that misses the file entirely.
        let loaded = spill.load_range("amps", 5_000, 10_000).await.unwrap();
        assert!(loaded.is_empty());

        // Unknown group sees nothing.
        let loaded = spill.load_range("other", 0, 10_000).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn files_order_by_start_then_index() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpilloverManager::new(dir.path().to_path_buf());

        spill.spill("g", vec![event(1, 1_000)]).await.unwrap();
        spill.spill("g", vec![event(2, 1_000)]).await.unwrap();
        spill.spill("g", vec![event(3, 500)]).await.unwrap();

        let loaded = spill.load_range("g", 0, 10_000).await.unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|ev| ev.sequence_number).collect();
        assert_eq!(seqs, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn cleanup_unlinks_expired_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpilloverManager::new(dir.path().to_path_buf());

        spill.spill("g", vec![event(1, 1_000)]).await.unwrap();
        spill.spill("g", vec![event(2, 90_000)]).await.unwrap();

        // Foreign files are never touched.
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let removed = spill.cleanup(60_000, 100_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("notes.txt").exists());

        let remaining = spill.load_range("g", 0, 1_000_000).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn unreadable_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpilloverManager::new(dir.path().to_path_buf());

        spill.spill("g", vec![event(1, 1_000)]).await.unwrap();
        std::fs::write(dir.path().join("g_2000_99.json"), b"not json").unwrap();

        let loaded = spill.load_range("g", 0, 10_000).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn disk_usage_counts_only_spill_files() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpilloverManager::new(dir.path().to_path_buf());
        assert_eq!(spill.disk_usage_bytes().await.unwrap(), 0);

        spill.spill("g", vec![event(1, 1_000)]).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"xxxxxxxx").unwrap();

        let usage = spill.disk_usage_bytes().await.unwrap();
        assert!(usage > 0);
        let spill_file_len = std::fs::metadata(
            std::fs::read_dir(dir.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .find(|p| p.extension().is_some_and(|e| e == "json"))
                .unwrap(),
        )
        .unwrap()
        .len();
        assert_eq!(usage, spill_file_len);
    }
}
