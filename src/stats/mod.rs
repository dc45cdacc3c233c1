//! Per-second traffic aggregation.
//!
//! [`StatsAggregator`] buckets decoded packets by whole seconds since the
//! session start. A bucket stays open until a packet from a later second
//! arrives (or [`StatsAggregator::finalize_pending_data`] is called); it is
//! then finalized exactly once: scored by the anomaly engine, folded into
//! the recent-history window, and kept for persistence.
//!
//! Like the engine it owns, the aggregator has no internal locking and is
//! driven from the single thread delivering packets.

pub mod bucket;
pub mod history;
pub mod persist;

pub use bucket::PerSecondBucket;
pub use history::RecentHistoryWindow;
pub use persist::{load_session, ConnectionRecord, SecondRecord, SessionDocument};

use crate::anomaly::{AnomalyEngine, AnomalyEvent};
use crate::error::PersistError;
use crate::monitor::config::HISTORY_WINDOW;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsConfig {
    /// Finalized seconds consulted when classifying connections and
    /// protocols as new.
    pub history_window: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            history_window: HISTORY_WINDOW,
        }
    }
}

pub struct StatsAggregator {
    session_start:  DateTime<Utc>,
    session_end:    DateTime<Utc>,
    open:           Option<PerSecondBucket>,
    finalized:      Vec<PerSecondBucket>,
    history:        RecentHistoryWindow,
    engine:         AnomalyEngine,
    anomalies:      Vec<AnomalyEvent>,
    dropped:        u64,
    last_file_path: Option<PathBuf>,
}

impl StatsAggregator {
    pub fn new(session_start: DateTime<Utc>, config: StatsConfig, engine: AnomalyEngine) -> Self {
        Self {
            session_start,
            session_end: session_start,
            open: None,
            finalized: Vec::new(),
            history: RecentHistoryWindow::new(config.history_window),
            engine,
            anomalies: Vec::new(),
            dropped: 0,
            last_file_path: None,
        }
    }

    pub fn with_defaults(session_start: DateTime<Utc>) -> Self {
        Self::new(session_start, StatsConfig::default(), AnomalyEngine::default())
    }

    /// Adds one decoded packet to its second's bucket.
    ///
    /// Returns the anomaly event, if any, of the bucket this packet caused to
    /// be finalized. Packets before the session start, or belonging to a
    /// second that is already finalized or older than the open one, are
    /// dropped and counted.
    pub fn record_packet(
        &mut self,
        timestamp: DateTime<Utc>,
        protocol:  &str,
        src:       &str,
        dst:       &str,
        size:      u64,
        row:       Option<usize>,
    ) -> Option<AnomalyEvent> {
        let Some(second) = self.second_of(timestamp) else {
            self.dropped += 1;
            return None;
        };
        if self.last_finalized().is_some_and(|last| second <= last) {
            self.dropped += 1;
            return None;
        }

        let mut event = None;
        match self.open_second() {
            Some(open) if second < open => {
                self.dropped += 1;
                return None;
            }
            Some(open) if second > open => {
                event = self.finalize_open();
            }
            _ => {}
        }

        if timestamp > self.session_end {
            self.session_end = timestamp;
        }
        self.open
            .get_or_insert_with(|| PerSecondBucket::new(second))
            .record(protocol, src, dst, size, row);
        event
    }

    /// Finalizes the open bucket, if there is one.
    pub fn finalize_pending_data(&mut self) -> Option<AnomalyEvent> {
        self.finalize_open()
    }

    /// Writes every finalized second to `<dir>/<start>-<end>.json`.
    ///
    /// With `finalize_pending` the open bucket is finalized first. A session
    /// with nothing finalized writes no file and returns `Ok(None)`. When the
    /// file name changed since the last save, the old file is removed after
    /// the new one is written. On error the previous file and all in-memory
    /// state are untouched, so the call can be retried.
    pub fn persist(
        &mut self,
        dir:              &Path,
        finalize_pending: bool,
    ) -> Result<Option<PathBuf>, PersistError> {
        if finalize_pending {
            self.finalize_pending_data();
        }
        if self.finalized.is_empty() {
            return Ok(None);
        }

        let path = persist::write_session(dir, &self.document(), self.last_file_path.as_deref())?;
        self.last_file_path = Some(path.clone());
        Ok(Some(path))
    }

    /// The session as it would be persisted now.
    pub fn document(&self) -> SessionDocument {
        SessionDocument::new(self.session_start, self.session_end, &self.finalized)
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    /// Latest accepted packet timestamp, or the start if none arrived yet.
    pub fn session_end(&self) -> DateTime<Utc> {
        self.session_end
    }

    /// Finalized buckets, ascending by second.
    pub fn finalized(&self) -> &[PerSecondBucket] {
        &self.finalized
    }

    pub fn open_second(&self) -> Option<u64> {
        self.open.as_ref().map(|b| b.second)
    }

    /// Every event emitted this session, in emission order.
    pub fn anomalies(&self) -> &[AnomalyEvent] {
        &self.anomalies
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_file_path(&self) -> Option<&Path> {
        self.last_file_path.as_deref()
    }

    /// Records a session file written on another thread so the next
    /// [`persist`](Self::persist) replaces it.
    pub fn adopt_file_path(&mut self, path: PathBuf) {
        self.last_file_path = Some(path);
    }

    fn second_of(&self, timestamp: DateTime<Utc>) -> Option<u64> {
        let micros = timestamp
            .signed_duration_since(self.session_start)
            .num_microseconds()?;
        u64::try_from(micros.div_euclid(1_000_000)).ok()
    }

    fn last_finalized(&self) -> Option<u64> {
        self.finalized.last().map(|b| b.second)
    }

    fn finalize_open(&mut self) -> Option<AnomalyEvent> {
        let bucket = self.open.take()?;

        let snapshot = bucket.snapshot(&self.history);
        let event = self.engine.observe(&snapshot);
        self.history.push(&bucket);
        self.finalized.push(bucket);

        if let Some(event) = &event {
            self.anomalies.push(event.clone());
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    #[test]
    fn concrete_two_second_scenario() {
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(0), "TCP", "A", "B", 100, Some(0));
        agg.record_packet(at(0), "UDP", "C", "D", 50, Some(1));
        agg.record_packet(at(1000), "TCP", "A", "B", 80, Some(2));
        agg.finalize_pending_data();

        let doc = agg.document();
        assert_eq!(doc.per_second.len(), 2);

        let s0 = &doc.per_second[0];
        assert_eq!(s0.second, 0);
        assert_eq!(s0.pps, 2.0);
        assert_eq!(s0.bps, 150.0);
        assert_eq!(s0.protocol_counts.len(), 2);
        assert_eq!(s0.protocol_counts["TCP"], 1);
        assert_eq!(s0.protocol_counts["UDP"], 1);

        let s1 = &doc.per_second[1];
        assert_eq!(s1.second, 1);
        assert_eq!(s1.pps, 1.0);
        assert_eq!(s1.bps, 80.0);
        assert_eq!(s1.protocol_counts.len(), 1);
        assert_eq!(s1.protocol_counts["TCP"], 1);
    }

    #[test]
    fn finalized_count_matches_distinct_seconds() {
        let mut agg = StatsAggregator::with_defaults(t0());
        let offsets = [0, 200, 999, 1000, 4500, 4501, 9000, 9999, 12_000];
        for (row, ms) in offsets.iter().enumerate() {
            agg.record_packet(at(*ms), "TCP", "A", "B", 60, Some(row));
        }
        agg.finalize_pending_data();

        let seconds: Vec<u64> = agg.finalized().iter().map(|b| b.second).collect();
        assert_eq!(seconds, vec![0, 1, 4, 9, 12]);
    }

    #[test]
    fn rollover_finalizes_before_recording() {
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(100), "TCP", "A", "B", 60, None);
        assert_eq!(agg.open_second(), Some(0));
        assert!(agg.finalized().is_empty());

        agg.record_packet(at(2100), "TCP", "A", "B", 60, None);
        assert_eq!(agg.open_second(), Some(2));
        assert_eq!(agg.finalized().len(), 1);
        assert_eq!(agg.finalized()[0].packets, 1);
    }

    #[test]
    fn packets_before_start_are_dropped() {
        let mut agg = StatsAggregator::with_defaults(t0());
        assert!(agg.record_packet(at(-1), "TCP", "A", "B", 60, None).is_none());
        assert!(agg.record_packet(at(-5000), "TCP", "A", "B", 60, None).is_none());
        assert_eq!(agg.dropped(), 2);
        assert_eq!(agg.open_second(), None);
        assert_eq!(agg.session_end(), t0());
    }

    #[test]
    fn sub_millisecond_offsets_before_start_are_dropped() {
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(t0() - Duration::microseconds(500), "TCP", "A", "B", 60, None);
        assert_eq!(agg.dropped(), 1);
        assert_eq!(agg.open_second(), None);

        agg.record_packet(t0() + Duration::microseconds(999_999), "TCP", "A", "B", 60, None);
        assert_eq!(agg.open_second(), Some(0));
    }

    #[test]
    fn late_packets_never_touch_finalized_seconds() {
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(1500), "TCP", "A", "B", 60, None);
        agg.record_packet(at(2500), "TCP", "A", "B", 60, None);
        // Older than the open bucket (second 2) and inside finalized second 1.
        agg.record_packet(at(1700), "UDP", "A", "B", 60, None);
        agg.record_packet(at(200), "UDP", "A", "B", 60, None);

        assert_eq!(agg.dropped(), 2);
        assert_eq!(agg.finalized()[0].packets, 1);

        agg.finalize_pending_data();
        // Same second as the one just flushed.
        agg.record_packet(at(2900), "UDP", "A", "B", 60, None);
        assert_eq!(agg.dropped(), 3);
        assert_eq!(agg.open_second(), None);
    }

    #[test]
    fn finalize_pending_is_idempotent() {
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(0), "TCP", "A", "B", 60, None);
        agg.finalize_pending_data();
        agg.finalize_pending_data();
        assert_eq!(agg.finalized().len(), 1);
        assert!(agg.finalize_pending_data().is_none());
    }

    #[test]
    fn anomaly_log_collects_emitted_events() {
        let mut agg = StatsAggregator::with_defaults(t0());
        // First second: TCP is new and dominates.
        agg.record_packet(at(0), "TCP", "A", "B", 60, Some(0));
        let event = agg.record_packet(at(1000), "TCP", "A", "B", 60, Some(1));

        let event = event.expect("first second should be flagged");
        assert!(event.has_tag("new-protocol"));
        assert_eq!(event.packet_rows, vec![0]);
        assert_eq!(agg.anomalies(), &[event]);
    }

    #[test]
    fn rate_spike_is_flagged_after_warmup() {
        let mut agg = StatsAggregator::with_defaults(t0());
        let mut row = 0;
        for s in 0..6 {
            agg.record_packet(at(s * 1000), "TCP", "A", "B", 60, Some(row));
            row += 1;
        }
        for i in 0..200 {
            agg.record_packet(at(6000 + i), "TCP", "A", "B", 60, Some(row));
            row += 1;
        }
        let event = agg.finalize_pending_data().expect("spike");

        assert_eq!(event.second, 6);
        assert!(event.reasons.iter().any(|r| r.starts_with("Packet rate spike")));
        assert!(event.score > 2.8);
    }

    #[test]
    fn persist_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(0), "TCP", "A", "B", 100, None);
        agg.record_packet(at(10), "UDP", "C", "D", 50, None);
        agg.record_packet(at(1000), "TCP", "A", "B", 80, None);
        agg.finalize_pending_data();

        let path = agg.persist(dir.path(), false).unwrap().unwrap();
        assert_eq!(agg.last_file_path(), Some(path.as_path()));

        let loaded = load_session(&path).unwrap();
        let expected = agg.document();
        assert_eq!(loaded.per_second, expected.per_second);
    }

    #[test]
    fn persist_replaces_adopted_file() {
        let dir = TempDir::new().unwrap();
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(0), "TCP", "A", "B", 60, None);
        agg.record_packet(at(1000), "TCP", "A", "B", 60, None);

        let earlier = dir.path().join("written-elsewhere.json");
        std::fs::write(&earlier, "{}").unwrap();
        agg.adopt_file_path(earlier.clone());

        let path = agg.persist(dir.path(), true).unwrap().unwrap();
        assert!(path.exists());
        assert!(!earlier.exists());
    }

    #[test]
    fn persist_with_finalize_includes_open_second() {
        let dir = TempDir::new().unwrap();
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(0), "TCP", "A", "B", 100, None);

        assert!(agg.persist(dir.path(), false).unwrap().is_none());
        let path = agg.persist(dir.path(), true).unwrap().unwrap();
        assert_eq!(load_session(&path).unwrap().per_second.len(), 1);
    }

    #[test]
    fn empty_session_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut agg = StatsAggregator::with_defaults(t0());
        assert!(agg.persist(dir.path(), true).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_persist_keeps_previous_file_and_state() {
        let dir = TempDir::new().unwrap();
        let mut agg = StatsAggregator::with_defaults(t0());
        agg.record_packet(at(0), "TCP", "A", "B", 100, None);
        let good = agg.persist(dir.path(), true).unwrap().unwrap();

        agg.record_packet(at(3000), "TCP", "A", "B", 100, None);
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        assert!(agg.persist(&blocker, true).is_err());

        assert!(good.exists());
        assert_eq!(agg.last_file_path(), Some(good.as_path()));
        assert_eq!(agg.finalized().len(), 2);

        let retried = agg.persist(dir.path(), false).unwrap().unwrap();
        assert!(retried.exists());
        assert!(!good.exists());
    }
}
