//! Capture side of the engine and the session wiring.
//!
//! [`Monitor::start`] spawns a [`CaptureWorker`] whose sink is a
//! [`SessionPipeline`]. The pipeline runs on the capture thread: it decodes
//! each frame, feeds the statistics aggregator, logs anomalies as buckets are
//! finalized, and hands periodic session snapshots to a [`SessionWriter`]
//! thread. When capture ends the pipeline comes back through
//! [`Monitor::wait`], is flushed and saved one last time on the waiting
//! thread, and becomes a [`SessionReport`].

pub mod config;
pub mod decode;
pub mod filter;
pub mod source;
pub mod types;
pub mod worker;
pub mod writer;

use crate::anomaly::AnomalyEngine;
use crate::error::CaptureError;
use crate::logger::{Event, SharedLogger};
use crate::monitor::decode::decode;
use crate::monitor::source::{CaptureBackend, CapturedPacket};
use crate::monitor::types::*;
use crate::monitor::worker::{CaptureWorker, PacketSink, WorkerControl};
use crate::monitor::writer::SessionWriter;
use crate::stats::{StatsAggregator, StatsConfig};

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Configuration bundle passed from `main` into the monitoring engine.
pub struct MonitorConfig {
    /// Device, filter and promiscuous flag for the capture.
    pub request:       CaptureRequest,
    /// Adaptive scoring parameters.
    pub detector:      DetectorConfig,
    /// Heuristic rule thresholds.
    pub heuristics:    Heuristics,
    /// History window for new/recurring classification.
    pub stats_config:  StatsConfig,
    /// Where session JSON is written. `None` disables persistence.
    pub sessions_dir:  Option<PathBuf>,
    /// Save every this many seconds of capture time; 0 saves only at the end.
    pub save_interval: u64,
    /// Fixed session start (live capture). `None` starts the session at the
    /// first packet's timestamp, which is what replaying a file needs.
    pub session_start: Option<DateTime<Utc>>,
    /// Shared structured logger.
    pub logger:        SharedLogger,
    /// Shared session statistics for the shutdown summary.
    pub stats:         SharedStats,
}

/// Packet sink that turns captured frames into per-second statistics.
pub struct SessionPipeline {
    aggregator:    Option<StatsAggregator>,
    session_start: Option<DateTime<Utc>>,
    detector:      DetectorConfig,
    heuristics:    Heuristics,
    stats_config:  StatsConfig,
    sessions_dir:  Option<PathBuf>,
    save_interval: u64,
    last_save:     u64,
    writer:        Option<SessionWriter>,
    queued_saves:  u64,
    next_row:      usize,
    undecoded:     u64,
    logger:        SharedLogger,
    stats:         SharedStats,
}

impl SessionPipeline {
    pub fn new(cfg: &MonitorConfig) -> Self {
        Self {
            aggregator:    None,
            session_start: cfg.session_start,
            detector:      cfg.detector.clone(),
            heuristics:    cfg.heuristics.clone(),
            stats_config:  cfg.stats_config,
            sessions_dir:  cfg.sessions_dir.clone(),
            save_interval: cfg.save_interval,
            last_save:     0,
            writer:        None,
            queued_saves:  0,
            next_row:      0,
            undecoded:     0,
            logger:        Arc::clone(&cfg.logger),
            stats:         Arc::clone(&cfg.stats),
        }
    }

    /// Feeds one decoded tuple to the aggregator. `row` is the packet's
    /// position in the capture, used to point anomalies back at packets.
    pub fn record(
        &mut self,
        timestamp: DateTime<Utc>,
        protocol:  &str,
        src:       &str,
        dst:       &str,
        size:      u64,
        row:       usize,
    ) {
        let (detector, heuristics, stats_config) =
            (&self.detector, &self.heuristics, self.stats_config);
        let start = self.session_start.unwrap_or(timestamp);
        let aggregator = self.aggregator.get_or_insert_with(|| {
            StatsAggregator::new(
                start,
                stats_config,
                AnomalyEngine::new(detector.clone(), heuristics.clone()),
            )
        });

        let event = aggregator.record_packet(timestamp, protocol, src, dst, size, Some(row));
        self.stats.dropped.store(aggregator.dropped(), Ordering::Relaxed);

        if let Some(event) = event {
            self.stats.alerts_emitted.fetch_add(1, Ordering::Relaxed);
            self.logger.log(&Event::Anomaly {
                second:  event.second,
                score:   event.score,
                summary: &event.summary,
            });
        }
        self.maybe_save();
    }

    /// Queues a mid-session save once enough capture time has been
    /// finalized. The open bucket is left alone so its remaining packets are
    /// not turned away, and the write itself happens on the writer thread.
    fn maybe_save(&mut self) {
        if self.save_interval == 0 {
            return;
        }
        let (Some(dir), Some(aggregator)) = (&self.sessions_dir, &self.aggregator) else {
            return;
        };
        let Some(latest) = aggregator.finalized().last().map(|b| b.second) else {
            return;
        };
        if latest < self.last_save + self.save_interval {
            return;
        }
        self.last_save = latest;

        let doc = aggregator.document();
        let writer = self
            .writer
            .get_or_insert_with(|| SessionWriter::spawn(dir.clone(), Arc::clone(&self.logger)));
        if writer.submit(doc) {
            self.queued_saves += 1;
        } else {
            self.writer = None;
            self.save_interval = 0;
            self.logger.log(&Event::Warning {
                message: "session writer stopped; periodic saves disabled",
            });
        }
    }

    /// Mid-session snapshots handed to the writer thread so far.
    pub fn queued_saves(&self) -> u64 {
        self.queued_saves
    }

    pub fn aggregator(&self) -> Option<&StatsAggregator> {
        self.aggregator.as_ref()
    }

    /// Frames the decoder could not attribute to two endpoints.
    pub fn undecoded(&self) -> u64 {
        self.undecoded
    }

    /// Flushes the open second and writes the final session file, replacing
    /// whatever the writer thread left behind.
    pub fn finish(mut self) -> SessionReport {
        let mut saved = None;
        let periodic = self.writer.take().and_then(SessionWriter::finish);
        if let Some(aggregator) = self.aggregator.as_mut() {
            if let Some(path) = periodic {
                aggregator.adopt_file_path(path);
            }
            if let Some(event) = aggregator.finalize_pending_data() {
                self.stats.alerts_emitted.fetch_add(1, Ordering::Relaxed);
                self.logger.log(&Event::Anomaly {
                    second:  event.second,
                    score:   event.score,
                    summary: &event.summary,
                });
            }
            if let Some(dir) = &self.sessions_dir {
                saved = save(aggregator, dir, true, &self.logger);
            }
        }

        SessionReport {
            aggregator: self.aggregator,
            saved,
            undecoded: self.undecoded,
            capture_result: Ok(()),
        }
    }
}

impl PacketSink for SessionPipeline {
    fn on_packet(&mut self, packet: CapturedPacket<'_>) {
        let row = self.next_row;
        self.next_row += 1;

        match decode(packet.link_type, packet.data) {
            Some(decoded) => self.record(
                packet.timestamp,
                &decoded.protocol,
                &decoded.src,
                &decoded.dst,
                packet.wire_len as u64,
                row,
            ),
            None => self.undecoded += 1,
        }
    }
}

fn save(
    aggregator: &mut StatsAggregator,
    dir:        &Path,
    finalize:   bool,
    logger:     &SharedLogger,
) -> Option<PathBuf> {
    match aggregator.persist(dir, finalize) {
        Ok(Some(path)) => {
            logger.log(&Event::SessionSaved {
                path:    &path.display().to_string(),
                seconds: aggregator.finalized().len(),
            });
            Some(path)
        }
        Ok(None) => None,
        Err(e) => {
            logger.log(&Event::SessionSaveFailed {
                dir:   &dir.display().to_string(),
                error: &e.to_string(),
            });
            None
        }
    }
}

/// Everything known about a session once capture has ended.
pub struct SessionReport {
    /// `None` if no decodable packet ever arrived.
    pub aggregator:     Option<StatsAggregator>,
    /// Path of the final session file, if one was written.
    pub saved:          Option<PathBuf>,
    pub undecoded:      u64,
    /// Terminal status of the capture loop.
    pub capture_result: Result<(), CaptureError>,
}

impl SessionReport {
    pub fn seconds_finalized(&self) -> usize {
        self.aggregator.as_ref().map_or(0, |a| a.finalized().len())
    }

    pub fn anomaly_count(&self) -> usize {
        self.aggregator.as_ref().map_or(0, |a| a.anomalies().len())
    }
}

/// A running capture session.
pub struct Monitor {
    worker:  CaptureWorker<SessionPipeline>,
    started: Instant,
    logger:  SharedLogger,
    stats:   SharedStats,
}

impl Monitor {
    /// Opens the capture on its own thread and starts feeding the pipeline.
    pub fn start<B: CaptureBackend>(backend: B, cfg: MonitorConfig) -> Self {
        let pipeline = SessionPipeline::new(&cfg);
        let worker = CaptureWorker::start(
            backend,
            cfg.request,
            pipeline,
            Arc::clone(&cfg.logger),
            Arc::clone(&cfg.stats),
        );
        Self {
            worker,
            started: Instant::now(),
            logger: cfg.logger,
            stats: cfg.stats,
        }
    }

    /// Handle for stopping the capture or swapping its filter from elsewhere.
    pub fn control(&self) -> WorkerControl {
        self.worker.control()
    }

    /// Waits for capture to end, then finalizes and saves the session and
    /// logs its summary. Only a panicked capture thread is an `Err`; capture
    /// failures are carried in [`SessionReport::capture_result`].
    pub fn wait(self) -> Result<SessionReport, CaptureError> {
        let outcome = self.worker.join()?;
        let mut report = outcome.sink.finish();
        report.capture_result = outcome.result;

        self.logger.log(&Event::SessionSummary {
            duration_secs:     self.started.elapsed().as_secs(),
            packets_total:     self.stats.packets_total.load(Ordering::Relaxed),
            bytes_total:       self.stats.bytes_total.load(Ordering::Relaxed),
            seconds_finalized: report.seconds_finalized(),
            anomalies:         report.anomaly_count(),
            filter_swaps:      self.stats.filter_swaps.load(Ordering::Relaxed),
            dropped:           self.stats.dropped.load(Ordering::Relaxed),
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use chrono::{Duration, TimeZone};
    use etherparse::PacketBuilder;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn config(dir: Option<PathBuf>, save_interval: u64, start: Option<DateTime<Utc>>) -> MonitorConfig {
        MonitorConfig {
            request:       CaptureRequest::new("test0", "", true),
            detector:      DetectorConfig::default(),
            heuristics:    Heuristics::default(),
            stats_config:  StatsConfig::default(),
            sessions_dir:  dir,
            save_interval,
            session_start: start,
            logger:        Logger::shared_quiet(),
            stats:         SessionStats::new(),
        }
    }

    fn frame(src: [u8; 4], dst: [u8; 4], dst_port: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4(src, dst, 64)
            .tcp(40000, dst_port, 1, 1024);
        let mut out = Vec::new();
        builder.write(&mut out, &[0u8; 20]).unwrap();
        out
    }

    fn captured(at: DateTime<Utc>, data: &[u8]) -> CapturedPacket<'_> {
        CapturedPacket {
            timestamp: at,
            data,
            wire_len: data.len() as u32,
            link_type: decode::LINKTYPE_ETHERNET,
        }
    }

    #[test]
    fn pipeline_decodes_and_numbers_rows() {
        let cfg = config(None, 0, Some(t0()));
        let mut pipeline = SessionPipeline::new(&cfg);

        let a = frame([10, 0, 0, 1], [10, 0, 0, 2], 443);
        pipeline.on_packet(captured(t0(), &a));
        pipeline.on_packet(captured(t0(), &[0u8; 3]));
        pipeline.on_packet(captured(t0() + Duration::milliseconds(1500), &a));

        assert_eq!(pipeline.undecoded(), 1);
        let agg = pipeline.aggregator().unwrap();
        assert_eq!(agg.finalized().len(), 1);
        assert_eq!(agg.finalized()[0].protocol_counts["TLS"], 1);
        // Row 1 went to the undecodable frame.
        assert_eq!(agg.finalized()[0].rows, vec![0]);
    }

    #[test]
    fn replay_session_starts_at_first_packet() {
        let cfg = config(None, 0, None);
        let mut pipeline = SessionPipeline::new(&cfg);
        let first = t0() + Duration::hours(5);

        let a = frame([10, 0, 0, 1], [10, 0, 0, 2], 80);
        pipeline.on_packet(captured(first, &a));

        let agg = pipeline.aggregator().unwrap();
        assert_eq!(agg.session_start(), first);
        assert_eq!(agg.open_second(), Some(0));
    }

    #[test]
    fn finish_flushes_and_saves() {
        let dir = TempDir::new().unwrap();
        let cfg = config(Some(dir.path().to_path_buf()), 0, Some(t0()));
        let stats = Arc::clone(&cfg.stats);
        let mut pipeline = SessionPipeline::new(&cfg);

        let a = frame([10, 0, 0, 1], [10, 0, 0, 2], 80);
        pipeline.on_packet(captured(t0(), &a));

        let report = pipeline.finish();
        assert_eq!(report.seconds_finalized(), 1);
        let path = report.saved.expect("session file");
        assert!(path.exists());
        // The first second always carries a new protocol.
        assert_eq!(stats.alerts_emitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn periodic_save_follows_capture_time() {
        let dir = TempDir::new().unwrap();
        let cfg = config(Some(dir.path().to_path_buf()), 5, Some(t0()));
        let mut pipeline = SessionPipeline::new(&cfg);
        let a = frame([10, 0, 0, 1], [10, 0, 0, 2], 80);

        for s in 0..5 {
            pipeline.on_packet(captured(t0() + Duration::seconds(s), &a));
        }
        assert_eq!(pipeline.queued_saves(), 0);

        // Finalizes second 4, then second 5 once 6 arrives.
        pipeline.on_packet(captured(t0() + Duration::seconds(5), &a));
        pipeline.on_packet(captured(t0() + Duration::seconds(6), &a));
        assert_eq!(pipeline.queued_saves(), 1);
        assert_eq!(pipeline.aggregator().unwrap().open_second(), Some(6));
    }

    #[test]
    fn packet_path_never_writes_session_files() {
        let dir = TempDir::new().unwrap();
        let cfg = config(Some(dir.path().to_path_buf()), 1, Some(t0()));
        let mut pipeline = SessionPipeline::new(&cfg);
        let a = frame([10, 0, 0, 1], [10, 0, 0, 2], 80);

        for s in 0..8 {
            pipeline.on_packet(captured(t0() + Duration::seconds(s), &a));
        }
        assert!(pipeline.queued_saves() > 0);
        // Every periodic write went to the writer thread.
        assert!(pipeline.aggregator().unwrap().last_file_path().is_none());

        let report = pipeline.finish();
        let saved = report.saved.expect("final save");
        let files: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|x| x == "json"))
            .collect();
        assert_eq!(files, vec![saved.clone()]);
        assert_eq!(crate::stats::load_session(&saved).unwrap().per_second.len(), 8);
    }

    #[test]
    fn empty_session_reports_nothing() {
        let cfg = config(None, 0, None);
        let report = SessionPipeline::new(&cfg).finish();
        assert!(report.aggregator.is_none());
        assert_eq!(report.seconds_finalized(), 0);
        assert_eq!(report.anomaly_count(), 0);
    }
}
