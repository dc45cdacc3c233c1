use crate::monitor::config::*;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// What the owner asks the capture worker to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Interface name (ignored by offline backends).
    pub interface:   String,
    /// Initial BPF expression. Empty matches everything.
    pub filter:      String,
    /// Put the interface into promiscuous mode.
    pub promiscuous: bool,
}

impl CaptureRequest {
    pub fn new(interface: impl Into<String>, filter: impl Into<String>, promiscuous: bool) -> Self {
        Self {
            interface: interface.into(),
            filter: filter.into(),
            promiscuous,
        }
    }
}

/// Network address and mask of the capture interface, as used for filter
/// compilation. Both default to 0.0.0.0 when the lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Netmask {
    pub net:  Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Default for Netmask {
    fn default() -> Self {
        Self {
            net:  Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl fmt::Display for Netmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net, self.mask)
    }
}

/// The live state of one open capture.
///
/// Created once the device is open, its `filter` tracks the expression last
/// installed successfully; a rejected hot-swap leaves it unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub interface:   String,
    pub filter:      String,
    pub promiscuous: bool,
    pub link_type:   i32,
    pub netmask:     Netmask,
}

/// Lifecycle of a capture worker.
///
/// `Idle → Opening → Running ⇄ FilterSwapping → Stopped`. A filter swap is a
/// single loop iteration; the worker returns to `Running` unless a stop was
/// requested meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Opening = 1,
    Running = 2,
    FilterSwapping = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Opening,
            2 => WorkerState::Running,
            3 => WorkerState::FilterSwapping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Atomic cell holding a [`WorkerState`], readable from any thread.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Running totals for the whole session, shared between the capture thread
/// and whoever prints the shutdown summary.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Packets delivered by the capture handle.
    pub packets_total:   AtomicU64,
    /// Bytes on the wire for those packets.
    pub bytes_total:     AtomicU64,
    /// Filter hot-swaps that installed successfully.
    pub filter_swaps:    AtomicU64,
    /// Filter expressions rejected at compile or install time.
    pub filter_failures: AtomicU64,
    /// Packets that could not be attributed (undecodable or out of order).
    pub dropped:         AtomicU64,
    /// Anomaly events emitted.
    pub alerts_emitted:  AtomicU64,
}

pub type SharedStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }
}

/// Tunables for the adaptive metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub threshold:             f64,
    pub warmup:                u32,
    pub alpha_packets:         f64,
    pub alpha_bytes:           f64,
    pub alpha_connections:     f64,
    pub alpha_new_connections: f64,
    pub alpha_entropy:         f64,
    pub alpha_avg_size:        f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold:             SCORE_THRESHOLD,
            warmup:                WARMUP,
            alpha_packets:         ALPHA_PACKETS,
            alpha_bytes:           ALPHA_BYTES,
            alpha_connections:     ALPHA_CONNECTIONS,
            alpha_new_connections: ALPHA_NEW_CONNECTIONS,
            alpha_entropy:         ALPHA_ENTROPY,
            alpha_avg_size:        ALPHA_AVG_SIZE,
        }
    }
}

/// Thresholds for the layered heuristic rules.
#[derive(Debug, Clone, PartialEq)]
pub struct Heuristics {
    pub dominance_share:        f64,
    pub churn_min_new:          usize,
    pub churn_ratio:            f64,
    pub ddos_min_sources:       usize,
    pub ddos_min_packets:       u64,
    pub ddos_min_share:         f64,
    pub flood_min_destinations: usize,
    pub flood_min_packets:      u64,
    pub flood_min_share:        f64,
    pub scan_min_destinations:  usize,
    pub scan_min_packets:       u64,
    pub top_source_share:       f64,
    pub top_source_min_packets: u64,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            dominance_share:        DOMINANCE_SHARE,
            churn_min_new:          CHURN_MIN_NEW,
            churn_ratio:            CHURN_RATIO,
            ddos_min_sources:       DDOS_MIN_SOURCES,
            ddos_min_packets:       DDOS_MIN_PACKETS,
            ddos_min_share:         DDOS_MIN_SHARE,
            flood_min_destinations: FLOOD_MIN_DESTINATIONS,
            flood_min_packets:      FLOOD_MIN_PACKETS,
            flood_min_share:        FLOOD_MIN_SHARE,
            scan_min_destinations:  SCAN_MIN_DESTINATIONS,
            scan_min_packets:       SCAN_MIN_PACKETS,
            top_source_share:       TOP_SOURCE_SHARE,
            top_source_min_packets: TOP_SOURCE_MIN_PACKETS,
        }
    }
}
