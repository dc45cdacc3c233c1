use std::time::Duration;

// ── Capture ─────────────────────────────────────────────────────────────────

/// Read timeout handed to libpcap.
///
/// Interrupts are the primary way to break a blocking read, but some libpcap
/// builds only notice `pcap_breakloop` when the current read returns. With a
/// 200 ms timeout an idle interface still wakes the loop often enough for a
/// stop or filter swap to be picked up promptly.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_millis(200);

/// Snapshot length for live captures. Only header fields are aggregated, but
/// the full frame length is kept so `wire_len` and `caplen` agree on normal links.
pub const SNAPLEN: i32 = 65_535;

/// Filter used when none is given on the command line (matches everything).
pub const DEFAULT_FILTER: &str = "";

// ── Aggregation ─────────────────────────────────────────────────────────────

/// Number of finalized seconds used to decide whether a connection or
/// protocol is "new". Classification never looks further back than this.
pub const HISTORY_WINDOW: usize = 30;

// ── Adaptive scoring ────────────────────────────────────────────────────────

/// |z-score| above which an adaptive signal contributes a reason.
pub const SCORE_THRESHOLD: f64 = 2.8;

/// Observations a metric must have absorbed before its scores count.
pub const WARMUP: u32 = 6;

/// Lower bound on EWMA variance. Keeps a perfectly steady signal from
/// producing an infinite score on its first deviation.
pub const MIN_VARIANCE: f64 = 1e-4;

/// EWMA smoothing factors, one per monitored signal.
pub const ALPHA_PACKETS:         f64 = 0.15;
pub const ALPHA_BYTES:           f64 = 0.15;
pub const ALPHA_CONNECTIONS:     f64 = 0.12;
pub const ALPHA_NEW_CONNECTIONS: f64 = 0.12;
pub const ALPHA_ENTROPY:         f64 = 0.10;
pub const ALPHA_AVG_SIZE:        f64 = 0.10;

// ── Heuristic rules ─────────────────────────────────────────────────────────

/// Share of a second's packets one protocol must reach to be "dominant".
pub const DOMINANCE_SHARE: f64 = 0.65;

/// Connection churn: more than this many new connections...
pub const CHURN_MIN_NEW: usize = 5;
/// ...making up more than this fraction of the second's unique connections.
pub const CHURN_RATIO: f64 = 0.6;

/// DDoS target: distinct sources, packets and share of the second.
pub const DDOS_MIN_SOURCES: usize = 8;
pub const DDOS_MIN_PACKETS: u64 = 40;
pub const DDOS_MIN_SHARE:   f64 = 0.35;

/// Single-source flood: distinct destinations, packets and share.
pub const FLOOD_MIN_DESTINATIONS: usize = 15;
pub const FLOOD_MIN_PACKETS:      u64 = 60;
pub const FLOOD_MIN_SHARE:        f64 = 0.25;

/// Scan: distinct destinations and packets, checked only below flood level.
pub const SCAN_MIN_DESTINATIONS: usize = 8;
pub const SCAN_MIN_PACKETS:      u64 = 40;

/// Dominant source: share of the second and minimum packets.
pub const TOP_SOURCE_SHARE:       f64 = 0.55;
pub const TOP_SOURCE_MIN_PACKETS: u64 = 30;
