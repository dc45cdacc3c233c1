use clap::Parser;
use std::path::PathBuf;

/// pktpulse: live traffic capture with per-second statistics and adaptive
/// anomaly scoring.
///
/// Captures from one interface (or replays a pcap file), buckets traffic by
/// second, scores every finished second against its own recent history and
/// writes the session to JSON when capture ends.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "pktpulse",
    version = "0.3.0",
    about   = "Live packet capture with per-second statistics and anomaly scoring",
    long_about = None,
)]
pub struct Cli {
    // ── Capture ──────────────────────────────────────────────────────────────

    /// Network interface to capture on.
    ///
    /// If omitted, libpcap's default device is used. Use `ip link` or
    /// `ifconfig` to list available interfaces.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interface: Option<String>,

    /// Packet filter expression (BPF syntax), e.g. "tcp or udp port 53".
    ///
    /// An invalid expression is reported and capture runs unfiltered.
    #[arg(short = 'f', long = "filter", value_name = "EXPR", default_value = pktpulse::monitor::config::DEFAULT_FILTER)]
    pub filter: String,

    /// Do not put the interface into promiscuous mode.
    #[arg(long = "no-promisc")]
    pub no_promisc: bool,

    /// Read filter expressions from stdin, one per line, and hot-swap each
    /// onto the running capture.
    #[arg(long = "filter-stdin")]
    pub filter_stdin: bool,

    // ── PCAP Replay ──────────────────────────────────────────────────────────

    /// Read packets from a saved pcap file instead of a live interface.
    ///
    /// The session starts at the first packet's timestamp and every second is
    /// measured from packet metadata rather than the wall clock.
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    pub pcap_file: Option<PathBuf>,

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Directory session JSON files are written to. Created if missing.
    /// When omitted, nothing is persisted.
    #[arg(short = 'd', long = "sessions-dir", value_name = "DIR")]
    pub sessions_dir: Option<PathBuf>,

    /// Also save the session every SECS seconds of capture time (0 = only
    /// when capture ends).
    #[arg(long = "save-interval", value_name = "SECS", default_value_t = 0)]
    pub save_interval: u64,

    // ── Detection (overrides config.rs defaults) ─────────────────────────────

    /// |z-score| above which an adaptive signal is reported.
    #[arg(long = "threshold", value_name = "SIGMA", default_value_t = pktpulse::monitor::config::SCORE_THRESHOLD)]
    pub threshold: f64,

    /// Seconds each adaptive signal observes before its scores count.
    #[arg(long = "warmup", value_name = "N", default_value_t = pktpulse::monitor::config::WARMUP)]
    pub warmup: u32,

    /// Finalized seconds remembered when deciding whether a connection or
    /// protocol is new.
    #[arg(long = "history-window", value_name = "SECS", default_value_t = pktpulse::monitor::config::HISTORY_WINDOW)]
    pub history_window: usize,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write log output to this file in addition to stdout.
    ///
    /// The file is created if it does not exist and appended to if it does.
    /// JSON mode (--json) affects the format written to this file as well.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit log entries as newline-delimited JSON (NDJSON).
    ///
    /// Each event is a self-contained JSON object on its own line, suitable
    /// for ingestion by log shippers or SIEM platforms.
    #[arg(short = 'j', long = "json")]
    pub json: bool,
}
