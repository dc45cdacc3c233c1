//! Structured logging for pktpulse.
//!
//! Provides a [`Logger`] that writes events to stdout and optionally to a log
//! file. Output can be formatted as human-readable plain text or as
//! newline-delimited JSON (NDJSON) for log shippers.
//!
//! The capture thread logs through the same shared logger as the control
//! thread, so every write goes through a single `Mutex`-guarded file handle.

use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds that pktpulse can emit.
///
/// The `#[serde(tag = "event")]` attribute puts an `"event"` key into every
/// JSON line so consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Informational startup / status message.
    Info { message: &'a str },

    /// Non-fatal problem worth surfacing.
    Warning { message: &'a str },

    /// The capture handle is open and the loop is about to start.
    CaptureOpened {
        iface:     &'a str,
        link_type: i32,
        netmask:   &'a str,
    },

    /// Netmask lookup failed; filters compile against 0.0.0.0.
    NetmaskFallback { iface: &'a str, error: &'a str },

    /// A filter expression was compiled and installed on the handle.
    FilterInstalled { expression: &'a str },

    /// A filter expression was rejected; the previous filter stays active.
    FilterRejected { expression: &'a str, error: &'a str },

    /// The capture loop terminated on a fatal error.
    CaptureFailed { error: &'a str },

    /// A finalized second was scored as anomalous.
    Anomaly {
        second:  u64,
        score:   f64,
        summary: &'a str,
    },

    /// Session statistics were written to disk.
    SessionSaved { path: &'a str, seconds: usize },

    /// Session statistics could not be written.
    SessionSaveFailed { dir: &'a str, error: &'a str },

    /// Session summary emitted on shutdown.
    SessionSummary {
        duration_secs:     u64,
        packets_total:     u64,
        bytes_total:       u64,
        seconds_finalized: usize,
        anomalies:         usize,
        filter_swaps:      u64,
        dropped:           u64,
    },
}

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe structured logger.
///
/// Constructed once in `main` and passed as an `Arc<Logger>` to every module
/// that needs to emit events.
pub struct Logger {
    /// Whether to format events as NDJSON instead of plain text.
    json:   bool,
    /// Whether events are echoed to stdout.
    stdout: bool,
    /// Optional buffered file writer. `None` when `--log-file` was not given.
    file:   Option<Mutex<BufWriter<std::fs::File>>>,
}

/// Type alias used throughout the codebase for convenience.
pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger.
    ///
    /// # Arguments
    /// * `json`     - Emit NDJSON instead of plain text when `true`.
    /// * `log_path` - If `Some`, open (or create) this file for appended writes.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(json: bool, log_path: Option<&str>) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };

        Ok(Self { json, stdout: true, file })
    }

    /// A logger that discards every event. Used by library callers that
    /// consume events programmatically, and by tests.
    pub fn quiet() -> Self {
        Self { json: false, stdout: false, file: None }
    }

    /// Convenience constructor for the shared form.
    pub fn shared_quiet() -> SharedLogger {
        Arc::new(Self::quiet())
    }

    /// Logs a single [`Event`], writing to stdout and optionally to the log file.
    pub fn log(&self, event: &Event) {
        if !self.stdout && self.file.is_none() {
            return;
        }

        let line = self.render(event);

        if self.stdout {
            println!("{}", line);
        }

        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    /// Renders one event as a complete output line, timestamp included.
    fn render(&self, event: &Event) -> String {
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        if self.json {
            // Serialise to a Value first so the timestamp can be injected.
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert(
                    "timestamp".to_string(),
                    serde_json::Value::String(timestamp),
                );
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            format!("[{}] {}", timestamp, plain_text(event))
        }
    }
}

/// Formats an [`Event`] as a human-readable plain-text string (no timestamp).
fn plain_text(event: &Event) -> String {
    match event {
        Event::Info { message } =>
            format!("[INFO] {}", message),

        Event::Warning { message } =>
            format!("[WARN] {}", message),

        Event::CaptureOpened { iface, link_type, netmask } =>
            format!("[CAPTURE] {} linktype={} netmask={}", iface, link_type, netmask),

        Event::NetmaskFallback { iface, error } =>
            format!("[NETMASK] {} lookup failed ({}), using 0.0.0.0", iface, error),

        Event::FilterInstalled { expression } =>
            format!("[FILTER] installed '{}'", expression),

        Event::FilterRejected { expression, error } =>
            format!("[FILTER] rejected '{}': {}", expression, error),

        Event::CaptureFailed { error } =>
            format!("[CAPTURE FAILED] {}", error),

        Event::Anomaly { second, score, summary } =>
            format!("[ANOMALY] t+{}s score={:.2} {}", second, score, summary),

        Event::SessionSaved { path, seconds } =>
            format!("[SAVED] {} ({} seconds)", path, seconds),

        Event::SessionSaveFailed { dir, error } =>
            format!("[SAVE FAILED] {}: {}", dir, error),

        Event::SessionSummary {
            duration_secs, packets_total, bytes_total, seconds_finalized,
            anomalies, filter_swaps, dropped,
        } => format!(
            "[SUMMARY] duration={}s packets={} bytes={} seconds={} anomalies={} filter_swaps={} dropped={}",
            duration_secs, packets_total, bytes_total, seconds_finalized,
            anomalies, filter_swaps, dropped
        ),
    }
}
