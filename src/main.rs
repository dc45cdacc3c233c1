mod cli;

use chrono::Utc;
use clap::Parser;
use cli::Cli;
use pktpulse::logger::{Event, Logger, SharedLogger};
use pktpulse::monitor::source::PcapBackend;
use pktpulse::monitor::types::{CaptureRequest, DetectorConfig, Heuristics, SessionStats};
use pktpulse::monitor::{Monitor, MonitorConfig};
use pktpulse::stats::StatsConfig;
use pktpulse::WorkerControl;
use std::io::BufRead;
use std::process;
use std::sync::Arc;

fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize logger with optional JSON output and file logging
    let logger: SharedLogger = match Logger::new(cli.json, cli.log_file.as_deref()) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            eprintln!("cannot open log file: {}", e);
            process::exit(2);
        }
    };

    let stats = SessionStats::new();

    // ── Source selection ─────────────────────────────────────────────────────
    // A pcap file takes precedence over any interface; its packets carry
    // their own timestamps, so the session starts at the first one.
    let (backend, interface, session_start) = match &cli.pcap_file {
        Some(path) => {
            logger.log(&Event::Info {
                message: &format!("Replay mode: reading from {}", path.display()),
            });
            (PcapBackend::offline(path), path.display().to_string(), None)
        }
        None => {
            let iface = match cli.interface.clone() {
                Some(name) => name,
                None => match PcapBackend::default_device() {
                    Ok(name) => name,
                    Err(e) => {
                        logger.log(&Event::CaptureFailed { error: &e });
                        process::exit(1);
                    }
                },
            };
            (PcapBackend::live(), iface, Some(Utc::now()))
        }
    };

    let cfg = MonitorConfig {
        request:       CaptureRequest::new(interface, cli.filter.clone(), !cli.no_promisc),
        detector:      build_detector(&cli),
        heuristics:    Heuristics::default(),
        stats_config:  StatsConfig { history_window: cli.history_window },
        sessions_dir:  cli.sessions_dir.clone(),
        save_interval: cli.save_interval,
        session_start,
        logger:        Arc::clone(&logger),
        stats:         Arc::clone(&stats),
    };

    let monitor = Monitor::start(backend, cfg);

    register_shutdown_handler(monitor.control());
    if cli.filter_stdin {
        spawn_filter_reader(monitor.control(), Arc::clone(&logger));
    }

    let report = match monitor.wait() {
        Ok(report) => report,
        Err(e) => {
            logger.log(&Event::CaptureFailed { error: &e.to_string() });
            process::exit(1);
        }
    };

    // The worker already logged the failure; only the exit code is left.
    if report.capture_result.is_err() {
        process::exit(1);
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Registers a signal handler that stops the capture on Ctrl+C.
fn register_shutdown_handler(control: WorkerControl) {
    let result = ctrlc::set_handler(move || {
        println!("\n[!] Ctrl+C received, stopping capture...");
        control.stop();
    });
    if let Err(e) = result {
        eprintln!("failed to register Ctrl+C handler: {}", e);
    }
}

/// Hot-swaps the capture filter with every non-empty line read from stdin.
/// The reader thread is detached; it ends with stdin or the process.
fn spawn_filter_reader(control: WorkerControl, logger: SharedLogger) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let expression = line.trim();
            if expression.is_empty() {
                continue;
            }
            logger.log(&Event::Info {
                message: &format!("Filter update requested: {}", expression),
            });
            control.update_filter(expression);
        }
    });
}

/// Builds the adaptive-scoring configuration from command-line arguments.
fn build_detector(cli: &Cli) -> DetectorConfig {
    DetectorConfig {
        threshold: cli.threshold,
        warmup:    cli.warmup,
        ..DetectorConfig::default()
    }
}
