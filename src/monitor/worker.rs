//! Capture worker: owns the capture handle and its dedicated thread.
//!
//! The dispatch loop can block indefinitely on an idle interface, so neither
//! `stop` nor `update_filter` relies on a polled flag alone. Both record their
//! request and then break the in-progress read through the handle's
//! [`Interrupter`]; the loop wakes, looks at what was requested, and either
//! exits or swaps the filter and resumes.

use crate::error::CaptureError;
use crate::logger::{Event, SharedLogger};
use crate::monitor::filter::{resolve_netmask, FilterCompiler};
use crate::monitor::source::{CaptureBackend, CaptureHandle, CapturedPacket, Dispatch, Interrupter};
use crate::monitor::types::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Receives every packet the capture handle delivers.
///
/// Runs synchronously on the capture thread and gates the next read, so
/// implementations must not block.
pub trait PacketSink: Send + 'static {
    fn on_packet(&mut self, packet: CapturedPacket<'_>);
}

impl<F> PacketSink for F
where
    F: FnMut(CapturedPacket<'_>) + Send + 'static,
{
    fn on_packet(&mut self, packet: CapturedPacket<'_>) {
        self(packet)
    }
}

/// State shared between the capture thread and its controllers.
struct Control {
    running:     AtomicBool,
    state:       StateCell,
    /// Staged filter expression. `Some` means a swap is pending.
    pending:     Mutex<Option<String>>,
    interrupter: Mutex<Option<Box<dyn Interrupter>>>,
    session:     Mutex<Option<CaptureSession>>,
}

impl Control {
    fn new() -> Self {
        Self {
            running:     AtomicBool::new(true),
            state:       StateCell::new(WorkerState::Idle),
            pending:     Mutex::new(None),
            interrupter: Mutex::new(None),
            session:     Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        if let Ok(guard) = self.interrupter.lock() {
            if let Some(interrupter) = guard.as_ref() {
                interrupter.interrupt();
            }
        }
    }

    fn set_interrupter(&self, interrupter: Option<Box<dyn Interrupter>>) {
        if let Ok(mut guard) = self.interrupter.lock() {
            *guard = interrupter;
        }
    }

    fn take_pending(&self) -> Option<String> {
        self.pending.lock().ok().and_then(|mut guard| guard.take())
    }

    fn publish(&self, session: CaptureSession) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = Some(session);
        }
    }

    fn record_filter(&self, expression: &str) {
        if let Ok(mut guard) = self.session.lock() {
            if let Some(session) = guard.as_mut() {
                session.filter = expression.to_string();
            }
        }
    }
}

/// Cloneable, thread-safe handle for steering a running [`CaptureWorker`].
#[derive(Clone)]
pub struct WorkerControl {
    inner: Arc<Control>,
}

impl WorkerControl {
    /// Requests cancellation and breaks the current blocking read.
    /// Safe to call any number of times, from any thread.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.interrupt();
    }

    /// Stages `expression` as the next filter and breaks the current read so
    /// the loop installs it before dispatching again. Capture keeps running.
    /// If several calls land before the loop wakes, the last one wins.
    pub fn update_filter(&self, expression: impl Into<String>) {
        if let Ok(mut guard) = self.inner.pending.lock() {
            *guard = Some(expression.into());
        }
        self.inner.interrupt();
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state.get()
    }

    /// The open session, once the device has been opened.
    pub fn session(&self) -> Option<CaptureSession> {
        self.inner.session.lock().ok().and_then(|guard| guard.clone())
    }
}

/// What the capture thread hands back when it ends.
pub struct CaptureOutcome<S> {
    /// The sink, with whatever state it accumulated.
    pub sink:   S,
    /// `Err` if the loop ended on a fatal error.
    pub result: Result<(), CaptureError>,
}

/// Runs a capture on its own thread, feeding packets to a [`PacketSink`].
pub struct CaptureWorker<S> {
    control: WorkerControl,
    handle:  Option<JoinHandle<(S, Result<(), CaptureError>)>>,
}

impl<S: PacketSink> CaptureWorker<S> {
    /// Spawns the capture thread. The device is opened on that thread; an open
    /// failure is terminal and surfaces through [`CaptureWorker::join`].
    pub fn start<B: CaptureBackend>(
        backend: B,
        request: CaptureRequest,
        sink:    S,
        logger:  SharedLogger,
        stats:   SharedStats,
    ) -> Self {
        let control = WorkerControl { inner: Arc::new(Control::new()) };
        let shared = Arc::clone(&control.inner);

        let handle = thread::spawn(move || {
            let mut sink = sink;
            let result = run_capture(&backend, &request, &mut sink, &shared, &logger, &stats);

            shared.set_interrupter(None);
            shared.state.set(WorkerState::Stopped);

            if let Err(e) = &result {
                logger.log(&Event::CaptureFailed { error: &e.to_string() });
            }
            (sink, result)
        });

        Self { control, handle: Some(handle) }
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn update_filter(&self, expression: impl Into<String>) {
        self.control.update_filter(expression);
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    /// Waits for the capture thread and returns its sink and terminal status.
    pub fn join(mut self) -> Result<CaptureOutcome<S>, CaptureError> {
        let handle = self.handle.take().ok_or(CaptureError::WorkerPanicked)?;
        let (sink, result) = handle.join().map_err(|_| CaptureError::WorkerPanicked)?;
        Ok(CaptureOutcome { sink, result })
    }
}

impl<S> Drop for CaptureWorker<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.control.stop();
            let _ = handle.join();
        }
    }
}

fn run_capture<B, S>(
    backend: &B,
    request: &CaptureRequest,
    sink:    &mut S,
    control: &Control,
    logger:  &SharedLogger,
    stats:   &SharedStats,
) -> Result<(), CaptureError>
where
    B: CaptureBackend,
    S: PacketSink,
{
    control.state.set(WorkerState::Opening);

    let mut handle = backend
        .open(&request.interface, request.promiscuous)
        .map_err(|reason| CaptureError::DeviceOpen {
            iface: request.interface.clone(),
            reason,
        })?;
    control.set_interrupter(Some(handle.interrupter()));

    let netmask = resolve_netmask(backend, &request.interface, logger);
    let mut compiler = FilterCompiler::new(netmask, false);

    // A bad initial filter is not fatal: capture runs unfiltered.
    install_filter(&mut compiler, &mut handle, &request.filter, logger, stats);

    let session = CaptureSession {
        interface:   request.interface.clone(),
        filter:      compiler.current().unwrap_or_default().to_string(),
        promiscuous: request.promiscuous,
        link_type:   handle.link_type(),
        netmask,
    };
    logger.log(&Event::CaptureOpened {
        iface:     &session.interface,
        link_type: session.link_type,
        netmask:   &session.netmask.to_string(),
    });
    control.publish(session);
    control.state.set(WorkerState::Running);

    while control.is_running() {
        if let Some(next) = control.take_pending() {
            control.state.set(WorkerState::FilterSwapping);
            if install_filter(&mut compiler, &mut handle, &next, logger, stats) {
                stats.filter_swaps.fetch_add(1, Ordering::Relaxed);
                control.record_filter(&next);
            }
            if control.is_running() {
                control.state.set(WorkerState::Running);
            }
        }

        let mut deliver = |packet: CapturedPacket<'_>| {
            stats.packets_total.fetch_add(1, Ordering::Relaxed);
            stats.bytes_total.fetch_add(packet.wire_len as u64, Ordering::Relaxed);
            sink.on_packet(packet);
        };

        match handle.dispatch(&mut deliver) {
            Ok(Dispatch::Delivered(_)) | Ok(Dispatch::Idle) | Ok(Dispatch::Interrupted) => {}
            Ok(Dispatch::Exhausted) => break,
            Err(e) => return Err(CaptureError::Dispatch(e)),
        }
    }

    Ok(())
}

/// Compiles and installs one expression, logging the outcome.
fn install_filter<H: CaptureHandle>(
    compiler:   &mut FilterCompiler<H::Program>,
    handle:     &mut H,
    expression: &str,
    logger:     &SharedLogger,
    stats:      &SharedStats,
) -> bool {
    match compiler.compile(handle, expression) {
        Ok(()) => {
            logger.log(&Event::FilterInstalled { expression });
            true
        }
        Err(e) => {
            stats.filter_failures.fetch_add(1, Ordering::Relaxed);
            logger.log(&Event::FilterRejected { expression, error: &e.to_string() });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::monitor::source::{ScriptedBackend, ScriptedFeed};
    use chrono::Utc;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Sink that records frames in a list the test can watch while running.
    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<String>>>);

    impl PacketSink for Collect {
        fn on_packet(&mut self, packet: CapturedPacket<'_>) {
            let text = String::from_utf8_lossy(packet.data).into_owned();
            self.0.lock().unwrap().push(text);
        }
    }

    impl Collect {
        fn seen(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn join_within(
        worker: CaptureWorker<Collect>,
        limit:  Duration,
    ) -> CaptureOutcome<Collect> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(worker.join());
        });
        rx.recv_timeout(limit)
            .expect("capture thread did not finish in time")
            .expect("capture thread panicked")
    }

    fn start(filter: &str) -> (CaptureWorker<Collect>, ScriptedFeed, Collect, SharedStats) {
        let (backend, feed) = ScriptedBackend::new();
        let sink = Collect::default();
        let stats = SessionStats::new();
        let worker = CaptureWorker::start(
            backend,
            CaptureRequest::new("test0", filter, true),
            sink.clone(),
            Logger::shared_quiet(),
            Arc::clone(&stats),
        );
        (worker, feed, sink, stats)
    }

    #[test]
    fn stop_breaks_idle_read_in_bounded_time() {
        let (worker, _feed, _sink, _stats) = start("");
        let control = worker.control();
        wait_for("running", || control.state() == WorkerState::Running);

        let began = Instant::now();
        worker.stop();
        let outcome = join_within(worker, Duration::from_secs(2));

        assert!(outcome.result.is_ok());
        assert!(began.elapsed() < Duration::from_secs(2));
        assert_eq!(control.state(), WorkerState::Stopped);
    }

    #[test]
    fn stop_is_idempotent() {
        let (worker, _feed, _sink, _stats) = start("");
        worker.stop();
        worker.stop();
        worker.control().stop();
        let outcome = join_within(worker, Duration::from_secs(2));
        assert!(outcome.result.is_ok());
    }

    #[test]
    fn filter_swap_keeps_old_packets_and_filters_new_ones() {
        let (worker, feed, sink, stats) = start("");
        let now = Utc::now();

        feed.packet(now, b"tcp 1");
        feed.packet(now, b"udp 2");
        wait_for("old-filter packets", || sink.seen().len() == 2);

        worker.update_filter("tcp");
        feed.packet(now, b"udp 3");
        feed.packet(now, b"tcp 4");
        feed.finish();

        let control = worker.control();
        let outcome = join_within(worker, Duration::from_secs(5));

        assert!(outcome.result.is_ok());
        assert_eq!(sink.seen(), vec!["tcp 1", "udp 2", "tcp 4"]);
        assert_eq!(feed.installed_filters(), vec!["".to_string(), "tcp".to_string()]);
        assert_eq!(control.session().unwrap().filter, "tcp");
        assert_eq!(stats.filter_swaps.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_total.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn rejected_swap_keeps_running_under_previous_filter() {
        let (worker, feed, sink, stats) = start("udp");
        let now = Utc::now();

        worker.update_filter("port (");
        feed.packet(now, b"tcp 1");
        feed.packet(now, b"udp 2");
        feed.finish();

        let control = worker.control();
        let outcome = join_within(worker, Duration::from_secs(5));

        assert!(outcome.result.is_ok());
        assert_eq!(sink.seen(), vec!["udp 2"]);
        assert_eq!(control.session().unwrap().filter, "udp");
        assert_eq!(stats.filter_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.filter_swaps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn concurrent_updates_last_write_wins() {
        let (worker, feed, sink, _stats) = start("");
        let now = Utc::now();

        worker.update_filter("tcp");
        worker.update_filter("udp");
        feed.packet(now, b"tcp 1");
        feed.packet(now, b"udp 2");
        feed.finish();

        let control = worker.control();
        join_within(worker, Duration::from_secs(5));

        assert_eq!(sink.seen(), vec!["udp 2"]);
        assert_eq!(control.session().unwrap().filter, "udp");
        assert_eq!(feed.installed_filters().last().map(String::as_str), Some("udp"));
    }

    #[test]
    fn open_failure_is_terminal() {
        let (backend, _feed) = ScriptedBackend::new();
        let worker = CaptureWorker::start(
            backend.failing_open("permission denied"),
            CaptureRequest::new("eth0", "", true),
            Collect::default(),
            Logger::shared_quiet(),
            SessionStats::new(),
        );
        let control = worker.control();
        let outcome = join_within(worker, Duration::from_secs(2));

        match outcome.result {
            Err(CaptureError::DeviceOpen { iface, reason }) => {
                assert_eq!(iface, "eth0");
                assert_eq!(reason, "permission denied");
            }
            other => panic!("expected DeviceOpen, got {:?}", other),
        }
        assert_eq!(control.state(), WorkerState::Stopped);
        assert!(control.session().is_none());
    }

    #[test]
    fn dispatch_error_ends_loop() {
        let (worker, feed, sink, _stats) = start("");
        feed.packet(Utc::now(), b"tcp 1");
        feed.fail("interface went down");

        let outcome = join_within(worker, Duration::from_secs(2));

        assert!(matches!(outcome.result, Err(CaptureError::Dispatch(ref e)) if e == "interface went down"));
        assert_eq!(sink.seen(), vec!["tcp 1"]);
    }

    #[test]
    fn session_reports_netmask_and_link_type() {
        let (worker, _feed, _sink, _stats) = start("tcp");
        let control = worker.control();
        wait_for("session", || control.session().is_some());

        let session = control.session().unwrap();
        assert_eq!(session.link_type, 1);
        assert_eq!(session.netmask.mask.to_string(), "255.255.255.0");
        assert_eq!(session.filter, "tcp");
        assert!(session.promiscuous);

        worker.stop();
        join_within(worker, Duration::from_secs(2));
    }
}
