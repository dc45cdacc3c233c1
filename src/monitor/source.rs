//! Capture backends.
//!
//! The worker talks to a capture device only through [`CaptureBackend`] and
//! [`CaptureHandle`]. [`PcapBackend`] is the libpcap implementation used by
//! the binary; [`ScriptedBackend`] is an in-memory device whose reads block
//! until a packet is fed or an interrupt arrives, used to exercise stop and
//! filter hot-swap without a real interface.

use crate::monitor::config::{CAPTURE_TIMEOUT, SNAPLEN};
use crate::monitor::types::Netmask;
use chrono::{DateTime, TimeZone, Utc};
use get_if_addrs::{get_if_addrs, IfAddr};
use pcap::{Activated, BreakLoop, Capture, Device};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// One frame handed out by a capture handle.
#[derive(Debug, Clone, Copy)]
pub struct CapturedPacket<'a> {
    /// Capture timestamp from the packet header.
    pub timestamp: DateTime<Utc>,
    /// Captured bytes (may be shorter than `wire_len`).
    pub data:      &'a [u8],
    /// Original length on the wire.
    pub wire_len:  u32,
    /// DLT link type of the handle that produced the frame.
    pub link_type: i32,
}

/// Result of one dispatch call on a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// This many packets were passed to the callback.
    Delivered(usize),
    /// The read timed out with nothing to deliver.
    Idle,
    /// The read was broken by an [`Interrupter`].
    Interrupted,
    /// The source has no more packets (end of a capture file).
    Exhausted,
}

/// Breaks an in-progress blocking read on a handle, from any thread.
///
/// An interrupt issued while no read is in progress is remembered and breaks
/// the next read instead, so it can never be lost.
pub trait Interrupter: Send + Sync {
    fn interrupt(&self);
}

/// An open capture handle. Owned by exactly one thread.
pub trait CaptureHandle {
    /// A compiled filter program. Dropping it releases it.
    type Program;

    fn link_type(&self) -> i32;

    /// A handle that can break this capture's blocking reads.
    fn interrupter(&mut self) -> Box<dyn Interrupter>;

    /// Compiles `expression` without touching the installed filter.
    fn compile(&self, expression: &str, netmask: Netmask, optimize: bool)
        -> Result<Self::Program, String>;

    /// Installs a program previously returned by [`CaptureHandle::compile`].
    fn install(&mut self, expression: &str, program: &Self::Program, optimize: bool)
        -> Result<(), String>;

    /// Blocks until at least one packet is delivered, the read times out,
    /// an interrupt arrives, or the source is exhausted.
    fn dispatch(&mut self, deliver: &mut dyn FnMut(CapturedPacket<'_>))
        -> Result<Dispatch, String>;
}

/// Opens capture handles. Moved onto the capture thread, so it must be `Send`.
pub trait CaptureBackend: Send + 'static {
    type Handle: CaptureHandle;

    fn open(&self, interface: &str, promiscuous: bool) -> Result<Self::Handle, String>;

    fn netmask(&self, interface: &str) -> Result<Netmask, String>;
}

// ── libpcap ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum PcapMode {
    Live,
    Offline(PathBuf),
}

/// libpcap backend for live interfaces or pcap file replay.
#[derive(Debug, Clone)]
pub struct PcapBackend {
    mode: PcapMode,
}

impl PcapBackend {
    pub fn live() -> Self {
        Self { mode: PcapMode::Live }
    }

    pub fn offline(path: impl Into<PathBuf>) -> Self {
        Self { mode: PcapMode::Offline(path.into()) }
    }

    /// Name of libpcap's default capture device.
    pub fn default_device() -> Result<String, String> {
        let dev = Device::lookup()
            .map_err(|e| format!("pcap device lookup failed: {}", e))?
            .ok_or_else(|| "No capture device found".to_string())?;
        Ok(dev.name)
    }
}

impl CaptureBackend for PcapBackend {
    type Handle = PcapHandle;

    fn open(&self, interface: &str, promiscuous: bool) -> Result<PcapHandle, String> {
        let cap: Capture<dyn Activated> = match &self.mode {
            PcapMode::Live => Capture::from_device(interface)
                .map_err(|e| e.to_string())?
                .promisc(promiscuous)
                .snaplen(SNAPLEN)
                .timeout(CAPTURE_TIMEOUT.as_millis() as i32)
                .open()
                .map_err(|e| e.to_string())?
                .into(),
            PcapMode::Offline(path) => Capture::from_file(path)
                .map_err(|e| format!("{}: {}", path.display(), e))?
                .into(),
        };

        let link_type = cap.get_datalink().0;
        Ok(PcapHandle {
            cap,
            link_type,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    fn netmask(&self, interface: &str) -> Result<Netmask, String> {
        if let PcapMode::Offline(_) = self.mode {
            return Ok(Netmask::default());
        }

        let ifaces = get_if_addrs().map_err(|e| e.to_string())?;
        ifaces
            .iter()
            .filter(|iface| iface.name == interface)
            .find_map(|iface| match &iface.addr {
                IfAddr::V4(v4) => Some(Netmask {
                    net:  Ipv4Addr::from(u32::from(v4.ip) & u32::from(v4.netmask)),
                    mask: v4.netmask,
                }),
                IfAddr::V6(_) => None,
            })
            .ok_or_else(|| format!("no IPv4 address on '{}'", interface))
    }
}

/// An open libpcap capture, live or offline.
pub struct PcapHandle {
    cap:         Capture<dyn Activated>,
    link_type:   i32,
    /// Set by [`PcapInterrupter`] so a `PCAP_ERROR_BREAK` can be told apart
    /// from end-of-file on offline captures.
    interrupted: Arc<AtomicBool>,
}

struct PcapInterrupter {
    breaker: Mutex<BreakLoop>,
    flag:    Arc<AtomicBool>,
}

impl Interrupter for PcapInterrupter {
    fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(breaker) = self.breaker.lock() {
            breaker.breakloop();
        }
    }
}

impl CaptureHandle for PcapHandle {
    type Program = pcap::BpfProgram;

    fn link_type(&self) -> i32 {
        self.link_type
    }

    fn interrupter(&mut self) -> Box<dyn Interrupter> {
        Box::new(PcapInterrupter {
            breaker: Mutex::new(self.cap.breakloop_handle()),
            flag:    Arc::clone(&self.interrupted),
        })
    }

    // The Rust binding compiles with a zero netmask; only `ip broadcast`
    // style primitives depend on it, so the resolved value is informational.
    fn compile(&self, expression: &str, _netmask: Netmask, optimize: bool)
        -> Result<pcap::BpfProgram, String>
    {
        self.cap.compile(expression, optimize).map_err(|e| e.to_string())
    }

    // `Capture::filter` takes an expression, not a program, so the verified
    // program is dropped and libpcap compiles the expression a second time.
    fn install(&mut self, expression: &str, _program: &pcap::BpfProgram, optimize: bool)
        -> Result<(), String>
    {
        self.cap.filter(expression, optimize).map_err(|e| e.to_string())
    }

    fn dispatch(&mut self, deliver: &mut dyn FnMut(CapturedPacket<'_>))
        -> Result<Dispatch, String>
    {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = &packet.header.ts;
                let nanos = (ts.tv_usec as i64).clamp(0, 999_999) as u32 * 1_000;
                let timestamp = Utc
                    .timestamp_opt(ts.tv_sec as i64, nanos)
                    .single()
                    .unwrap_or_else(Utc::now);
                deliver(CapturedPacket {
                    timestamp,
                    data: packet.data,
                    wire_len: packet.header.len,
                    link_type: self.link_type,
                });
                Ok(Dispatch::Delivered(1))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Dispatch::Idle),
            // libpcap reports both breakloop and end-of-file this way.
            Err(pcap::Error::NoMorePackets) => {
                if self.interrupted.swap(false, Ordering::SeqCst) {
                    Ok(Dispatch::Interrupted)
                } else {
                    Ok(Dispatch::Exhausted)
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

// ── Scripted in-memory device ────────────────────────────────────────────────

enum Message {
    Packet(DateTime<Utc>, Vec<u8>),
    Wake,
    Fail(String),
    End,
}

/// In-memory capture device driven by a [`ScriptedFeed`].
///
/// Frames are arbitrary byte strings whose first word (up to the first space)
/// acts as the protocol name. A filter expression is a list of protocol names
/// joined by ` or `; an empty expression matches everything. Reads block
/// until the feed sends something, so an idle device stays blocked until
/// interrupted, just like a quiet interface.
pub struct ScriptedBackend {
    rx:        Mutex<Option<Receiver<Message>>>,
    wake:      Sender<Message>,
    installs:  Arc<Mutex<Vec<String>>>,
    open_err:  Option<String>,
    netmask:   Result<Netmask, String>,
    link_type: i32,
}

/// Test-side handle feeding a [`ScriptedBackend`].
#[derive(Clone)]
pub struct ScriptedFeed {
    tx:       Sender<Message>,
    installs: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, ScriptedFeed) {
        let (tx, rx) = mpsc::channel();
        let installs = Arc::new(Mutex::new(Vec::new()));
        let backend = Self {
            rx:        Mutex::new(Some(rx)),
            wake:      tx.clone(),
            installs:  Arc::clone(&installs),
            open_err:  None,
            netmask:   Ok(Netmask {
                net:  Ipv4Addr::new(192, 168, 1, 0),
                mask: Ipv4Addr::new(255, 255, 255, 0),
            }),
            link_type: 1,
        };
        (backend, ScriptedFeed { tx, installs })
    }

    /// Make `open` fail with `reason`.
    pub fn failing_open(mut self, reason: &str) -> Self {
        self.open_err = Some(reason.to_string());
        self
    }

    /// Make the netmask lookup fail with `reason`.
    pub fn failing_netmask(mut self, reason: &str) -> Self {
        self.netmask = Err(reason.to_string());
        self
    }
}

impl ScriptedFeed {
    /// Queues one frame; returns `false` once the device is gone.
    pub fn packet(&self, at: DateTime<Utc>, data: &[u8]) -> bool {
        self.tx.send(Message::Packet(at, data.to_vec())).is_ok()
    }

    /// Makes the next read fail with a fatal dispatch error.
    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Message::Fail(reason.to_string()));
    }

    /// Marks the end of the stream, like reaching the end of a capture file.
    pub fn finish(&self) {
        let _ = self.tx.send(Message::End);
    }

    /// Filter expressions installed on the device so far, in order.
    pub fn installed_filters(&self) -> Vec<String> {
        self.installs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

/// Open handle of a [`ScriptedBackend`].
pub struct ScriptedHandle {
    rx:        Receiver<Message>,
    wake:      Sender<Message>,
    installs:  Arc<Mutex<Vec<String>>>,
    active:    Vec<String>,
    link_type: i32,
}

struct ScriptedInterrupter(Mutex<Sender<Message>>);

impl Interrupter for ScriptedInterrupter {
    fn interrupt(&self) {
        if let Ok(tx) = self.0.lock() {
            let _ = tx.send(Message::Wake);
        }
    }
}

impl CaptureBackend for ScriptedBackend {
    type Handle = ScriptedHandle;

    fn open(&self, _interface: &str, _promiscuous: bool) -> Result<ScriptedHandle, String> {
        if let Some(reason) = &self.open_err {
            return Err(reason.clone());
        }
        let rx = self
            .rx
            .lock()
            .map_err(|_| "device lock poisoned".to_string())?
            .take()
            .ok_or_else(|| "device already open".to_string())?;
        Ok(ScriptedHandle {
            rx,
            wake: self.wake.clone(),
            installs: Arc::clone(&self.installs),
            active: Vec::new(),
            link_type: self.link_type,
        })
    }

    fn netmask(&self, _interface: &str) -> Result<Netmask, String> {
        self.netmask.clone()
    }
}

impl CaptureHandle for ScriptedHandle {
    type Program = Vec<String>;

    fn link_type(&self) -> i32 {
        self.link_type
    }

    fn interrupter(&mut self) -> Box<dyn Interrupter> {
        Box::new(ScriptedInterrupter(Mutex::new(self.wake.clone())))
    }

    fn compile(&self, expression: &str, _netmask: Netmask, _optimize: bool)
        -> Result<Vec<String>, String>
    {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(Vec::new());
        }
        expression
            .split(" or ")
            .map(|word| {
                let word = word.trim();
                if !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric()) {
                    Ok(word.to_string())
                } else {
                    Err(format!("syntax error near '{}'", word))
                }
            })
            .collect()
    }

    fn install(&mut self, expression: &str, program: &Vec<String>, _optimize: bool)
        -> Result<(), String>
    {
        self.active = program.clone();
        if let Ok(mut installs) = self.installs.lock() {
            installs.push(expression.to_string());
        }
        Ok(())
    }

    fn dispatch(&mut self, deliver: &mut dyn FnMut(CapturedPacket<'_>))
        -> Result<Dispatch, String>
    {
        loop {
            match self.rx.recv() {
                Ok(Message::Packet(at, data)) => {
                    let proto = data.split(|b| *b == b' ').next().unwrap_or_default();
                    let accepted = self.active.is_empty()
                        || self.active.iter().any(|w| w.as_bytes() == proto);
                    if !accepted {
                        continue;
                    }
                    deliver(CapturedPacket {
                        timestamp: at,
                        data: &data,
                        wire_len: data.len() as u32,
                        link_type: self.link_type,
                    });
                    return Ok(Dispatch::Delivered(1));
                }
                Ok(Message::Wake) => return Ok(Dispatch::Interrupted),
                Ok(Message::Fail(reason)) => return Err(reason),
                Ok(Message::End) | Err(_) => return Ok(Dispatch::Exhausted),
            }
        }
    }
}
