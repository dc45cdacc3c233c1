//! pktpulse: live packet capture with per-second traffic statistics and
//! adaptive anomaly scoring.
//!
//! The pipeline runs leaves first:
//!
//! - [`monitor::filter`] compiles and installs BPF expressions on an open handle.
//! - [`monitor::worker`] owns the capture handle on a dedicated thread and
//!   supports interrupt-driven stop and filter hot-swap.
//! - [`stats`] buckets decoded packets per second, finalizes each bucket
//!   exactly once and persists sessions as JSON.
//! - [`anomaly`] scores every finalized second against its own recent history.

pub mod anomaly;
pub mod error;
pub mod logger;
pub mod monitor;
pub mod stats;

pub use anomaly::{AnomalyEngine, AnomalyEvent, FeatureSnapshot};
pub use error::{CaptureError, FilterError, LoadError, PersistError};
pub use logger::{Event, Logger, SharedLogger};
pub use monitor::worker::{CaptureOutcome, CaptureWorker, WorkerControl};
pub use monitor::{Monitor, MonitorConfig, SessionReport};
pub use stats::{StatsAggregator, StatsConfig};
