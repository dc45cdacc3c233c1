//! Error taxonomy shared by the capture, statistics and persistence layers.

use std::io;

use thiserror::Error;

/// Fatal capture failures. Each one ends the capture loop and is reported to
/// the worker's owner exactly once.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture device '{iface}': {reason}")]
    DeviceOpen { iface: String, reason: String },

    #[error("packet dispatch failed: {0}")]
    Dispatch(String),

    #[error("capture thread panicked")]
    WorkerPanicked,
}

/// Filter compile/install failures. Never fatal: the previously installed
/// filter stays in effect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("failed to compile filter '{expression}': {reason}")]
    Compile { expression: String, reason: String },

    #[error("failed to install filter '{expression}': {reason}")]
    Install { expression: String, reason: String },
}

/// Session persistence failures. The in-memory session and any previously
/// written file are left untouched so the save can be retried.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures reading a persisted session document back.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid session document: {0}")]
    Parse(#[from] serde_json::Error),
}
