//! Error taxonomy for the capture-and-stream pipeline.
//!
//! Each stage owns its failure type. None of them are meant to escape to the
//! process boundary: device errors are absorbed by the lifecycle manager,
//! transform errors by the transform pipeline, and session errors end only
//! the session that produced them.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::lifecycle::LifecycleState;

/// Errors raised by a [`CaptureSource`](crate::capture::CaptureSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

impl CaptureError {
    pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    pub fn read(reason: impl ToString) -> Self {
        Self::ReadFailed(reason.to_string())
    }

    /// Reads that hit the caller's deadline are reported as ordinary read failures.
    pub fn timed_out(after: Duration) -> Self {
        Self::ReadFailed(format!("timed out after {} ms", after.as_millis()))
    }
}

/// Returned by `CameraLifecycleManager::current_frame` while no frame can be produced.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no frame available (camera {state})")]
pub struct FrameUnavailable {
    pub state: LifecycleState,
}

/// A transform stage rejected a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("{stage}: encode failed: {reason}")]
    EncodeFailed { stage: &'static str, reason: String },
}

impl TransformError {
    pub fn encode(stage: &'static str, reason: impl ToString) -> Self {
        Self::EncodeFailed {
            stage,
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    #[error("no new frame within {0:?}")]
    Timeout(Duration),
    #[error("frame relay closed")]
    Closed,
}

/// Why a stream session stopped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("shutdown requested")]
    ShutdownRequested,
    #[error("camera failed")]
    CameraFailed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
