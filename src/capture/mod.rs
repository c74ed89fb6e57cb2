//! Capture sources: the only code that talks to camera hardware.

pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod synthetic;
pub mod v4l2;

use std::time::Duration;

pub use frame::{Frame, FrameMetadata, PixelFormat};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstCapture;
pub use synthetic::TestPatternSource;
pub use v4l2::V4l2Capture;

use crate::error::CaptureError;
use crate::{CaptureBackend, CaptureConfig};

/// A camera, real or simulated.
///
/// Implementations own their device handle. `open` may be called again after
/// `close` (the lifecycle manager recycles handles this way), and `close` must
/// be idempotent. `read_frame` must return within `timeout`; a timeout is
/// reported as [`CaptureError::ReadFailed`].
pub trait CaptureSource: Send {
    /// Short label used in logs
    fn name(&self) -> &str;

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    fn close(&mut self);

    /// Out-of-band health signal, e.g. the device node disappeared.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Pick the capture backend named in the configuration.
pub fn build_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, CaptureError> {
    match config.backend {
        CaptureBackend::V4l2 => Ok(Box::new(V4l2Capture::new())),
        CaptureBackend::Test => Ok(Box::new(TestPatternSource::new())),
        #[cfg(feature = "gstreamer-pipeline")]
        CaptureBackend::Gstreamer => Ok(Box::new(GstCapture::new())),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        CaptureBackend::Gstreamer => Err(CaptureError::unavailable(
            &config.device,
            "built without the gstreamer-pipeline feature",
        )),
    }
}
