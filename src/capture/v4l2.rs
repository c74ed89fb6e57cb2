//! V4L2 capture over memory-mapped buffers

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::CaptureSource;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;
use crate::utils::{self, FoundDevice};
use crate::CaptureConfig;

/// V4L2 camera. Holds no device until `open` is called.
pub struct V4l2Capture {
    // Declared before `device` so the stream is torn down first.
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    found: Option<FoundDevice>,
    width: u32,
    height: u32,
    sequence: u64,
    healthy: bool,
}

impl V4l2Capture {
    pub fn new() -> Self {
        Self {
            stream: None,
            device: None,
            found: None,
            width: 0,
            height: 0,
            sequence: 0,
            healthy: true,
        }
    }

    fn device_label(&self) -> &str {
        self.found.as_ref().map_or("v4l2", |found| found.path.as_str())
    }

    fn resolve(config: &CaptureConfig) -> Result<FoundDevice, CaptureError> {
        let device = config.device.trim();
        if device.eq_ignore_ascii_case("auto") {
            return utils::auto_detect_device()
                .map_err(|e| CaptureError::unavailable("auto", e));
        }
        let path = match device.parse::<u32>() {
            Ok(index) => format!("/dev/video{index}"),
            Err(_) => device.to_string(),
        };
        Ok(FoundDevice::new(path, config.format))
    }
}

impl Default for V4l2Capture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for V4l2Capture {
    fn name(&self) -> &str {
        self.device_label()
    }

    #[instrument(skip(self, config), fields(device = %config.device))]
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.close();

        let found = Self::resolve(config)?;
        let path = found.path.clone();
        let unavailable = |e: io::Error| CaptureError::unavailable(&path, e);

        let device = Device::with_path(&path).map_err(unavailable)?;

        let caps = device.query_caps().map_err(unavailable)?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::unavailable(
                &path,
                "device doesn't support video capture",
            ));
        }

        let fourcc = match found.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(CaptureError::unavailable(
                    &path,
                    format!("unsupported pixel format {other:?}"),
                ))
            }
        };

        let mut fmt = device.format().map_err(unavailable)?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc;
        let actual = device.set_format(&fmt).map_err(unavailable)?;
        if actual.fourcc != fourcc {
            return Err(CaptureError::unavailable(
                &path,
                format!("driver refused {fourcc}, offered {}", actual.fourcc),
            ));
        }
        if actual.width != config.width || actual.height != config.height {
            warn!(
                "Requested {}x{}, driver chose {}x{}",
                config.width, config.height, actual.width, actual.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Could not set frame rate to {}: {}", config.fps, e);
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(unavailable)?;
        info!(
            "Capture stream started on {} with {} buffers",
            path, config.buffer_count
        );

        self.width = actual.width;
        self.height = actual.height;
        self.found = Some(found);
        self.device = Some(device);
        self.stream = Some(stream);
        self.healthy = true;
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let timestamp = Instant::now();
        let format = self
            .found
            .as_ref()
            .map_or(PixelFormat::Mjpeg, |found| found.format);

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::read("stream not started"))?;
        stream.set_timeout(timeout);

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Err(CaptureError::timed_out(timeout));
            }
            Err(e) => {
                // ENODEV and friends: the handle will not recover on its own
                self.healthy = false;
                return Err(CaptureError::read(e));
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let data = bytes::Bytes::copy_from_slice(&buf[..used]);
        self.sequence += 1;

        Ok(Frame {
            data,
            meta: std::sync::Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                stride: format.bytes_per_pixel().map_or(0, |bpp| self.width * bpp),
                format,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            }),
            timestamp,
        })
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed capture stream on {}", self.device_label());
        }
        self.device = None;
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_device_maps_to_node() {
        let config = CaptureConfig {
            device: "2".into(),
            ..Default::default()
        };
        let found = V4l2Capture::resolve(&config).unwrap();
        assert_eq!(found.path, "/dev/video2");
        assert_eq!(found.format, PixelFormat::Mjpeg);
    }

    #[test]
    fn read_before_open_fails() {
        let mut cam = V4l2Capture::new();
        assert!(matches!(
            cam.read_frame(Duration::from_millis(10)),
            Err(CaptureError::ReadFailed(_))
        ));
    }

    #[test]
    #[ignore]
    fn capture_one() {
        let mut cam = V4l2Capture::new();
        cam.open(&CaptureConfig::default()).expect("open");
        let frame = cam.read_frame(Duration::from_secs(2)).expect("frame");
        assert!(!frame.data.is_empty());
        cam.close();
    }
}
