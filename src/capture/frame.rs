use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be handed between stages without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    H264,
}

impl PixelFormat {
    /// Bytes per pixel for packed raw formats
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg | PixelFormat::H264 => None,
        }
    }
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    /// Build the next stage's frame: new payload, same sequence and capture time.
    pub fn with_data(
        &self,
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        let stride = format.bytes_per_pixel().map_or(0, |bpp| width * bpp);
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                width,
                height,
                stride,
                format,
                ..(*self.meta).clone()
            }),
            timestamp: self.timestamp,
        }
    }

    /// Expected payload length for raw formats, `None` for compressed ones.
    pub fn expected_len(&self) -> Option<usize> {
        self.meta
            .format
            .bytes_per_pixel()
            .map(|bpp| (self.meta.width * self.meta.height * bpp) as usize)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("size", &(self.meta.width, self.meta.height))
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_data_keeps_identity() {
        let raw = Frame::new(
            vec![0u8; 4 * 2 * 3],
            FrameMetadata {
                sequence: 7,
                width: 4,
                height: 2,
                stride: 12,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            },
        );
        let encoded = raw.with_data(vec![0xFFu8, 0xD8], 4, 2, PixelFormat::Mjpeg);
        assert_eq!(encoded.sequence(), 7);
        assert_eq!(encoded.timestamp, raw.timestamp);
        assert_eq!(encoded.meta.stride, 0);
        assert_eq!(raw.expected_len(), Some(24));
        assert_eq!(encoded.expected_len(), None);
    }
}
