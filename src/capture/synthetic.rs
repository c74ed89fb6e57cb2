//! Synthetic camera producing a moving colour gradient.

use std::time::{Duration, Instant};

use tracing::debug;

use super::CaptureSource;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;
use crate::CaptureConfig;

pub struct TestPatternSource {
    size: Option<(u32, u32)>,
    sequence: u64,
    started: Instant,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            size: None,
            sequence: 0,
            started: Instant::now(),
        }
    }

    fn render(width: u32, height: u32, sequence: u64) -> Vec<u8> {
        let shift = (sequence * 4 % 256) as u32;
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let r = ((x * 255 / width.max(1)) + shift) % 256;
                let g = (y * 255 / height.max(1)) % 256;
                let b = (255 + shift - r) % 256;
                pixels.extend_from_slice(&[r as u8, g as u8, b as u8]);
            }
        }
        pixels
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if config.width == 0 || config.height == 0 {
            return Err(CaptureError::unavailable(self.name(), "zero-sized pattern"));
        }
        debug!("Test pattern {}x{}", config.width, config.height);
        self.size = Some((config.width, config.height));
        Ok(())
    }

    fn read_frame(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        let (width, height) = self
            .size
            .ok_or_else(|| CaptureError::read("test pattern not opened"))?;
        self.sequence += 1;
        Ok(Frame::new(
            Self::render(width, height, self.sequence),
            FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                stride: width * 3,
                format: PixelFormat::Rgb24,
                device_timestamp: Some(self.started.elapsed()),
            },
        ))
    }

    fn close(&mut self) {
        self.size = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_configured_size() {
        let mut source = TestPatternSource::new();
        let config = CaptureConfig {
            width: 8,
            height: 4,
            ..Default::default()
        };
        source.open(&config).unwrap();
        let first = source.read_frame(Duration::from_millis(1)).unwrap();
        let second = source.read_frame(Duration::from_millis(1)).unwrap();
        assert_eq!(first.data.len(), 8 * 4 * 3);
        assert_eq!(first.expected_len(), Some(first.data.len()));
        assert_eq!(second.sequence(), first.sequence() + 1);
        assert_ne!(first.data, second.data);

        source.close();
        assert!(source.read_frame(Duration::from_millis(1)).is_err());
    }
}
