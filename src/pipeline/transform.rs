//! Frame transforms applied between capture and the relay.
//!
//! Every stage is a pure `&Frame -> Frame` function. A failing stage never
//! aborts the pipeline: depending on [`ErrorPolicy`] its input either flows on
//! to the next stage untouched or the whole frame is dropped.

use std::io::Cursor;
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};
use tracing::{debug, warn};

use crate::capture::decoder::{self, Rgb};
use crate::capture::{Frame, PixelFormat};
use crate::error::TransformError;
use crate::{ErrorPolicy, Resolution, StreamEncoding, TransformConfig};

pub trait FrameTransform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, frame: &Frame) -> Result<Frame, TransformError>;
}

/// Convert any raw or MJPEG frame to RGB24.
pub struct Decode;

impl FrameTransform for Decode {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn apply(&self, frame: &Frame) -> Result<Frame, TransformError> {
        if frame.format() == PixelFormat::Rgb24 {
            rgb_view(frame, self.name())?;
            return Ok(frame.clone());
        }
        let Rgb {
            pixels,
            width,
            height,
        } = decoder::decode_frame(&frame.data, frame.format(), frame.meta.width, frame.meta.height)?;
        Ok(frame.with_data(pixels, width, height, PixelFormat::Rgb24))
    }
}

pub struct Resize {
    pub target: Resolution,
    pub filter: FilterType,
}

impl Resize {
    pub fn new(target: Resolution) -> Self {
        Self {
            target,
            filter: FilterType::Triangle,
        }
    }
}

impl FrameTransform for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn apply(&self, frame: &Frame) -> Result<Frame, TransformError> {
        let image = rgb_view(frame, self.name())?;
        let Resolution { width, height } = self.target;
        if image.dimensions() == (width, height) {
            return Ok(frame.clone());
        }
        let resized = imageops::resize(&image, width, height, self.filter);
        Ok(frame.with_data(resized.into_raw(), width, height, PixelFormat::Rgb24))
    }
}

/// Border plus a progress bar that advances with the frame sequence, so a
/// viewer can tell a live stream from a frozen one at a glance.
pub struct Annotate {
    pub color: [u8; 3],
}

impl Default for Annotate {
    fn default() -> Self {
        Self {
            color: [255, 64, 0],
        }
    }
}

impl FrameTransform for Annotate {
    fn name(&self) -> &'static str {
        "annotate"
    }

    fn apply(&self, frame: &Frame) -> Result<Frame, TransformError> {
        let mut image = rgb_view(frame, self.name())?;
        let (width, height) = image.dimensions();
        let pixel = image::Rgb(self.color);
        let border = 2u32.min(width / 2).min(height / 2);

        for y in 0..height {
            for x in 0..width {
                if x < border || y < border || x >= width - border || y >= height - border {
                    image.put_pixel(x, y, pixel);
                }
            }
        }

        let bar_height = 4u32.min(height.saturating_sub(2 * border));
        let bar_len = (frame.sequence() % 64) as u32 * width.saturating_sub(2 * border) / 63;
        let bar_top = height - border - bar_height;
        for y in bar_top..bar_top + bar_height {
            for x in border..border + bar_len.min(width - 2 * border) {
                image.put_pixel(x, y, pixel);
            }
        }

        Ok(frame.with_data(image.into_raw(), width, height, PixelFormat::Rgb24))
    }
}

/// Quality-bounded JPEG encode. MJPEG input passes through unless re-encoding is asked for.
pub struct JpegEncode {
    pub quality: u8,
    pub reencode_mjpeg: bool,
}

impl FrameTransform for JpegEncode {
    fn name(&self) -> &'static str {
        "jpeg-encode"
    }

    fn apply(&self, frame: &Frame) -> Result<Frame, TransformError> {
        if frame.data.is_empty() {
            return Err(TransformError::encode(self.name(), "empty buffer"));
        }
        if frame.format() == PixelFormat::Mjpeg {
            if !frame.data.starts_with(&[0xFF, 0xD8]) {
                return Err(TransformError::encode(self.name(), "missing JPEG SOI marker"));
            }
            if !self.reencode_mjpeg {
                return Ok(frame.clone());
            }
        }

        let Rgb {
            pixels,
            width,
            height,
        } = decoder::decode_frame(&frame.data, frame.format(), frame.meta.width, frame.meta.height)
            .map_err(|e| TransformError::encode(self.name(), e))?;

        let mut out = Cursor::new(Vec::with_capacity(pixels.len() / 8));
        JpegEncoder::new_with_quality(&mut out, self.quality.clamp(1, 100))
            .encode(&pixels, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| TransformError::encode(self.name(), e))?;

        Ok(frame.with_data(out.into_inner(), width, height, PixelFormat::Mjpeg))
    }
}

fn rgb_view(frame: &Frame, stage: &'static str) -> Result<RgbImage, TransformError> {
    if frame.format() != PixelFormat::Rgb24 {
        return Err(TransformError::encode(
            stage,
            format!("expected rgb24 input, got {:?}", frame.format()),
        ));
    }
    RgbImage::from_raw(frame.meta.width, frame.meta.height, frame.data.to_vec())
        .filter(|_| frame.expected_len() == Some(frame.data.len()))
        .ok_or_else(|| {
            TransformError::encode(
                stage,
                format!(
                    "{} bytes do not match {}x{}",
                    frame.data.len(),
                    frame.meta.width,
                    frame.meta.height
                ),
            )
        })
}

/// Ordered chain of transforms with a shared failure policy.
pub struct TransformPipeline {
    stages: Vec<Box<dyn FrameTransform>>,
    policy: ErrorPolicy,
}

impl TransformPipeline {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            stages: Vec::new(),
            policy,
        }
    }

    pub fn with_stage(mut self, stage: impl FrameTransform + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// decode → resize → annotate → encode, skipping whatever is not configured.
    ///
    /// H.264 streams are already encoded by the capture backend, so they get no stages.
    pub fn from_config(config: &TransformConfig, encoding: StreamEncoding) -> Self {
        let mut pipeline = Self::new(config.on_error);
        if encoding == StreamEncoding::H264 {
            return pipeline;
        }
        if config.resize.is_some() || config.annotate {
            pipeline = pipeline.with_stage(Decode);
        }
        if let Some(target) = config.resize {
            pipeline = pipeline.with_stage(Resize::new(target));
        }
        if config.annotate {
            pipeline = pipeline.with_stage(Annotate::default());
        }
        pipeline.with_stage(JpegEncode {
            quality: config.jpeg_quality,
            reencode_mjpeg: config.reencode_mjpeg,
        })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage; `None` means the frame was dropped.
    pub fn apply(&self, frame: Frame) -> Option<Frame> {
        let started = Instant::now();
        let mut current = frame;
        for stage in &self.stages {
            match stage.apply(&current) {
                Ok(next) => current = next,
                Err(e) => {
                    metrics::counter!("camstream_transform_errors_total", "stage" => stage.name())
                        .increment(1);
                    match self.policy {
                        ErrorPolicy::PassThrough => {
                            debug!("Frame {}: {} (passing through)", current.sequence(), e);
                        }
                        ErrorPolicy::Drop => {
                            warn!("Frame {}: {} (dropped)", current.sequence(), e);
                            metrics::counter!("camstream_frames_dropped_total").increment(1);
                            return None;
                        }
                    }
                }
            }
        }
        metrics::histogram!("camstream_transform_time_us")
            .record(started.elapsed().as_micros() as f64);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMetadata;

    fn rgb_frame(width: u32, height: u32) -> Frame {
        Frame::new(
            vec![128u8; (width * height * 3) as usize],
            FrameMetadata {
                sequence: 1,
                width,
                height,
                stride: width * 3,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            },
        )
    }

    #[test]
    fn encodes_rgb_to_jpeg() {
        let stage = JpegEncode {
            quality: 80,
            reencode_mjpeg: false,
        };
        let jpeg = stage.apply(&rgb_frame(16, 8)).unwrap();
        assert_eq!(jpeg.format(), PixelFormat::Mjpeg);
        assert!(jpeg.data.starts_with(&[0xFF, 0xD8]));
        assert_eq!((jpeg.meta.width, jpeg.meta.height), (16, 8));
        assert_eq!(jpeg.sequence(), 1);
    }

    #[test]
    fn reencode_round_trips_through_decode() {
        let first = JpegEncode {
            quality: 90,
            reencode_mjpeg: false,
        }
        .apply(&rgb_frame(16, 16))
        .unwrap();
        let again = JpegEncode {
            quality: 20,
            reencode_mjpeg: true,
        }
        .apply(&first)
        .unwrap();
        assert!(again.data.starts_with(&[0xFF, 0xD8]));
        assert_ne!(again.data, first.data);
    }

    #[test]
    fn resize_changes_dimensions() {
        let resized = Resize::new(Resolution {
            width: 4,
            height: 2,
        })
        .apply(&rgb_frame(8, 4))
        .unwrap();
        assert_eq!((resized.meta.width, resized.meta.height), (4, 2));
        assert_eq!(resized.data.len(), 4 * 2 * 3);
    }

    #[test]
    fn annotate_paints_border() {
        let annotated = Annotate::default().apply(&rgb_frame(8, 8)).unwrap();
        assert_eq!(&annotated.data[..3], &[255, 64, 0]);
        assert_eq!(annotated.data.len(), 8 * 8 * 3);
    }

    #[test]
    fn pixel_stages_reject_compressed_input() {
        let mjpeg = rgb_frame(2, 2).with_data(vec![0xFFu8, 0xD8, 0xFF], 2, 2, PixelFormat::Mjpeg);
        assert!(Resize::new(Resolution {
            width: 1,
            height: 1
        })
        .apply(&mjpeg)
        .is_err());
        assert!(Annotate::default().apply(&mjpeg).is_err());
    }

    #[test]
    fn config_builds_expected_stages() {
        let plain = TransformPipeline::from_config(&TransformConfig::default(), StreamEncoding::Jpeg);
        assert_eq!(plain.stage_names(), vec!["jpeg-encode"]);

        let full = TransformPipeline::from_config(
            &TransformConfig {
                resize: Some(Resolution {
                    width: 320,
                    height: 240,
                }),
                annotate: true,
                ..Default::default()
            },
            StreamEncoding::Jpeg,
        );
        assert_eq!(
            full.stage_names(),
            vec!["decode", "resize", "annotate", "jpeg-encode"]
        );

        let h264 = TransformPipeline::from_config(&TransformConfig::default(), StreamEncoding::H264);
        assert!(h264.stage_names().is_empty());
    }

    #[test]
    fn empty_buffer_follows_policy() {
        let empty = rgb_frame(4, 4).with_data(Vec::<u8>::new(), 4, 4, PixelFormat::Mjpeg);
        let config = TransformConfig {
            annotate: true,
            ..Default::default()
        };

        let drop = TransformPipeline::from_config(
            &TransformConfig {
                on_error: ErrorPolicy::Drop,
                ..config.clone()
            },
            StreamEncoding::Jpeg,
        );
        assert!(drop.apply(empty.clone()).is_none());

        let pass = TransformPipeline::from_config(&config, StreamEncoding::Jpeg);
        let out = pass.apply(empty.clone()).unwrap();
        assert!(out.data.is_empty());
        assert_eq!(out.meta, empty.meta);
    }
}
