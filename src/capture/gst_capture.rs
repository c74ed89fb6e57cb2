//! GStreamer capture: any launch pipeline that ends in an appsink.

use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::CaptureSource;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;
use crate::CaptureConfig;

const APPSINK: &str = "appsink";

struct Running {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

/// GStreamer-backed capture source
pub struct GstCapture {
    running: Option<Running>,
    label: String,
    sequence: u64,
}

impl GstCapture {
    pub fn new() -> Self {
        Self {
            running: None,
            label: "gstreamer".into(),
            sequence: 0,
        }
    }

    /// Build the launch line: the configured pipeline verbatim, or a v4l2src chain
    fn build_pipeline_string(config: &CaptureConfig) -> Result<String, CaptureError> {
        if let Some(custom) = &config.pipeline {
            if !custom.contains(&format!("name={APPSINK}")) {
                return Err(CaptureError::unavailable(
                    "gstreamer",
                    format!("custom pipeline must end in `appsink name={APPSINK}`"),
                ));
            }
            return Ok(custom.clone());
        }

        let device = match config.device.trim().parse::<u32>() {
            Ok(index) => format!("/dev/video{index}"),
            Err(_) if config.device.eq_ignore_ascii_case("auto") => "/dev/video0".into(),
            Err(_) => config.device.clone(),
        };
        let (width, height, fps) = (config.width, config.height, config.fps);

        let pipeline = match config.format {
            PixelFormat::Mjpeg => format!(
                "v4l2src device={device} name=source ! \
                 image/jpeg,width={width},height={height},framerate={fps}/1 ! \
                 queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
                 appsink name={APPSINK}"
            ),
            PixelFormat::Yuyv4 | PixelFormat::Rgb24 => format!(
                "v4l2src device={device} name=source ! \
                 video/x-raw,format=YUY2,width={width},height={height},framerate={fps}/1 ! \
                 queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
                 videoconvert ! video/x-raw,format=RGB ! \
                 appsink name={APPSINK}"
            ),
            other => {
                return Err(CaptureError::unavailable(
                    device,
                    format!("unsupported pixel format: {other:?}"),
                ))
            }
        };
        Ok(pipeline)
    }

    fn sample_to_frame(
        &mut self,
        sample: gst::Sample,
        timestamp: Instant,
    ) -> Result<Frame, CaptureError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::read("sample contains no buffer"))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::read("failed to map buffer"))?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::read("sample has no caps"))?;
        let structure = caps
            .structure(0)
            .ok_or_else(|| CaptureError::read("caps missing structure"))?;

        let (format, width, height) = match structure.name().as_str() {
            "video/x-raw" => {
                let info = gst_video::VideoInfo::from_caps(caps)
                    .map_err(|_| CaptureError::read("failed to parse video info from caps"))?;
                let format = match info.format() {
                    gst_video::VideoFormat::Rgb => PixelFormat::Rgb24,
                    gst_video::VideoFormat::Bgr => PixelFormat::Bgr24,
                    gst_video::VideoFormat::Yuy2 => PixelFormat::Yuyv4,
                    other => {
                        return Err(CaptureError::read(format!("unsupported raw format {other:?}")))
                    }
                };
                (format, info.width(), info.height())
            }
            name @ ("image/jpeg" | "video/x-h264") => {
                let dim = |field: &str| structure.get::<i32>(field).unwrap_or(0).max(0) as u32;
                let format = if name == "image/jpeg" {
                    PixelFormat::Mjpeg
                } else {
                    PixelFormat::H264
                };
                (format, dim("width"), dim("height"))
            }
            other => return Err(CaptureError::read(format!("unsupported caps {other}"))),
        };

        self.sequence += 1;
        Ok(Frame {
            data,
            meta: std::sync::Arc::new(FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                stride: format.bytes_per_pixel().map_or(0, |bpp| width * bpp),
                format,
                device_timestamp: buffer.pts().map(|pts| pts.into()),
            }),
            timestamp,
        })
    }
}

impl Default for GstCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for GstCapture {
    fn name(&self) -> &str {
        &self.label
    }

    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.close();
        let fail = |reason: String| CaptureError::unavailable("gstreamer", reason);

        gst::init().map_err(|e| fail(format!("failed to initialize GStreamer: {e}")))?;

        let pipeline_str = Self::build_pipeline_string(config)?;
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| fail(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| fail("launch line is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name(APPSINK)
            .ok_or_else(|| fail("failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| fail("failed to cast to AppSink".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 2u32);
        appsink.set_property("drop", true); // latest frame wins
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| fail(format!("failed to start pipeline: {e:?}")))?;

        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) => info!("Pipeline started successfully"),
            Ok(gst::StateChangeSuccess::Async) => info!("Pipeline starting asynchronously"),
            Ok(gst::StateChangeSuccess::NoPreroll) => debug!("Live pipeline, no preroll"),
            Err(_) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(fail("pipeline failed to reach PLAYING".into()));
            }
        }

        self.label = config
            .pipeline
            .as_ref()
            .map_or_else(|| format!("gstreamer:{}", config.device), |_| "gstreamer:custom".into());
        self.running = Some(Running { pipeline, appsink });
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let timestamp = Instant::now();
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| CaptureError::read("pipeline not started"))?;

        let clock = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let sample = running.appsink.try_pull_sample(clock);
        let eos = sample.is_none() && running.appsink.is_eos();
        match sample {
            Some(sample) => self.sample_to_frame(sample, timestamp),
            None if eos => Err(CaptureError::read("pipeline reached EOS")),
            None => Err(CaptureError::timed_out(timeout)),
        }
    }

    fn close(&mut self) {
        if let Some(running) = self.running.take() {
            info!("Stopping GStreamer pipeline");
            if let Err(e) = running.pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
    }

    fn is_healthy(&self) -> bool {
        let Some(running) = &self.running else {
            return true;
        };
        if running.appsink.is_eos() {
            return false;
        }
        let Some(bus) = running.pipeline.bus() else {
            return true;
        };
        match bus.pop_filtered(&[gst::MessageType::Error]) {
            Some(msg) => {
                if let gst::MessageView::Error(err) = msg.view() {
                    warn!("Pipeline error: {}", err.error());
                }
                false
            }
            None => true,
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_pipeline_requires_named_appsink() {
        let config = CaptureConfig {
            pipeline: Some("videotestsrc ! fakesink".into()),
            ..Default::default()
        };
        assert!(GstCapture::build_pipeline_string(&config).is_err());
    }

    #[test]
    fn index_device_expands_to_node() {
        let config = CaptureConfig {
            device: "1".into(),
            ..Default::default()
        };
        let launch = GstCapture::build_pipeline_string(&config).unwrap();
        assert!(launch.starts_with("v4l2src device=/dev/video1"));
        assert!(launch.contains("image/jpeg"));
    }
}
