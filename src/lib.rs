pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use error::ConfigError;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variables override file values, e.g. `CAMSTREAM__CAPTURE__FPS=15`.
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub lifecycle: LifecycleConfig,
    pub transform: TransformConfig,
    pub idle: IdleConfig,
    pub stream: StreamConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    V4l2,
    Gstreamer,
    /// Synthetic test pattern, no hardware required
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// Device index (`0`), path (`/dev/video2`) or `auto`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Full GStreamer launch line ending in `appsink name=appsink`
    pub pipeline: Option<String>,
    pub read_timeout_ms: u64,
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

/// What the capture worker does once the camera manager reaches `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the service and exit non-zero.
    FailFast,
    /// Reinitialise the manager every `retry_interval_ms`, forever.
    RetrySlowly,
}

/// Whether an idle suspension keeps the device open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuspendPolicy {
    KeepOpen,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Consecutive read failures before the handle is recycled
    pub failure_threshold: u32,
    /// Reopen attempts before the manager gives up and reports `Failed`
    pub max_recovery_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub on_failure: FailurePolicy,
    pub retry_interval_ms: u64,
    pub suspend_policy: SuspendPolicy,
}

impl LifecycleConfig {
    /// Delay before reopen attempt number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_initial_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// What happens to a frame when a transform stage fails on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Hand the stage's input to the next stage unchanged
    PassThrough,
    /// Discard the frame; nothing is published for this tick
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub resize: Option<Resolution>,
    pub jpeg_quality: u8,
    pub annotate: bool,
    /// Re-encode MJPEG frames from the device at `jpeg_quality`
    pub reencode_mjpeg: bool,
    pub on_error: ErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Suspend capture after this long without a consumer; 0 disables
    pub timeout_ms: u64,
}

impl IdleConfig {
    pub fn threshold(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEncoding {
    Jpeg,
    H264,
}

impl StreamEncoding {
    pub fn mime(self) -> &'static str {
        match self {
            StreamEncoding::Jpeg => "image/jpeg",
            StreamEncoding::H264 => "video/h264",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub path: String,
    pub boundary: String,
    pub encoding: StreamEncoding,
    pub keepalive_ms: u64,
}

impl StreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Upper bound on how long any loop goes without checking for shutdown
    pub poll_interval_ms: u64,
    /// Pin the capture worker to this CPU core
    pub pin_core: Option<usize>,
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::V4l2,
            device: "auto".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            pipeline: None,
            read_timeout_ms: 1_000,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            max_recovery_attempts: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 8_000,
            on_failure: FailurePolicy::RetrySlowly,
            retry_interval_ms: 30_000,
            suspend_policy: SuspendPolicy::Release,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            resize: None,
            jpeg_quality: 85,
            annotate: false,
            reencode_mjpeg: false,
            on_error: ErrorPolicy::PassThrough,
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: "/video_feed".into(),
            boundary: "frame".into(),
            encoding: StreamEncoding::Jpeg,
            keepalive_ms: 1_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".into(),
            poll_interval_ms: 250,
            pin_core: None,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMSTREAM__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.into()));
        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture resolution must be non-zero");
        }
        if self.capture.fps == 0 {
            return invalid("capture.fps must be at least 1");
        }
        if self.capture.read_timeout_ms == 0 || self.capture.read_timeout_ms > 1_000 {
            return invalid("capture.read_timeout_ms must be within 1..=1000");
        }
        if self.lifecycle.failure_threshold == 0 {
            return invalid("lifecycle.failure_threshold must be at least 1");
        }
        if !(1..=100).contains(&self.transform.jpeg_quality) {
            return invalid("transform.jpeg_quality must be within 1..=100");
        }
        if let Some(size) = self.transform.resize {
            if size.width == 0 || size.height == 0 {
                return invalid("transform.resize must be non-zero");
            }
        }
        if !self.stream.path.starts_with('/') {
            return invalid("stream.path must start with '/'");
        }
        if matches!(self.stream.path.as_str(), "/" | "/frame.jpg" | "/status") {
            return invalid("stream.path collides with a built-in route");
        }
        if self.stream.keepalive_ms == 0 {
            return invalid("stream.keepalive_ms must be non-zero");
        }
        // Waiting sessions only count as demand once per keepalive
        if self.idle.timeout_ms > 0 && self.stream.keepalive_ms >= self.idle.timeout_ms {
            return invalid("stream.keepalive_ms must be below idle.timeout_ms");
        }
        if self.stream.boundary.is_empty() {
            return invalid("stream.boundary must not be empty");
        }
        if self.server.poll_interval_ms == 0 || self.server.poll_interval_ms > 1_000 {
            return invalid("server.poll_interval_ms must be within 1..=1000");
        }
        Ok(())
    }
}

/// Snapshot of pipeline counters, served at `/status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub frames_published: u64,
    pub frames_dropped: u64,
    pub current_version: u64,
    pub active_sessions: usize,
    pub idle: bool,
    pub camera: pipeline::lifecycle::LifecycleStatus,
}
