//! Per-client stream sessions.
//!
//! A session waits on the relay, wraps each new frame in a multipart part and
//! writes it to the client's channel. It ends on the first failed write, on
//! shutdown, or when the camera is gone for good under the fail-fast policy.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::capture::Frame;
use crate::error::{RelayError, SessionEnd};
use crate::pipeline::{FrameRelay, LifecycleMonitor, LifecycleState};
use crate::{FailurePolicy, StreamConfig};

/// Multipart framing shared by every session.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    pub boundary: String,
    pub mime: &'static str,
}

impl StreamFormat {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            boundary: config.boundary.clone(),
            mime: config.encoding.mime(),
        }
    }

    /// Value for the response `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// `--boundary\r\nContent-Type: mime\r\n\r\n<bytes>\r\n`
    pub fn chunk(&self, frame: &Frame) -> Bytes {
        let mut part =
            BytesMut::with_capacity(frame.data.len() + self.boundary.len() + self.mime.len() + 24);
        part.put_slice(b"--");
        part.put_slice(self.boundary.as_bytes());
        part.put_slice(b"\r\nContent-Type: ");
        part.put_slice(self.mime.as_bytes());
        part.put_slice(b"\r\n\r\n");
        part.put_slice(&frame.data);
        part.put_slice(b"\r\n");
        part.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub format: StreamFormat,
    /// How long a session waits for a frame before re-checking its client
    pub keepalive: Duration,
    pub on_failure: FailurePolicy,
}

#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("camstream_sessions_active").set(active as f64);
        SessionGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Counts a session as active until dropped.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let active = self.registry.active.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("camstream_sessions_active").set(active as f64);
    }
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: u64,
    pub last_version: u64,
    pub open: bool,
    pub created_at: Instant,
    pub frames_sent: u64,
}

pub struct StreamSession {
    ctx: SessionContext,
    relay: Arc<FrameRelay>,
    monitor: LifecycleMonitor,
    settings: Arc<SessionSettings>,
    cancel: CancellationToken,
    _guard: SessionGuard,
}

impl StreamSession {
    /// Start a session at the relay's current version, so only frames
    /// published after it joined are delivered.
    pub fn new(
        relay: Arc<FrameRelay>,
        registry: &Arc<SessionRegistry>,
        monitor: LifecycleMonitor,
        settings: Arc<SessionSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self::starting_at(relay.version(), relay, registry, monitor, settings, cancel)
    }

    pub fn starting_at(
        last_version: u64,
        relay: Arc<FrameRelay>,
        registry: &Arc<SessionRegistry>,
        monitor: LifecycleMonitor,
        settings: Arc<SessionSettings>,
        cancel: CancellationToken,
    ) -> Self {
        let guard = registry.register();
        Self {
            ctx: SessionContext {
                id: guard.id,
                last_version,
                open: true,
                created_at: Instant::now(),
                frames_sent: 0,
            },
            relay,
            monitor,
            settings,
            cancel,
            _guard: guard,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Stream frames into `client` until the session ends.
    pub async fn run(mut self, client: mpsc::Sender<Bytes>) -> SessionEnd {
        debug!(session = self.ctx.id, version = self.ctx.last_version, "Session started");
        let end = self.stream_into(&client).await;
        self.ctx.open = false;

        let lifetime = self.ctx.created_at.elapsed();
        match end {
            SessionEnd::ClientDisconnected => debug!(
                session = self.ctx.id,
                frames = self.ctx.frames_sent,
                "Client disconnected after {:?}",
                lifetime
            ),
            other => info!(
                session = self.ctx.id,
                frames = self.ctx.frames_sent,
                "Session ended: {}",
                other
            ),
        }
        end
    }

    async fn stream_into(&mut self, client: &mpsc::Sender<Bytes>) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::ShutdownRequested,
                _ = client.closed() => return SessionEnd::ClientDisconnected,
                next = self.relay.wait_for_next(self.ctx.last_version, self.settings.keepalive) => next,
            };

            match next {
                Ok((frame, version)) => {
                    let part = self.settings.format.chunk(&frame);
                    let written = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return SessionEnd::ShutdownRequested,
                        written = client.send(part) => written,
                    };
                    if written.is_err() {
                        return SessionEnd::ClientDisconnected;
                    }
                    if version > self.ctx.last_version + 1 {
                        trace!(
                            session = self.ctx.id,
                            skipped = version - self.ctx.last_version - 1,
                            "Slow consumer skipped frames"
                        );
                    }
                    self.ctx.last_version = version;
                    self.ctx.frames_sent += 1;
                }
                Err(RelayError::Timeout(_)) => {
                    if self.settings.on_failure == FailurePolicy::FailFast
                        && self.monitor.state() == LifecycleState::Failed
                    {
                        return SessionEnd::CameraFailed;
                    }
                    trace!(session = self.ctx.id, "No new frame, waiting again");
                }
                Err(RelayError::Closed) => return SessionEnd::ShutdownRequested,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::StreamEncoding;

    #[test]
    fn chunk_layout_matches_multipart() {
        let format = StreamFormat::from_config(&StreamConfig::default());
        let frame = Frame::new(
            vec![1u8, 2, 3],
            FrameMetadata {
                sequence: 1,
                width: 1,
                height: 1,
                stride: 0,
                format: PixelFormat::Mjpeg,
                device_timestamp: None,
            },
        );
        assert_eq!(
            &format.chunk(&frame)[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\x01\x02\x03\r\n"
        );
        assert_eq!(
            format.content_type(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }

    #[test]
    fn h264_uses_video_mime() {
        let format = StreamFormat::from_config(&StreamConfig {
            encoding: StreamEncoding::H264,
            ..Default::default()
        });
        assert_eq!(format.mime, "video/h264");
    }

    #[test]
    fn registry_tracks_guards() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.register();
        let second = registry.register();
        assert_eq!(registry.active(), 2);
        assert_ne!(first.id, second.id);
        drop(first);
        assert_eq!(registry.active(), 1);
    }
}
