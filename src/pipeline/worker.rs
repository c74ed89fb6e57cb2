//! The capture worker: the single producer feeding the relay.
//!
//! Runs on a dedicated OS thread because device reads block. It owns the
//! lifecycle manager outright, so nothing else can touch the camera handle.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use super::lifecycle::{CameraLifecycleManager, LifecycleState};
use super::relay::FrameRelay;
use super::transform::TransformPipeline;
use super::watchdog::Activity;
use crate::{Config, FailurePolicy};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Minimum spacing between published frames
    pub frame_interval: Duration,
    /// Longest stretch between shutdown checks
    pub poll_interval: Duration,
    pub on_failure: FailurePolicy,
    pub retry_interval: Duration,
    pub pin_core: Option<usize>,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_interval: config.capture.frame_interval(),
            poll_interval: config.server.poll_interval(),
            on_failure: config.lifecycle.on_failure,
            retry_interval: config.lifecycle.retry_interval(),
            pin_core: config.server.pin_core,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    /// The camera reached `Failed` under the fail-fast policy
    CameraFailed { frames_published: u64 },
}

pub struct CaptureWorker {
    manager: CameraLifecycleManager,
    pipeline: TransformPipeline,
    relay: Arc<FrameRelay>,
    cancel: CancellationToken,
    settings: WorkerSettings,
    frames_published: u64,
}

impl CaptureWorker {
    /// Device reads are capped at the poll interval so shutdown is never stuck behind one.
    pub fn new(
        mut manager: CameraLifecycleManager,
        pipeline: TransformPipeline,
        relay: Arc<FrameRelay>,
        cancel: CancellationToken,
        settings: WorkerSettings,
    ) -> Self {
        manager.set_read_limit(settings.poll_interval);
        Self {
            manager,
            pipeline,
            relay,
            cancel,
            settings,
            frames_published: 0,
        }
    }

    pub fn spawn(self) -> io::Result<thread::JoinHandle<WorkerExit>> {
        thread::Builder::new()
            .name("capture-worker".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> WorkerExit {
        if let Some(core) = self.settings.pin_core {
            pin_to_core(core);
        }
        let span = info_span!("capture.worker", stages = ?self.pipeline.stage_names());
        let _guard = span.enter();
        info!("Capture worker started");

        let exit = self.capture_loop();
        self.manager.shutdown();
        info!(
            "Capture worker stopped after {} frames ({:?})",
            self.frames_published, exit
        );
        exit
    }

    fn capture_loop(&mut self) -> WorkerExit {
        let watchdog = self.relay.watchdog().clone();

        while !self.cancel.is_cancelled() {
            if watchdog.check_idle() == Activity::Idle {
                self.manager.suspend();
                watchdog.set_suspended(true);
                info!(
                    "No consumers for {:?}, capture suspended",
                    watchdog.threshold().unwrap_or_default()
                );
                while !self.cancel.is_cancelled()
                    && watchdog.wait_for_demand(self.settings.poll_interval) == Activity::Idle
                {}
                watchdog.set_suspended(false);
                if self.cancel.is_cancelled() {
                    break;
                }
                self.manager.resume();
                continue;
            }

            let started = Instant::now();
            match self.manager.current_frame() {
                Ok(frame) => {
                    match self.pipeline.apply(frame) {
                        Some(frame) => {
                            self.relay.publish(frame);
                            self.frames_published += 1;
                        }
                        None => self.relay.record_drop(),
                    }
                    let spent = started.elapsed();
                    if let Some(rest) = self.settings.frame_interval.checked_sub(spent) {
                        self.sleep(rest);
                    }
                }
                Err(unavailable) if unavailable.state == LifecycleState::Failed => {
                    match self.settings.on_failure {
                        FailurePolicy::FailFast => {
                            error!("Camera failed and policy is fail-fast, stopping capture");
                            return WorkerExit::CameraFailed {
                                frames_published: self.frames_published,
                            };
                        }
                        FailurePolicy::RetrySlowly => {
                            warn!(
                                "Camera failed, reinitialising in {:?}",
                                self.settings.retry_interval
                            );
                            if !self.sleep(self.settings.retry_interval) {
                                break;
                            }
                            self.manager.reinit();
                        }
                    }
                }
                Err(_) => {
                    if let Some(delay) = self.manager.retry_delay() {
                        self.sleep(delay);
                    }
                }
            }
        }
        WorkerExit::Shutdown
    }

    /// Sleep in poll-sized slices; `false` if shutdown was requested meanwhile.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(self.settings.poll_interval));
        }
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .is_some_and(core_affinity::set_for_current);
    if pinned {
        info!("Capture worker pinned to core {}", core);
    } else {
        warn!("Could not pin capture worker to core {}", core);
    }
}
