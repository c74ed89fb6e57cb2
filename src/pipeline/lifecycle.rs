//! Camera lifecycle supervision.
//!
//! [`CameraLifecycleManager`] is the sole owner of the capture source. The rest
//! of the pipeline only ever calls [`CameraLifecycleManager::current_frame`],
//! which never surfaces device errors: it returns [`FrameUnavailable`] and
//! advances the state machine instead.
//!
//! ```text
//! Uninitialized -> Opening -> Running -> Recovering -> Running
//!                                              \-> Failed
//! ```
//!
//! Recovery never sleeps. Each call performs at most one reopen attempt and
//! records when the next one is due, so the owning worker decides how to wait
//! and stays responsive to shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{CaptureSource, Frame};
use crate::error::{CaptureError, FrameUnavailable};
use crate::{CaptureConfig, LifecycleConfig, SuspendPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Opening,
    Running,
    Recovering,
    /// Capture paused by the idle watchdog
    Suspended,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Opening => "opening",
            LifecycleState::Running => "running",
            LifecycleState::Recovering => "recovering",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Health of the device handle as seen from outside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleState {
    #[default]
    Uninitialized,
    Open,
    /// Read failures are occurring but the retry bound is not exhausted
    Degraded,
    Failed,
}

/// Published after every state change; readable from any thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub handle: HandleState,
    pub device: String,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub frames_captured: u64,
    pub recoveries: u64,
    pub last_error: Option<String>,
}

/// Shared read-only view of the manager's status.
#[derive(Clone, Default)]
pub struct LifecycleMonitor(Arc<ArcSwap<LifecycleStatus>>);

impl LifecycleMonitor {
    pub fn status(&self) -> Arc<LifecycleStatus> {
        self.0.load_full()
    }

    pub fn state(&self) -> LifecycleState {
        self.0.load().state
    }

    fn store(&self, status: LifecycleStatus) {
        self.0.store(Arc::new(status));
    }
}

pub struct CameraLifecycleManager {
    source: Box<dyn CaptureSource>,
    capture: CaptureConfig,
    config: LifecycleConfig,
    state: LifecycleState,
    /// Whether `source` currently holds an open device
    open: bool,
    consecutive_failures: u32,
    recovery_attempts: u32,
    next_attempt_at: Option<Instant>,
    frames_captured: u64,
    recoveries: u64,
    last_error: Option<String>,
    /// Upper bound on a single device read, whatever `capture.read_timeout_ms` says
    read_limit: Option<Duration>,
    monitor: LifecycleMonitor,
}

impl CameraLifecycleManager {
    pub fn new(
        source: Box<dyn CaptureSource>,
        capture: CaptureConfig,
        config: LifecycleConfig,
    ) -> Self {
        let manager = Self {
            source,
            capture,
            config,
            state: LifecycleState::Uninitialized,
            open: false,
            consecutive_failures: 0,
            recovery_attempts: 0,
            next_attempt_at: None,
            frames_captured: 0,
            recoveries: 0,
            last_error: None,
            read_limit: None,
            monitor: LifecycleMonitor::default(),
        };
        manager.publish_status();
        manager
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn handle_state(&self) -> HandleState {
        match self.state {
            LifecycleState::Uninitialized | LifecycleState::Opening => HandleState::Uninitialized,
            LifecycleState::Running if self.consecutive_failures == 0 => HandleState::Open,
            LifecycleState::Running | LifecycleState::Recovering => HandleState::Degraded,
            LifecycleState::Suspended if self.open => HandleState::Open,
            LifecycleState::Suspended => HandleState::Uninitialized,
            LifecycleState::Failed => HandleState::Failed,
        }
    }

    pub fn monitor(&self) -> LifecycleMonitor {
        self.monitor.clone()
    }

    /// Cap every device read at `limit` so the owner regains control at least that often.
    pub fn set_read_limit(&mut self, limit: Duration) {
        self.read_limit = Some(limit);
    }

    /// Timeout handed to the capture source for one read.
    pub fn read_timeout(&self) -> Duration {
        let configured = self.capture.read_timeout();
        self.read_limit
            .map_or(configured, |limit| configured.min(limit))
    }

    /// Time until the next scheduled reopen attempt, if one is pending.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Produce the next frame, or report why there is none.
    ///
    /// Transient device errors never escape: they are counted and drive the
    /// state machine, and the caller sees `FrameUnavailable`.
    pub fn current_frame(&mut self) -> Result<Frame, FrameUnavailable> {
        match self.state {
            LifecycleState::Failed | LifecycleState::Suspended => return Err(self.unavailable()),
            LifecycleState::Uninitialized | LifecycleState::Opening => self.initial_open(),
            LifecycleState::Recovering => self.attempt_recovery(Instant::now()),
            LifecycleState::Running => {}
        }
        if self.state != LifecycleState::Running {
            return Err(self.unavailable());
        }

        if !self.source.is_healthy() {
            warn!("Capture source {} reports unhealthy", self.source.name());
            self.record_error("health check failed".into());
            self.enter_recovery();
            return Err(self.unavailable());
        }

        match self.source.read_frame(self.read_timeout()) {
            Ok(frame) => {
                if self.recovery_attempts > 0 || self.consecutive_failures > 0 {
                    info!("Capture from {} healthy again", self.source.name());
                }
                self.consecutive_failures = 0;
                self.recovery_attempts = 0;
                self.frames_captured += 1;
                self.publish_status();
                Ok(frame)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                metrics::counter!("camstream_capture_failures_total").increment(1);
                warn!(
                    "Read failure {}/{} on {}: {}",
                    self.consecutive_failures,
                    self.config.failure_threshold,
                    self.source.name(),
                    e
                );
                self.record_error(e.to_string());
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.enter_recovery();
                } else {
                    self.publish_status();
                }
                Err(self.unavailable())
            }
        }
    }

    /// Drop back to `Uninitialized` with fresh counters. The only way out of `Failed`.
    pub fn reinit(&mut self) {
        info!("Reinitialising capture source {}", self.source.name());
        self.close_source();
        self.state = LifecycleState::Uninitialized;
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
        self.next_attempt_at = None;
        self.publish_status();
    }

    /// Stop capturing; releases the device when the suspend policy says so.
    pub fn suspend(&mut self) {
        if matches!(
            self.state,
            LifecycleState::Suspended | LifecycleState::Failed
        ) {
            return;
        }
        if self.config.suspend_policy == SuspendPolicy::Release
            || self.state != LifecycleState::Running
        {
            self.close_source();
            // A released device starts over with a full retry budget
            self.consecutive_failures = 0;
            self.recovery_attempts = 0;
        }
        info!(
            "Capture suspended ({})",
            if self.open { "device kept open" } else { "device released" }
        );
        self.state = LifecycleState::Suspended;
        self.next_attempt_at = None;
        self.publish_status();
    }

    pub fn resume(&mut self) {
        if self.state != LifecycleState::Suspended {
            return;
        }
        self.state = if self.open {
            LifecycleState::Running
        } else {
            LifecycleState::Uninitialized
        };
        info!("Capture resumed");
        self.publish_status();
    }

    /// Release the device for good.
    pub fn shutdown(&mut self) {
        self.close_source();
        if self.state != LifecycleState::Failed {
            self.state = LifecycleState::Uninitialized;
        }
        self.publish_status();
    }

    #[instrument(skip(self), fields(source = self.source.name()))]
    fn initial_open(&mut self) {
        self.state = LifecycleState::Opening;
        self.publish_status();
        match self.source.open(&self.capture) {
            Ok(()) => {
                info!("Capture source {} opened", self.source.name());
                self.open = true;
                self.state = LifecycleState::Running;
                self.publish_status();
            }
            Err(e) => {
                error!("Failed to open capture source: {}", e);
                self.record_error(e.to_string());
                self.state = LifecycleState::Recovering;
                self.schedule_next_attempt(Instant::now());
            }
        }
    }

    /// Close the handle and schedule the first reopen after a backoff.
    fn enter_recovery(&mut self) {
        self.close_source();
        self.state = LifecycleState::Recovering;
        self.consecutive_failures = 0;
        self.schedule_next_attempt(Instant::now());
        warn!(
            "Capture source {} entering recovery (attempt {} of {})",
            self.source.name(),
            self.recovery_attempts + 1,
            self.config.max_recovery_attempts
        );
    }

    fn attempt_recovery(&mut self, now: Instant) {
        if self.recovery_attempts >= self.config.max_recovery_attempts {
            self.fail();
            return;
        }
        if self.next_attempt_at.is_some_and(|at| now < at) {
            return;
        }

        self.recovery_attempts += 1;
        debug!(
            "Reopen attempt {}/{}",
            self.recovery_attempts, self.config.max_recovery_attempts
        );
        match self.source.open(&self.capture) {
            Ok(()) => {
                info!(
                    "Capture source {} reopened after {} attempt(s)",
                    self.source.name(),
                    self.recovery_attempts
                );
                self.open = true;
                self.recoveries += 1;
                metrics::counter!("camstream_recoveries_total").increment(1);
                self.state = LifecycleState::Running;
                self.next_attempt_at = None;
                self.publish_status();
            }
            Err(e) => {
                let e = match e {
                    CaptureError::DeviceUnavailable { .. } => e,
                    other => CaptureError::unavailable(self.source.name(), other),
                };
                warn!("Reopen failed: {}", e);
                self.record_error(e.to_string());
                if self.recovery_attempts >= self.config.max_recovery_attempts {
                    self.fail();
                } else {
                    self.schedule_next_attempt(now);
                }
            }
        }
    }

    fn fail(&mut self) {
        error!(
            "Capture source {} failed after {} recovery attempts: {}",
            self.source.name(),
            self.recovery_attempts,
            self.last_error.as_deref().unwrap_or("unknown error")
        );
        self.close_source();
        self.state = LifecycleState::Failed;
        self.next_attempt_at = None;
        self.publish_status();
    }

    fn schedule_next_attempt(&mut self, now: Instant) {
        self.next_attempt_at = Some(now + self.config.backoff(self.recovery_attempts + 1));
        self.publish_status();
    }

    fn close_source(&mut self) {
        if self.open {
            self.source.close();
            self.open = false;
        }
    }

    fn record_error(&mut self, error: String) {
        self.last_error = Some(error);
    }

    fn unavailable(&self) -> FrameUnavailable {
        FrameUnavailable { state: self.state }
    }

    fn publish_status(&self) {
        self.monitor.store(LifecycleStatus {
            state: self.state,
            handle: self.handle_state(),
            device: self.source.name().to_string(),
            consecutive_failures: self.consecutive_failures,
            recovery_attempts: self.recovery_attempts,
            frames_captured: self.frames_captured,
            recoveries: self.recoveries,
            last_error: self.last_error.clone(),
        });
    }
}

impl Drop for CameraLifecycleManager {
    fn drop(&mut self) {
        self.close_source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternSource;

    fn manager(config: LifecycleConfig) -> CameraLifecycleManager {
        let capture = CaptureConfig {
            width: 4,
            height: 4,
            ..Default::default()
        };
        CameraLifecycleManager::new(Box::new(TestPatternSource::new()), capture, config)
    }

    #[test]
    fn first_call_opens_and_reads() {
        let mut manager = manager(LifecycleConfig::default());
        assert_eq!(manager.state(), LifecycleState::Uninitialized);
        let frame = manager.current_frame().unwrap();
        assert_eq!(frame.sequence(), 1);
        assert_eq!(manager.state(), LifecycleState::Running);
        assert_eq!(manager.handle_state(), HandleState::Open);
        assert_eq!(manager.monitor().status().frames_captured, 1);
    }

    #[test]
    fn suspend_release_reopens_on_resume() {
        let mut manager = manager(LifecycleConfig {
            suspend_policy: SuspendPolicy::Release,
            ..Default::default()
        });
        manager.current_frame().unwrap();
        manager.suspend();
        assert_eq!(manager.state(), LifecycleState::Suspended);
        assert_eq!(manager.handle_state(), HandleState::Uninitialized);
        assert!(manager.current_frame().is_err());

        manager.resume();
        assert_eq!(manager.state(), LifecycleState::Uninitialized);
        assert!(manager.current_frame().is_ok());
    }

    #[test]
    fn suspend_keep_open_resumes_running() {
        let mut manager = manager(LifecycleConfig {
            suspend_policy: SuspendPolicy::KeepOpen,
            ..Default::default()
        });
        manager.current_frame().unwrap();
        manager.suspend();
        assert_eq!(manager.handle_state(), HandleState::Open);
        manager.resume();
        assert_eq!(manager.state(), LifecycleState::Running);
        // the pattern source keeps its sequence across a kept-open suspension
        assert_eq!(manager.current_frame().unwrap().sequence(), 2);
    }
}
