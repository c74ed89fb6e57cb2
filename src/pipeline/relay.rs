//! Latest-wins frame hand-off between the capture worker and stream sessions.
//!
//! The slot holds one frame and a version counter behind a `tokio::sync::watch`
//! channel. Publishing overwrites the slot and wakes every waiter; a waiter
//! wakes only once the version moves past the one it last consumed, so a slow
//! reader skips frames instead of queueing them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tokio::sync::watch;
use tracing::trace;

use super::watchdog::IdleWatchdog;
use crate::capture::Frame;
use crate::error::RelayError;

#[derive(Clone, Default)]
struct RelaySlot {
    version: u64,
    frame: Option<Frame>,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    dropped: AtomicU64,
    waits: AtomicU64,
}

pub struct FrameRelay {
    slot: watch::Sender<RelaySlot>,
    watchdog: Arc<IdleWatchdog>,
    stats: CachePadded<Stats>,
}

impl FrameRelay {
    pub fn new(watchdog: Arc<IdleWatchdog>) -> Self {
        let (slot, _) = watch::channel(RelaySlot::default());
        Self {
            slot,
            watchdog,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Overwrite the slot with `frame` and return its version. Never blocks on consumers.
    pub fn publish(&self, frame: Frame) -> u64 {
        let mut version = 0;
        self.slot.send_modify(|slot| {
            slot.version += 1;
            slot.frame = Some(frame);
            version = slot.version;
        });
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_published_total").increment(1);
        trace!(version, "published frame");
        version
    }

    /// Wait for a frame newer than `since`.
    ///
    /// Returns immediately when the slot already holds a newer frame. Every call
    /// counts as consumer demand for the idle watchdog.
    pub async fn wait_for_next(
        &self,
        since: u64,
        timeout: Duration,
    ) -> Result<(Frame, u64), RelayError> {
        self.watchdog.on_activity();
        self.stats.waits.fetch_add(1, Ordering::Relaxed);

        let mut rx = self.slot.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|slot| slot.version > since && slot.frame.is_some()),
        )
        .await;

        match waited {
            Err(_) => Err(RelayError::Timeout(timeout)),
            Ok(Err(_)) => Err(RelayError::Closed),
            Ok(Ok(slot)) => match &slot.frame {
                Some(frame) => Ok((frame.clone(), slot.version)),
                None => Err(RelayError::Closed),
            },
        }
    }

    pub fn version(&self) -> u64 {
        self.slot.borrow().version
    }

    /// Latest frame without waiting, if any has been published.
    pub fn latest(&self) -> Option<(Frame, u64)> {
        let slot = self.slot.borrow();
        slot.frame.clone().map(|frame| (frame, slot.version))
    }

    pub fn published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    /// Count a frame the producer discarded before publishing.
    pub fn record_drop(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn waits(&self) -> u64 {
        self.stats.waits.load(Ordering::Relaxed)
    }

    pub fn watchdog(&self) -> &Arc<IdleWatchdog> {
        &self.watchdog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::pipeline::watchdog::Activity;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            vec![sequence as u8; 4],
            FrameMetadata {
                sequence,
                width: 2,
                height: 1,
                stride: 0,
                format: PixelFormat::Mjpeg,
                device_timestamp: None,
            },
        )
    }

    fn relay() -> FrameRelay {
        FrameRelay::new(Arc::new(IdleWatchdog::new(None)))
    }

    #[tokio::test]
    async fn waits_time_out_on_empty_slot() {
        let relay = relay();
        let result = relay.wait_for_next(0, Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), RelayError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn newer_frame_is_returned_immediately() {
        let relay = relay();
        assert_eq!(relay.publish(frame(1)), 1);
        assert_eq!(relay.publish(frame(2)), 2);
        let (latest, version) = relay
            .wait_for_next(0, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(latest.sequence(), 2);
    }

    #[tokio::test]
    async fn current_version_blocks_until_publish() {
        let relay = Arc::new(relay());
        relay.publish(frame(1));
        assert!(relay.wait_for_next(1, Duration::from_millis(20)).await.is_err());

        let waiter = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.wait_for_next(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.publish(frame(2));
        let (next, version) = waiter.await.unwrap().unwrap();
        assert_eq!((next.sequence(), version), (2, 2));
    }

    #[tokio::test]
    async fn waiting_counts_as_demand() {
        let watchdog = Arc::new(IdleWatchdog::new(Some(Duration::from_millis(50))));
        let relay = FrameRelay::new(watchdog.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(watchdog.check_idle(), Activity::Idle);
        let _ = relay.wait_for_next(0, Duration::from_millis(1)).await;
        assert_eq!(relay.waits(), 1);
        assert_eq!(watchdog.check_idle(), Activity::Active);
    }
}
